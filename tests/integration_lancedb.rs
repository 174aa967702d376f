#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

/// Integration tests for the LanceDB vector store with realistic repository data
use review_rag::database::{
    ChunkKind, DocumentFilter, IndexedDocument, LanceVectorStore, SearchQuery, VectorIndex,
};
use review_rag::embeddings::sparse;
use tempfile::TempDir;

/// nomic-embed-text dimension
const DIMENSIONS: usize = 768;

async fn create_test_store() -> (LanceVectorStore, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = LanceVectorStore::new(&temp_dir.path().join("vectors"))
        .await
        .expect("should create vector store");
    (store, temp_dir)
}

/// Deterministic pseudo-random unit-scale vector, distinct per seed
fn realistic_vector(seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..DIMENSIONS)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 2000) as f32 / 1000.0 - 1.0
        })
        .collect()
}

fn realistic_document(source: &str, function: &str, seed: u64) -> IndexedDocument {
    let content =
        format!("pub fn {function}(input: &str) -> Result<(), Error> {{\n    todo(input)\n}}");
    let mut document = IndexedDocument::code(source, content, 10, 12);
    document.identifier = Some(function.to_string());
    document.package_name = Some(format!(
        "crate::{}",
        source
            .trim_start_matches("src/")
            .trim_end_matches(".rs")
            .replace('/', "::")
    ));
    document.sparse = Some(sparse::encode(&document.content));
    document.vector = realistic_vector(seed);
    document
}

fn corpus() -> Vec<IndexedDocument> {
    let modules = ["auth/session", "auth/token", "billing/invoice", "billing/tax", "http/router"];
    let mut documents = Vec::new();
    for (m, module) in modules.iter().enumerate() {
        for f in 0..20 {
            let seed = (m * 20 + f) as u64 + 1;
            let source = format!("src/{module}.rs");
            let mut document =
                realistic_document(&source, &format!("handle_{f}"), seed);
            // Distinct line ranges keep chunk ids unique within a file
            document.line_start = 10 + f as u32 * 5;
            document.line_end = document.line_start + 2;
            document.id = review_rag::database::vector::chunk_id(
                &source,
                document.line_start,
                document.line_end,
            );
            documents.push(document);
        }
    }
    documents
}

#[tokio::test]
async fn realistic_collection_search() {
    let (store, _temp_dir) = create_test_store().await;
    let documents = corpus();
    let target = documents[42].clone();

    let written = store
        .add_documents("repo-acme-widgets-nomic", documents)
        .await
        .expect("can store documents");
    assert_eq!(written, 100);
    assert_eq!(
        store.count("repo-acme-widgets-nomic").await.expect("can count"),
        100
    );

    let results = store
        .similarity_search(
            "repo-acme-widgets-nomic",
            &SearchQuery {
                vector: target.vector.clone(),
                sparse: None,
                k: 5,
                filter: None,
            },
        )
        .await
        .expect("can search");

    assert_eq!(results.len(), 5);
    assert_eq!(results[0].document.id, target.id);
    assert!(results[0].score > 0.99, "exact match scores {}", results[0].score);
    assert!(
        results.windows(2).all(|pair| pair[0].score >= pair[1].score),
        "results are ordered by score"
    );
    assert_eq!(results[0].document.identifier, target.identifier);
    assert_eq!(results[0].document.package_name, target.package_name);
}

#[tokio::test]
async fn filtered_search_stays_within_the_filter() {
    let (store, _temp_dir) = create_test_store().await;
    store
        .add_documents("repo-acme-widgets-nomic", corpus())
        .await
        .expect("can store documents");

    let results = store
        .similarity_search(
            "repo-acme-widgets-nomic",
            &SearchQuery {
                vector: realistic_vector(500),
                sparse: None,
                k: 50,
                filter: Some(DocumentFilter::Sources(vec![
                    "src/billing/invoice.rs".to_string(),
                    "src/billing/tax.rs".to_string(),
                ])),
            },
        )
        .await
        .expect("can search");

    assert_eq!(results.len(), 40);
    assert!(
        results
            .iter()
            .all(|scored| scored.document.source.starts_with("src/billing/"))
    );
}

#[tokio::test]
async fn lexical_matches_are_promoted_in_hybrid_search() {
    let (store, _temp_dir) = create_test_store().await;
    let mut documents: Vec<IndexedDocument> = (0..6)
        .map(|i| realistic_document(&format!("src/module_{i}.rs"), &format!("generic_{i}"), 7))
        .collect();
    let special = realistic_document("src/ledger.rs", "reconcile_ledger_entries", 900);
    documents.push(special.clone());
    store
        .add_documents("repo-hybrid", documents)
        .await
        .expect("can store documents");

    let query_text = "reconcile_ledger_entries";
    let dense_only = store
        .similarity_search(
            "repo-hybrid",
            &SearchQuery {
                vector: realistic_vector(7),
                sparse: None,
                k: 2,
                filter: None,
            },
        )
        .await
        .expect("can search");
    assert!(dense_only.iter().all(|scored| scored.document.id != special.id));

    let hybrid = store
        .similarity_search(
            "repo-hybrid",
            &SearchQuery {
                vector: realistic_vector(7),
                sparse: Some(sparse::encode(query_text)),
                k: 2,
                filter: None,
            },
        )
        .await
        .expect("can search");
    assert_eq!(hybrid[0].document.id, special.id);
}

#[tokio::test]
async fn collections_are_isolated() {
    let (store, _temp_dir) = create_test_store().await;
    store
        .add_documents("repo-a", vec![realistic_document("src/a.rs", "only_in_a", 1)])
        .await
        .expect("can store in a");
    store
        .add_documents(
            "repo-b",
            vec![
                realistic_document("src/b.rs", "only_in_b", 2),
                IndexedDocument {
                    vector: realistic_vector(3),
                    ..IndexedDocument::arch("src", "Sources.".to_string(), "hash".to_string(), 1)
                },
            ],
        )
        .await
        .expect("can store in b");

    assert_eq!(store.count("repo-a").await.expect("can count"), 1);
    assert_eq!(store.count("repo-b").await.expect("can count"), 2);

    let arch = store
        .find("repo-b", &DocumentFilter::arch_for("src"), 10)
        .await
        .expect("can find");
    assert_eq!(arch.len(), 1);
    assert_eq!(arch[0].chunk_kind, ChunkKind::Arch);
    assert_eq!(arch[0].content_hash.as_deref(), Some("hash"));

    store.drop_collection("repo-a").await.expect("can drop");
    assert_eq!(store.count("repo-a").await.expect("can count"), 0);
    assert_eq!(store.count("repo-b").await.expect("can count"), 2);
}

#[tokio::test]
async fn deleting_a_file_removes_only_its_chunks() {
    let (store, _temp_dir) = create_test_store().await;
    store
        .add_documents("repo-acme-widgets-nomic", corpus())
        .await
        .expect("can store documents");

    store
        .delete_by_filter(
            "repo-acme-widgets-nomic",
            &DocumentFilter::Source("src/http/router.rs".to_string()),
        )
        .await
        .expect("can delete");

    assert_eq!(
        store.count("repo-acme-widgets-nomic").await.expect("can count"),
        80
    );
    let remaining = store
        .find(
            "repo-acme-widgets-nomic",
            &DocumentFilter::Source("src/http/router.rs".to_string()),
            100,
        )
        .await
        .expect("can find");
    assert!(remaining.is_empty());
}
