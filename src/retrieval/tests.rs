use super::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ReviewError;
use crate::database::MemoryVectorIndex;
use crate::database::vector::{ChunkKind, IndexedDocument};
use crate::llm::NoopReranker;
use crate::testing::FakeEmbedder;

const COLLECTION: &str = "repo-acme-widgets-fake";

struct FailingReranker {
    calls: AtomicUsize,
}

#[async_trait]
impl Reranker for FailingReranker {
    async fn rerank(
        &self,
        _query: &str,
        _candidates: &[ScoredDocument],
        _cancel: &CancelToken,
    ) -> Result<Vec<ScoredDocument>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ReviewError::Unreachable("reranker offline".to_string()))
    }
}

/// Reverses the candidate order so tests can tell reranked output from recall output
struct ReversingReranker;

#[async_trait]
impl Reranker for ReversingReranker {
    async fn rerank(
        &self,
        _query: &str,
        candidates: &[ScoredDocument],
        _cancel: &CancelToken,
    ) -> Result<Vec<ScoredDocument>> {
        Ok(candidates.iter().rev().cloned().collect())
    }
}

async fn seeded_index(embedder: &FakeEmbedder, documents: &[(&str, &str)]) -> Arc<MemoryVectorIndex> {
    let index = Arc::new(MemoryVectorIndex::new());
    let mut stored = Vec::new();
    for (line, (source, content)) in (1_u32..).zip(documents) {
        let mut document = IndexedDocument::code(source, (*content).to_string(), line, line);
        document.vector = embedder
            .embed(content, &CancelToken::never())
            .await
            .expect("can embed");
        document.sparse = Some(embedder.sparse(content));
        stored.push(document);
    }
    index
        .add_documents(COLLECTION, stored)
        .await
        .expect("can seed index");
    index
}

fn many_documents(count: usize) -> Vec<(String, String)> {
    (0..count)
        .map(|i| {
            (
                format!("src/handler_{i}.rs"),
                format!("fn handle_request_{i}(request: Request) -> Response {{ route(request) }}"),
            )
        })
        .collect()
}

fn retriever(index: Arc<MemoryVectorIndex>, reranker: Arc<dyn Reranker>) -> Retriever {
    Retriever::new(
        index,
        Arc::new(FakeEmbedder::new("fake", 64)),
        reranker,
        RetrievalConfig::default(),
    )
}

#[tokio::test]
async fn recall_finds_related_code() {
    let embedder = FakeEmbedder::new("fake", 64);
    let index = seeded_index(
        &embedder,
        &[
            ("src/auth.rs", "fn verify_token(token: &str) -> bool { token.is_empty() }"),
            ("src/render.rs", "fn draw_widget(canvas: Canvas) { canvas.paint() }"),
        ],
    )
    .await;

    let results = retriever(index, Arc::new(NoopReranker))
        .recall(COLLECTION, "verify the token", 1, None, &CancelToken::never())
        .await
        .expect("can recall");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].document.source, "src/auth.rs");
}

#[tokio::test]
async fn recall_honours_filter() {
    let embedder = FakeEmbedder::new("fake", 64);
    let index = seeded_index(&embedder, &[("src/a.rs", "fn alpha() {}")]).await;
    let mut arch = IndexedDocument::arch("src", "alpha lives here".to_string(), "h".to_string(), 1);
    arch.vector = embedder
        .embed("alpha lives here", &CancelToken::never())
        .await
        .expect("can embed");
    index
        .add_documents(COLLECTION, vec![arch])
        .await
        .expect("can add arch document");

    let results = retriever(index, Arc::new(NoopReranker))
        .recall(
            COLLECTION,
            "alpha",
            10,
            Some(DocumentFilter::ChunkKind(ChunkKind::Code)),
            &CancelToken::never(),
        )
        .await
        .expect("can recall");

    assert_eq!(results.len(), 1);
    assert!(results.iter().all(|r| r.document.chunk_kind == ChunkKind::Code));
}

#[tokio::test]
async fn rerank_output_is_cut_to_final_k() {
    let embedder = FakeEmbedder::new("fake", 64);
    let documents = many_documents(20);
    let borrowed: Vec<(&str, &str)> = documents
        .iter()
        .map(|(source, content)| (source.as_str(), content.as_str()))
        .collect();
    let index = seeded_index(&embedder, &borrowed).await;

    let retriever = retriever(index, Arc::new(ReversingReranker));
    let results = retriever
        .recall_and_rerank(COLLECTION, "handle request", None, &CancelToken::never())
        .await
        .expect("can search");

    assert_eq!(results.len(), 5);
}

#[tokio::test]
async fn failing_rerank_falls_back_to_prefiltered_set() {
    let embedder = FakeEmbedder::new("fake", 64);
    let documents = many_documents(10);
    let borrowed: Vec<(&str, &str)> = documents
        .iter()
        .map(|(source, content)| (source.as_str(), content.as_str()))
        .collect();
    let index = seeded_index(&embedder, &borrowed).await;

    let reranker = Arc::new(FailingReranker {
        calls: AtomicUsize::new(0),
    });
    let retriever = Retriever::new(
        index,
        Arc::new(FakeEmbedder::new("fake", 64)),
        Arc::clone(&reranker) as Arc<dyn Reranker>,
        RetrievalConfig::default(),
    );

    let results = retriever
        .recall_and_rerank(COLLECTION, "handle request", None, &CancelToken::never())
        .await
        .expect("rerank failure must not fail the search");

    assert_eq!(reranker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(results.len(), 5);
}

#[tokio::test]
async fn small_recall_reranks_everything() {
    let embedder = FakeEmbedder::new("fake", 64);
    let documents = many_documents(3);
    let borrowed: Vec<(&str, &str)> = documents
        .iter()
        .map(|(source, content)| (source.as_str(), content.as_str()))
        .collect();
    let index = seeded_index(&embedder, &borrowed).await;

    let results = retriever(index, Arc::new(ReversingReranker))
        .recall_and_rerank(COLLECTION, "handle request", None, &CancelToken::never())
        .await
        .expect("can search");

    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn empty_collection_yields_nothing() {
    let reranker = Arc::new(FailingReranker {
        calls: AtomicUsize::new(0),
    });
    let retriever = retriever(
        Arc::new(MemoryVectorIndex::new()),
        Arc::clone(&reranker) as Arc<dyn Reranker>,
    );

    let results = retriever
        .recall_and_rerank(COLLECTION, "anything", None, &CancelToken::never())
        .await
        .expect("can search");

    assert!(results.is_empty());
    // Nothing to rerank, so the reranker is never asked
    assert_eq!(reranker.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn prefilter_prefers_term_overlap() {
    let unrelated = (0..4).map(|i| {
        ScoredDocument::new(
            IndexedDocument::code(&format!("src/other_{i}.rs"), "fn paint_canvas() {}".to_string(), 1, 1),
            0.9,
        )
    });
    let related = ScoredDocument::new(
        IndexedDocument::code("src/cache.rs", "fn evict_cache_entry(key: Key) {}".to_string(), 1, 1),
        0.1,
    );
    let candidates: Vec<ScoredDocument> = unrelated.chain(std::iter::once(related)).collect();

    let kept = prefilter("evict cache entry", candidates, 2);

    assert_eq!(kept.len(), 2);
    assert!(kept.iter().any(|scored| scored.document.source == "src/cache.rs"));
}

#[test]
fn prefilter_keeps_small_sets_untouched() {
    let candidates = vec![ScoredDocument::new(
        IndexedDocument::code("a.rs", "fn a() {}".to_string(), 1, 1),
        0.5,
    )];
    let kept = prefilter("a", candidates.clone(), 10);
    assert_eq!(kept, candidates);
}
