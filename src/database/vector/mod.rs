// Vector index contract
// Documents, filters and scoring shared by every index backend


use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

use crate::Result;
use crate::embeddings::sparse::SparseVector;

/// Reciprocal Rank Fusion constant
pub const RRF_K: f32 = 60.0;

/// Longest parent declaration stored alongside a child chunk
pub const MAX_PARENT_TEXT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Code,
    Arch,
}

impl ChunkKind {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKind::Code => "code",
            ChunkKind::Arch => "arch",
        }
    }

    #[inline]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "code" => Some(ChunkKind::Code),
            "arch" => Some(ChunkKind::Arch),
            _ => None,
        }
    }
}

/// A unit of retrievable content with its embedding and metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub content: String,
    /// Repository-relative file path, or directory label for arch documents
    pub source: String,
    pub chunk_kind: ChunkKind,
    pub identifier: Option<String>,
    pub line_start: u32,
    pub line_end: u32,
    pub parent_id: Option<String>,
    pub full_parent_text: Option<String>,
    pub package_name: Option<String>,
    pub imports: Vec<String>,
    pub is_test: bool,
    /// Arch documents only: directory fingerprint the summary was built from
    pub content_hash: Option<String>,
    pub generated_at: Option<String>,
    pub file_count: Option<u32>,
    pub vector: Vec<f32>,
    pub sparse: Option<SparseVector>,
}

impl IndexedDocument {
    /// A code chunk with a deterministic id derived from its location
    #[inline]
    pub fn code(source: &str, content: String, line_start: u32, line_end: u32) -> Self {
        Self {
            id: chunk_id(source, line_start, line_end),
            content,
            source: source.to_string(),
            chunk_kind: ChunkKind::Code,
            identifier: None,
            line_start,
            line_end,
            parent_id: None,
            full_parent_text: None,
            package_name: None,
            imports: Vec::new(),
            is_test: false,
            content_hash: None,
            generated_at: None,
            file_count: None,
            vector: Vec::new(),
            sparse: None,
        }
    }

    /// An architectural summary for a directory
    #[inline]
    pub fn arch(directory: &str, summary: String, content_hash: String, file_count: u32) -> Self {
        Self {
            id: deterministic_id(&format!("arch:{directory}")),
            content: summary,
            source: directory.to_string(),
            chunk_kind: ChunkKind::Arch,
            identifier: None,
            line_start: 0,
            line_end: 0,
            parent_id: None,
            full_parent_text: None,
            package_name: None,
            imports: Vec::new(),
            is_test: false,
            content_hash: Some(content_hash),
            generated_at: Some(chrono::Utc::now().to_rfc3339()),
            file_count: Some(file_count),
            vector: Vec::new(),
            sparse: None,
        }
    }

    /// The text to show a reviewer: the enclosing declaration when one was recorded
    #[inline]
    pub fn display_text(&self) -> &str {
        self.full_parent_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(&self.content)
    }

    /// Record the enclosing declaration, truncated to the stored maximum
    #[inline]
    pub fn with_parent(mut self, parent_id: String, parent_text: &str) -> Self {
        self.parent_id = Some(parent_id);
        self.full_parent_text = Some(truncate_chars(parent_text, MAX_PARENT_TEXT_CHARS));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub document: IndexedDocument,
    pub score: f32,
    pub reason: Option<String>,
}

impl ScoredDocument {
    #[inline]
    pub fn new(document: IndexedDocument, score: f32) -> Self {
        Self {
            document,
            score,
            reason: None,
        }
    }
}

/// Metadata predicate understood by every backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentFilter {
    Source(String),
    Sources(Vec<String>),
    ChunkKind(ChunkKind),
    /// Documents whose imports include the given package
    ImportsPackage(String),
    /// Documents importing a path that is, or ends in, the given `/`-separated path
    ImportsPathSuffix(String),
    And(Vec<DocumentFilter>),
}

impl DocumentFilter {
    #[inline]
    pub fn matches(&self, document: &IndexedDocument) -> bool {
        match self {
            DocumentFilter::Source(source) => document.source == *source,
            DocumentFilter::Sources(sources) => sources.iter().any(|s| *s == document.source),
            DocumentFilter::ChunkKind(kind) => document.chunk_kind == *kind,
            DocumentFilter::ImportsPackage(package) => {
                document.imports.iter().any(|import| import == package)
            }
            DocumentFilter::ImportsPathSuffix(suffix) => document.imports.iter().any(|import| {
                import == suffix
                    || import
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|head| head.ends_with('/'))
            }),
            DocumentFilter::And(filters) => filters.iter().all(|f| f.matches(document)),
        }
    }

    /// Arch document for one directory
    #[inline]
    pub fn arch_for(directory: &str) -> Self {
        DocumentFilter::And(vec![
            DocumentFilter::ChunkKind(ChunkKind::Arch),
            DocumentFilter::Source(directory.to_string()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub vector: Vec<f32>,
    /// When present the search fuses dense and lexical rankings
    pub sparse: Option<SparseVector>,
    pub k: usize,
    pub filter: Option<DocumentFilter>,
}

/// Storage for embedded documents, one logical collection per repository and embedder
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert documents, replacing any existing document with the same id.
    async fn add_documents(&self, collection: &str, documents: Vec<IndexedDocument>)
    -> Result<usize>;

    async fn similarity_search(
        &self,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<Vec<ScoredDocument>>;

    /// Metadata-only lookup
    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        limit: usize,
    ) -> Result<Vec<IndexedDocument>>;

    async fn delete_by_filter(&self, collection: &str, filter: &DocumentFilter) -> Result<()>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;

    async fn count(&self, collection: &str) -> Result<usize>;
}

/// UUID-formatted SHA-256 of an arbitrary key
#[inline]
pub fn deterministic_id(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0_u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// Deterministic id of a code chunk
#[inline]
pub fn chunk_id(source: &str, line_start: u32, line_end: u32) -> String {
    deterministic_id(&format!("{source}:{line_start}:{line_end}"))
}

/// Cosine similarity; zero when either side is empty or the lengths differ
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Fuse several rankings with Reciprocal Rank Fusion.
///
/// score(d) = Σ 1 / (k + rank_i(d)), with 1-based ranks. Ties keep first-seen order.
#[inline]
pub fn reciprocal_rank_fusion(rankings: Vec<Vec<ScoredDocument>>, limit: usize) -> Vec<ScoredDocument> {
    let mut fused: Vec<ScoredDocument> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for ranking in rankings {
        for (rank, scored) in ranking.into_iter().enumerate() {
            let contribution = 1.0 / (RRF_K + rank as f32 + 1.0);
            match positions.get(&scored.document.id) {
                Some(&pos) => fused[pos].score += contribution,
                None => {
                    positions.insert(scored.document.id.clone(), fused.len());
                    fused.push(ScoredDocument {
                        score: contribution,
                        ..scored
                    });
                }
            }
        }
    }

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused.truncate(limit);
    fused
}

/// Re-rank candidates lexically and fuse with their dense order
#[inline]
pub fn hybrid_fuse(
    dense: Vec<ScoredDocument>,
    sparse_query: &SparseVector,
    limit: usize,
) -> Vec<ScoredDocument> {
    let mut lexical: Vec<ScoredDocument> = dense
        .iter()
        .filter_map(|scored| {
            let score = scored
                .document
                .sparse
                .as_ref()
                .map_or(0.0, |sparse| sparse.dot(sparse_query));
            (score > 0.0).then(|| ScoredDocument::new(scored.document.clone(), score))
        })
        .collect();
    lexical.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    reciprocal_rank_fusion(vec![dense, lexical], limit)
}

/// Truncate on a character boundary
#[inline]
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text.get(..byte_index).unwrap_or(text).to_string(),
        None => text.to_string(),
    }
}
