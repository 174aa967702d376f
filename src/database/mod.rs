// Database module
// SQLite for repository metadata, a vector index for embedded documents

pub mod lancedb;
pub mod memory;
pub mod sqlite;
pub mod vector;

pub use self::lancedb::LanceVectorStore;
pub use memory::MemoryVectorIndex;
pub use sqlite::*;
pub use sqlite::models::Repository;
pub use vector::{
    ChunkKind, DocumentFilter, IndexedDocument, ScoredDocument, SearchQuery, VectorIndex,
};

/// Surface a relational-store failure with its whole context chain
#[inline]
pub fn store_error(error: anyhow::Error) -> crate::ReviewError {
    crate::ReviewError::Database(format!("{error:#}"))
}
