use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReviewError>;

#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Version control error: {0}")]
    Vcs(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    /// The model or index could not be reached at all.
    #[error("Service unreachable: {0}")]
    Unreachable(String),

    /// A response arrived but could not be interpreted.
    #[error("Unparseable response: {0}")]
    Unparseable(String),

    #[error("No consensus: {0}")]
    NoConsensus(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ReviewError {
    /// Whether this error means a collaborator could not be reached (as opposed to
    /// answering with something unusable).
    #[inline]
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ReviewError::Unreachable(_) | ReviewError::Timeout(_) | ReviewError::Cancelled
        )
    }
}

pub mod cancel;
pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod embeddings;
pub mod indexer;
pub mod llm;
pub mod parser;
pub mod providers;
pub mod retrieval;
pub mod review;
pub mod summarizer;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;
