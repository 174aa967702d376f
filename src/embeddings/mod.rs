// Embeddings module
// Chunking of source files, sparse term vectors and the dense embedding contract


pub mod chunking;
pub mod sparse;

use async_trait::async_trait;

use crate::Result;
use crate::cancel::CancelToken;

pub use chunking::{
    ChunkingConfig, CodeChunk, FileMetadata, Language, chunk_code, extract_metadata, is_test_file,
};
pub use sparse::SparseVector;

/// Produces dense vectors for text.
///
/// `model_id` identifies the vector space: documents embedded under one id are
/// never compared with queries embedded under another.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    async fn embed(&self, text: &str, cancel: &CancelToken) -> Result<Vec<f32>>;

    /// Embed many texts; the output is positionally aligned with `texts`.
    async fn embed_batch(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>>;

    /// Lexical vector used for hybrid search.
    #[inline]
    fn sparse(&self, text: &str) -> SparseVector {
        sparse::encode(text)
    }
}

/// Embed `texts` in slices of `batch_size`, checking for cancellation between slices.
#[inline]
pub async fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
    cancel: &CancelToken,
) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        cancel.check()?;
        let embedded = embedder.embed_batch(batch, cancel).await?;
        if embedded.len() != batch.len() {
            return Err(crate::ReviewError::Embedding(format!(
                "Mismatch between request and response counts: {} vs {}",
                batch.len(),
                embedded.len()
            )));
        }
        vectors.extend(embedded);
    }
    Ok(vectors)
}
