// Retrieval module
// Two-stage search over one collection: broad hybrid recall, a cheap lexical cut, then precision rerank

#[cfg(test)]
mod tests;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::Result;
use crate::cancel::CancelToken;
use crate::config::RetrievalConfig;
use crate::database::vector::{
    DocumentFilter, ScoredDocument, SearchQuery, VectorIndex, hybrid_fuse,
};
use crate::embeddings::{Embedder, sparse};
use crate::llm::Reranker;

/// Search front-end shared by the context stages and question answering
pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    settings: RetrievalConfig,
}

impl Retriever {
    #[inline]
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        settings: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            reranker,
            settings,
        }
    }

    #[inline]
    pub fn settings(&self) -> &RetrievalConfig {
        &self.settings
    }

    #[inline]
    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    #[inline]
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Embed `query` and return the `k` nearest documents.
    ///
    /// With hybrid search enabled the query's sparse vector travels along and the index
    /// fuses dense and lexical rankings.
    #[inline]
    pub async fn recall(
        &self,
        collection: &str,
        query: &str,
        k: usize,
        filter: Option<DocumentFilter>,
        cancel: &CancelToken,
    ) -> Result<Vec<ScoredDocument>> {
        let vector = self.embedder.embed(query, cancel).await?;
        let sparse = self
            .settings
            .enable_hybrid
            .then(|| self.embedder.sparse(query))
            .filter(|sparse| !sparse.is_empty());

        let search = SearchQuery {
            vector,
            sparse,
            k,
            filter,
        };
        let results = cancel
            .run(self.index.similarity_search(collection, &search))
            .await?;

        debug!("Recalled {} documents from {}", results.len(), collection);
        Ok(results)
    }

    /// Recall broadly, cut lexically, then rerank for precision.
    ///
    /// A failing reranker never fails the search: the prefiltered candidates are
    /// returned in their fused order instead.
    #[inline]
    pub async fn recall_and_rerank(
        &self,
        collection: &str,
        query: &str,
        filter: Option<DocumentFilter>,
        cancel: &CancelToken,
    ) -> Result<Vec<ScoredDocument>> {
        let recalled = self
            .recall(collection, query, self.settings.recall_k, filter, cancel)
            .await?;
        let candidates = prefilter(query, recalled, self.settings.prefilter_k);
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let final_k = self.settings.final_k;
        match self.reranker.rerank(query, &candidates, cancel).await {
            Ok(mut reranked) => {
                reranked.truncate(final_k);
                debug!(
                    "Reranked {} candidates down to {}",
                    candidates.len(),
                    reranked.len()
                );
                Ok(reranked)
            }
            Err(e) => {
                warn!("Rerank failed, keeping recall order: {}", e);
                let mut fallback = candidates;
                fallback.truncate(final_k);
                Ok(fallback)
            }
        }
    }
}

/// Keep the `k` candidates that best agree with `query` both by recall rank and by
/// term overlap. Candidates without a stored sparse vector are encoded on the fly.
#[inline]
pub fn prefilter(query: &str, candidates: Vec<ScoredDocument>, k: usize) -> Vec<ScoredDocument> {
    if candidates.len() <= k {
        return candidates;
    }

    let query_terms = sparse::encode(query);
    if query_terms.is_empty() {
        let mut candidates = candidates;
        candidates.truncate(k);
        return candidates;
    }

    let candidates = candidates
        .into_iter()
        .map(|mut scored| {
            if scored.document.sparse.is_none() {
                scored.document.sparse = Some(sparse::encode(&scored.document.content));
            }
            scored
        })
        .collect();
    hybrid_fuse(candidates, &query_terms, k)
}
