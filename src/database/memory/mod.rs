// In-process vector index
// Used for tests and small local runs; same semantics as the LanceDB backend


use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use crate::Result;
use crate::database::vector::{
    DocumentFilter, IndexedDocument, ScoredDocument, SearchQuery, VectorIndex, cosine_similarity,
    hybrid_fuse,
};

/// Dense candidates considered per requested hybrid result
const HYBRID_OVERSAMPLE: usize = 4;

#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    /// collection -> documents in insertion order
    collections: RwLock<HashMap<String, Vec<IndexedDocument>>>,
}

impl MemoryVectorIndex {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn add_documents(
        &self,
        collection: &str,
        documents: Vec<IndexedDocument>,
    ) -> Result<usize> {
        let written = documents.len();
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stored = collections.entry(collection.to_string()).or_default();

        for document in documents {
            match stored.iter_mut().find(|existing| existing.id == document.id) {
                Some(existing) => *existing = document,
                None => stored.push(document),
            }
        }

        debug!("Stored {} documents in {}", written, collection);
        Ok(written)
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<Vec<ScoredDocument>> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut dense: Vec<ScoredDocument> = stored
            .iter()
            .filter(|doc| query.filter.as_ref().is_none_or(|filter| filter.matches(doc)))
            .map(|doc| ScoredDocument::new(doc.clone(), cosine_similarity(&query.vector, &doc.vector)))
            .collect();
        dense.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        match query.sparse.as_ref() {
            Some(sparse) if !sparse.is_empty() => {
                dense.truncate(query.k.saturating_mul(HYBRID_OVERSAMPLE));
                Ok(hybrid_fuse(dense, sparse, query.k))
            }
            _ => {
                dense.truncate(query.k);
                Ok(dense)
            }
        }
    }

    async fn find(
        &self,
        collection: &str,
        filter: &DocumentFilter,
        limit: usize,
    ) -> Result<Vec<IndexedDocument>> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(collections
            .get(collection)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|doc| filter.matches(doc))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &DocumentFilter) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(stored) = collections.get_mut(collection) {
            stored.retain(|doc| !filter.matches(doc));
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(collection);
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map_or(0, Vec::len))
    }
}
