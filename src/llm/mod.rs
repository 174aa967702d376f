// LLM module
// The language model contract plus the prompt, cache and rerank layers built on it

#[cfg(test)]
mod tests;

pub mod cache;
pub mod prompts;
pub mod rerank;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::Result;
use crate::cancel::CancelToken;

pub use cache::{HashCache, SnippetCache, SummaryCache, patch_hash, short_hash};
pub use prompts::{PromptKey, PromptManager, PromptValues};
pub use rerank::{LlmReranker, NoopReranker, Reranker};

/// A text-completion model.
///
/// Implementations map transport failures to [`crate::ReviewError::Unreachable`]
/// and undecodable responses to [`crate::ReviewError::Unparseable`].
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn call(&self, prompt: &str, cancel: &CancelToken) -> Result<String>;
}

type ModelFactory = dyn Fn(&str) -> Result<Arc<dyn LanguageModel>> + Send + Sync;

/// Hands out one shared client per model id, creating it on first use.
pub struct ModelCatalog {
    factory: Box<ModelFactory>,
    models: RwLock<HashMap<String, Arc<dyn LanguageModel>>>,
}

impl ModelCatalog {
    #[inline]
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<dyn LanguageModel>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            models: RwLock::new(HashMap::new()),
        }
    }

    /// A catalog that only knows the given models
    #[inline]
    pub fn fixed(models: Vec<Arc<dyn LanguageModel>>) -> Self {
        let catalog = Self::new(|model| {
            Err(crate::ReviewError::Config(format!(
                "Model '{model}' is not available"
            )))
        });
        {
            let mut known = catalog
                .models
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for model in models {
                known.insert(model.model_id().to_string(), model);
            }
        }
        catalog
    }

    #[inline]
    pub fn get(&self, model: &str) -> Result<Arc<dyn LanguageModel>> {
        let existing = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .map(Arc::clone);
        if let Some(existing) = existing {
            return Ok(existing);
        }

        debug!("Creating client for model {}", model);
        let created = (self.factory)(model)?;
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        // Another task may have created it in the meantime; keep the first one
        Ok(Arc::clone(models.entry(model.to_string()).or_insert(created)))
    }
}

impl std::fmt::Debug for ModelCatalog {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ModelCatalog")
            .field("models", &models.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
