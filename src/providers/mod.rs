// Providers module
// HTTP backends for text generation and embeddings, chosen once from configuration


pub mod http;
pub mod ollama;
pub mod openai;

use std::sync::Arc;
use tracing::debug;

pub use http::HttpClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

use crate::Result;
use crate::config::{EmbeddingConfig, LlmConfig, ProviderKind};
use crate::embeddings::Embedder;
use crate::llm::{LanguageModel, ModelCatalog};

/// A client for `model` speaking the configured provider's protocol
#[inline]
pub fn build_language_model(config: &LlmConfig, model: &str) -> Result<Arc<dyn LanguageModel>> {
    debug!("Building {} client for model {}", config.provider, model);
    Ok(match config.provider {
        ProviderKind::Ollama => Arc::new(OllamaClient::for_model(config, model)?),
        ProviderKind::OpenAi => Arc::new(OpenAiClient::for_model(config, model)?),
    })
}

/// Lazily creates and shares one client per model id
#[inline]
pub fn build_model_catalog(config: &LlmConfig) -> ModelCatalog {
    let config = config.clone();
    ModelCatalog::new(move |model| build_language_model(&config, model))
}

#[inline]
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    debug!("Building {} embedder for model {}", config.provider, config.model);
    Ok(match config.provider {
        ProviderKind::Ollama => Arc::new(OllamaClient::for_embeddings(config)?),
        ProviderKind::OpenAi => Arc::new(OpenAiClient::for_embeddings(config)?),
    })
}
