
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::http::HttpClient;
use crate::cancel::CancelToken;
use crate::config::{EmbeddingConfig, LlmConfig};
use crate::embeddings::Embedder;
use crate::llm::LanguageModel;
use crate::{Result, ReviewError};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Client for an Ollama server, usable both as a text model and as an embedder
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: HttpClient,
    model: String,
    batch_size: u32,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    #[serde(rename = "input")]
    inputs: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl OllamaClient {
    #[inline]
    pub fn new(http: HttpClient, model: &str) -> Self {
        Self {
            http,
            model: model.to_string(),
            batch_size: 1,
        }
    }

    /// A text-generation client for `model` on the configured server
    #[inline]
    pub fn for_model(config: &LlmConfig, model: &str) -> Result<Self> {
        let base_url = config
            .url()
            .map_err(|e| ReviewError::Config(format!("Invalid LLM URL: {e}")))?;
        let http = HttpClient::new(base_url, Duration::from_secs(config.timeout_secs))
            .with_api_key(config.api_key.clone());
        Ok(Self::new(http, model))
    }

    #[inline]
    pub fn for_embeddings(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = config
            .url()
            .map_err(|e| ReviewError::Config(format!("Invalid embedding URL: {e}")))?;
        let http = HttpClient::new(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECONDS))
            .with_api_key(config.api_key.clone());
        Ok(Self::new(http, &config.model).with_batch_size(config.batch_size))
    }

    #[inline]
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[inline]
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Verify the server answers and serves the configured model
    #[inline]
    pub async fn health_check(&self, cancel: &CancelToken) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.http.base_url());

        let models = self.list_models(cancel).await?;
        if models.iter().any(|m| m.name == self.model) {
            info!(
                "Health check passed for Ollama server at {} with model {}",
                self.http.base_url(),
                self.model
            );
            return Ok(());
        }

        let available: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        warn!(
            "Model {} not found. Available models: {:?}",
            self.model, available
        );
        Err(ReviewError::Config(format!(
            "Model '{}' is not available. Available models: {:?}",
            self.model, available
        )))
    }

    #[inline]
    pub async fn list_models(&self, cancel: &CancelToken) -> Result<Vec<ModelInfo>> {
        let response: ModelsResponse = self.http.get_json("api/tags", cancel).await?;
        debug!("Found {} models", response.models.len());
        Ok(response.models)
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    #[inline]
    fn model_id(&self) -> &str {
        &self.model
    }

    #[inline]
    async fn call(&self, prompt: &str, cancel: &CancelToken) -> Result<String> {
        debug!("Generating with {} (prompt length: {})", self.model, prompt.len());
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };
        let response: GenerateResponse = self.http.post_json("api/generate", &request, cancel).await?;
        Ok(response.response)
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    #[inline]
    fn model_id(&self) -> &str {
        &self.model
    }

    #[inline]
    async fn embed(&self, text: &str, cancel: &CancelToken) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()], cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ReviewError::Embedding("Empty embedding response".to_string()))
    }

    #[inline]
    async fn embed_batch(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());
        let request = EmbedRequest {
            model: &self.model,
            inputs: texts,
        };
        let response: EmbedResponse = self.http.post_json("api/embed", &request, cancel).await?;

        if response.embeddings.len() != texts.len() {
            return Err(ReviewError::Embedding(format!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        Ok(response.embeddings)
    }
}
