// OpenAI-compatible chat completions and embeddings
// Any server speaking the `/chat/completions` and `/embeddings` shapes works, so the base URL
// usually ends in `/v1`


use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::http::HttpClient;
use crate::cancel::CancelToken;
use crate::config::{EmbeddingConfig, LlmConfig};
use crate::embeddings::Embedder;
use crate::llm::LanguageModel;
use crate::{Result, ReviewError};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: HttpClient,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiClient {
    #[inline]
    pub fn new(http: HttpClient, model: &str) -> Self {
        Self {
            http,
            model: model.to_string(),
        }
    }

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
        Ok(Self::new(http, &config.model))
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    #[inline]
    fn model_id(&self) -> &str {
        &self.model
    }

    #[inline]
    async fn call(&self, prompt: &str, cancel: &CancelToken) -> Result<String> {
        debug!("Chat completion with {} (prompt length: {})", self.model, prompt.len());
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let response: ChatResponse = self
            .http
            .post_json("chat/completions", &request, cancel)
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                ReviewError::Unparseable(format!("{} returned no completion choices", self.model))
            })
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
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

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let mut response: EmbeddingResponse =
            self.http.post_json("embeddings", &request, cancel).await?;

        if response.data.len() != texts.len() {
            return Err(ReviewError::Embedding(format!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                response.data.len()
            )));
        }
        // Servers may answer out of order
        response.data.sort_by_key(|item| item.index);
        Ok(response.data.into_iter().map(|item| item.embedding).collect())
    }
}
