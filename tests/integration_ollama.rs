#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// Integration tests that require a local Ollama instance
// Run with: cargo test --test integration_ollama -- --ignored

use review_rag::ReviewError;
use review_rag::cancel::CancelToken;
use review_rag::config::{EmbeddingConfig, LlmConfig};
use review_rag::embeddings::Embedder;
use review_rag::llm::LanguageModel;
use review_rag::providers::OllamaClient;
use std::env;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const TEST_EMBEDDING_MODEL: &str = "nomic-embed-text:latest";
const TEST_GENERATION_MODEL: &str = "qwen2.5-coder:1.5b";

fn base_url() -> String {
    env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

fn embedding_client() -> OllamaClient {
    let config = EmbeddingConfig {
        base_url: base_url(),
        model: env::var("OLLAMA_EMBED_MODEL").unwrap_or_else(|_| TEST_EMBEDDING_MODEL.to_string()),
        // Smaller batch size for testing
        batch_size: 5,
        ..EmbeddingConfig::default()
    };
    OllamaClient::for_embeddings(&config).expect("Failed to create Ollama client")
}

fn generation_client() -> OllamaClient {
    let config = LlmConfig {
        base_url: base_url(),
        // Generation on CPU-only hosts is slow
        timeout_secs: 300,
        ..LlmConfig::default()
    };
    let model = env::var("OLLAMA_MODEL").unwrap_or_else(|_| TEST_GENERATION_MODEL.to_string());
    OllamaClient::for_model(&config, &model).expect("Failed to create Ollama client")
}

fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok(); // Ignore error if already initialized
}

#[tokio::test]
#[ignore = "requires a local Ollama instance"]
async fn real_ollama_health_check() {
    init_test_tracing();

    let client = embedding_client();
    info!("Testing health check against real Ollama instance");
    let result = client.health_check(&CancelToken::never()).await;

    assert!(
        result.is_ok(),
        "Health check should succeed with local Ollama: {:?}",
        result
    );
}

#[tokio::test]
#[ignore = "requires a local Ollama instance"]
async fn real_ollama_list_models() {
    init_test_tracing();

    let models = embedding_client()
        .list_models(&CancelToken::never())
        .await
        .expect("Model listing should succeed");
    assert!(!models.is_empty(), "Should have at least one model available");

    for model in &models {
        debug!("Available model: {} (size: {:?})", model.name, model.size);
    }
}

#[tokio::test]
#[ignore = "requires a local Ollama instance"]
async fn real_ollama_batch_embeddings_keep_order() {
    init_test_tracing();

    let client = embedding_client();
    let texts = vec![
        "fn parse_header(line: &str) -> Option<Header>".to_string(),
        "func (s *Server) ServeHTTP(w http.ResponseWriter, r *http.Request)".to_string(),
        "def load_config(path: str) -> dict:".to_string(),
        "fn parse_header(line: &str) -> Option<Header>".to_string(),
    ];

    let vectors = client
        .embed_batch(&texts, &CancelToken::never())
        .await
        .expect("Batch embedding generation should succeed");

    assert_eq!(vectors.len(), texts.len(), "Should have one embedding per input");
    let dimensions = vectors[0].len();
    assert!(dimensions >= 100, "Embedding should have a reasonable dimension");
    assert!(vectors.iter().all(|vector| vector.len() == dimensions));
    // Identical inputs embed identically, so the response kept request order
    assert_eq!(vectors[0], vectors[3]);
    assert_ne!(vectors[0], vectors[1]);
}

#[tokio::test]
async fn empty_batch_makes_no_request() {
    let client = OllamaClient::for_embeddings(&EmbeddingConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        ..EmbeddingConfig::default()
    })
    .expect("can create client");

    let vectors = client
        .embed_batch(&[], &CancelToken::never())
        .await
        .expect("empty batch needs no server");
    assert!(vectors.is_empty());
}

#[tokio::test]
#[ignore = "requires a local Ollama instance"]
async fn real_ollama_generation() {
    init_test_tracing();

    let client = generation_client();
    let answer = client
        .call(
            "Reply with the single word: pong",
            &CancelToken::never().with_timeout(Duration::from_secs(300)),
        )
        .await
        .expect("Generation should succeed");

    info!("{} answered: {}", LanguageModel::model_id(&client), answer);
    assert!(!answer.trim().is_empty());
}

#[tokio::test]
#[ignore = "requires a local Ollama instance"]
async fn real_ollama_unknown_model_is_reported() {
    init_test_tracing();

    let config = EmbeddingConfig {
        base_url: base_url(),
        model: "definitely-not-a-model:latest".to_string(),
        ..EmbeddingConfig::default()
    };
    let client = OllamaClient::for_embeddings(&config).expect("can create client");

    let result = client.health_check(&CancelToken::never()).await;
    assert!(matches!(result, Err(ReviewError::Config(_))), "{result:?}");
}
