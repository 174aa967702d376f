#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::embeddings::chunking::ChunkingConfig;

const APP_DIR_NAME: &str = "review-rag";
const MAX_COMPARISON_MODELS: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Backend wire protocol for model and embedding calls
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Ollama,
    #[serde(rename = "openai")]
    OpenAi,
}

impl std::fmt::Display for ProviderKind {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ProviderKind::Ollama => write!(f, "ollama"),
            ProviderKind::OpenAi => write!(f, "openai"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model used for single reviews and consensus synthesis
    pub generator_model: String,
    /// Cheaper model for query rewrites, hypothetical snippets and relevance checks
    pub fast_model: Option<String>,
    /// Committee for consensus reviews
    pub comparison_models: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            generator_model: "qwen2.5-coder:7b".to_string(),
            fast_model: None,
            comparison_models: Vec::new(),
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub batch_size: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            model: "nomic-embed-text:latest".to_string(),
            batch_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RerankerConfig {
    pub enabled: bool,
    pub model: String,
    /// Grading calls in flight at once, shared by every search
    pub max_concurrent: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            // Disabled by default for speed
            enabled: false,
            model: "gemma2:2b".to_string(),
            max_concurrent: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub enable_hybrid: bool,
    pub enable_hyde: bool,
    pub enable_description_search: bool,
    pub max_changed_files: usize,
    pub recall_k: usize,
    pub prefilter_k: usize,
    pub final_k: usize,
    pub max_impact_snippets: usize,
    pub max_query_rewrites: usize,
    pub hyde_workers: usize,
    pub impact_workers: usize,
    pub relevance_workers: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enable_hybrid: true,
            enable_hyde: true,
            enable_description_search: true,
            max_changed_files: 20,
            recall_k: 20,
            prefilter_k: 10,
            final_k: 5,
            max_impact_snippets: 10,
            max_query_rewrites: 3,
            hyde_workers: 5,
            impact_workers: 10,
            relevance_workers: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexerConfig {
    /// Files read per streamed batch
    pub batch_size: usize,
    pub workers: usize,
    pub summary_workers: usize,
    pub chunking: ChunkingConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            workers: 4,
            summary_workers: 3,
            chunking: ChunkingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    pub max_concurrent_models: usize,
    pub model_timeout_secs: u64,
    pub straggler_window_secs: u64,
    /// When set, each participant's raw review is written here
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_concurrent_models: 5,
            model_timeout_secs: 300,
            straggler_window_secs: 30,
            artifacts_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Where clones live; defaults to `<base_dir>/repos`
    pub repos_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name for {0} (cannot be empty)")]
    InvalidModel(&'static str),
    #[error("Invalid worker count for {0}: {1} (must be between 1 and 64)")]
    InvalidWorkers(&'static str, usize),
    #[error("Invalid timeout for {0}: must be at least one second")]
    InvalidTimeout(&'static str),
    #[error(
        "Invalid retrieval limits: final ({final_k}) <= prefilter ({prefilter_k}) <= recall ({recall_k}) must hold and all must be positive"
    )]
    InvalidRetrievalLimits {
        recall_k: usize,
        prefilter_k: usize,
        final_k: usize,
    },
    #[error("comparison_models cannot exceed {MAX_COMPARISON_MODELS} (got {0})")]
    TooManyComparisonModels(usize),
    #[error("comparison_models cannot contain empty model names")]
    EmptyComparisonModel,
    #[error("duplicate model in comparison_models: {0}")]
    DuplicateComparisonModel(String),
    #[error("Invalid chunking configuration: {0}")]
    InvalidChunking(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Platform data directory for the application
    #[inline]
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::data_dir()
            .or_else(dirs::home_dir)
            .map(|dir| dir.join(APP_DIR_NAME))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Default::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.llm.validate()?;
        self.embedding.validate()?;
        self.retrieval.validate()?;
        self.indexer.validate()?;
        self.review.validate()?;
        if self.reranker.enabled && self.reranker.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel("reranker"));
        }
        if self.reranker.enabled {
            validate_workers("reranker.max_concurrent", self.reranker.max_concurrent)?;
        }
        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Get the path for the SQLite database
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.get_base_dir().join("metadata.db")
    }

    /// Get the path for the vector database directory
    #[inline]
    pub fn vector_database_path(&self) -> PathBuf {
        self.get_base_dir().join("vectors")
    }

    #[inline]
    pub fn repos_dir(&self) -> PathBuf {
        self.storage
            .repos_dir
            .clone()
            .unwrap_or_else(|| self.get_base_dir().join("repos"))
    }
}

fn validate_base_url(url: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(url).map_err(|_| ConfigError::InvalidUrl(url.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(url.to_string()));
    }
    Ok(parsed)
}

fn validate_workers(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if !(1..=64).contains(&value) {
        return Err(ConfigError::InvalidWorkers(name, value));
    }
    Ok(())
}

impl LlmConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_base_url(&self.base_url)?;

        if self.generator_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel("generator"));
        }
        if self
            .fast_model
            .as_deref()
            .is_some_and(|model| model.trim().is_empty())
        {
            return Err(ConfigError::InvalidModel("fast"));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("llm"));
        }

        validate_comparison_models(&self.comparison_models)
    }

    #[inline]
    pub fn url(&self) -> Result<Url, ConfigError> {
        validate_base_url(&self.base_url)
    }

    /// The model used for cheap auxiliary calls
    #[inline]
    pub fn fast_model(&self) -> &str {
        self.fast_model.as_deref().unwrap_or(&self.generator_model)
    }
}

/// Committee lists are capped, must not contain blanks, and must not repeat a model.
#[inline]
pub fn validate_comparison_models(models: &[String]) -> Result<(), ConfigError> {
    if models.len() > MAX_COMPARISON_MODELS {
        return Err(ConfigError::TooManyComparisonModels(models.len()));
    }

    let mut seen = HashSet::with_capacity(models.len());
    for model in models {
        if model.trim().is_empty() {
            return Err(ConfigError::EmptyComparisonModel);
        }
        if !seen.insert(model.as_str()) {
            return Err(ConfigError::DuplicateComparisonModel(model.clone()));
        }
    }
    Ok(())
}

impl EmbeddingConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_base_url(&self.base_url)?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel("embedding"));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        Ok(())
    }

    #[inline]
    pub fn url(&self) -> Result<Url, ConfigError> {
        validate_base_url(&self.base_url)
    }
}

impl RetrievalConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = self.final_k <= self.prefilter_k && self.prefilter_k <= self.recall_k;
        if self.final_k == 0 || !ordered {
            return Err(ConfigError::InvalidRetrievalLimits {
                recall_k: self.recall_k,
                prefilter_k: self.prefilter_k,
                final_k: self.final_k,
            });
        }
        validate_workers("hyde_workers", self.hyde_workers)?;
        validate_workers("impact_workers", self.impact_workers)?;
        validate_workers("relevance_workers", self.relevance_workers)?;
        if self.max_changed_files == 0 {
            return Err(ConfigError::InvalidWorkers("max_changed_files", 0));
        }
        Ok(())
    }
}

impl IndexerConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size as u32));
        }
        validate_workers("workers", self.workers)?;
        validate_workers("summary_workers", self.summary_workers)?;
        self.chunking.validate().map_err(ConfigError::InvalidChunking)
    }
}

impl ReviewConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_workers("max_concurrent_models", self.max_concurrent_models)?;
        if self.model_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("model_timeout_secs"));
        }
        Ok(())
    }
}
