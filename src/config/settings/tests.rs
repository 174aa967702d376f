use super::*;
use tempfile::TempDir;

#[test]
fn default_config() {
    let config = Config::default();
    assert_eq!(config.llm.provider, ProviderKind::Ollama);
    assert_eq!(config.llm.base_url, "http://localhost:11434");
    assert_eq!(config.embedding.model, "nomic-embed-text:latest");
    assert_eq!(config.embedding.batch_size, 16);
    assert!(!config.reranker.enabled);
    assert_eq!(config.reranker.model, "gemma2:2b");
    assert!(config.retrieval.enable_hybrid);
    assert_eq!(config.retrieval.final_k, 5);
    assert_eq!(config.indexer.batch_size, 64);
    assert_eq!(config.indexer.workers, 4);
    assert_eq!(config.review.max_concurrent_models, 5);
    assert_eq!(config.review.straggler_window_secs, 30);
}

#[test]
fn config_validation() {
    let config = Config::default();
    assert!(config.validate().is_ok());

    let mut invalid_config = config.clone();
    invalid_config.llm.base_url = "ftp://localhost".to_string();
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidUrl(_))
    ));

    let mut invalid_config = config.clone();
    invalid_config.llm.generator_model = "  ".to_string();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.embedding.batch_size = 0;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidBatchSize(0))
    ));

    let mut invalid_config = config.clone();
    invalid_config.embedding.batch_size = 1001;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.indexer.workers = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config;
    invalid_config.review.model_timeout_secs = 0;
    assert!(invalid_config.validate().is_err());
}

#[test]
fn model_fan_outs_need_at_least_one_worker() {
    let config = Config::default();
    assert_eq!(config.retrieval.relevance_workers, 5);
    assert_eq!(config.reranker.max_concurrent, 5);

    let mut invalid_config = config.clone();
    invalid_config.retrieval.relevance_workers = 0;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidWorkers("relevance_workers", 0))
    ));

    // The reranker gate only matters once reranking is on
    let mut disabled = config.clone();
    disabled.reranker.max_concurrent = 0;
    assert!(disabled.validate().is_ok());

    let mut invalid_config = config;
    invalid_config.reranker.enabled = true;
    invalid_config.reranker.max_concurrent = 0;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidWorkers("reranker.max_concurrent", 0))
    ));
}

#[test]
fn retrieval_limits_must_be_ordered() {
    let mut config = Config::default();
    config.retrieval.final_k = 11;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidRetrievalLimits { final_k: 11, .. })
    ));

    config.retrieval.final_k = 5;
    config.retrieval.prefilter_k = 30;
    assert!(config.validate().is_err());

    config.retrieval.prefilter_k = 10;
    config.retrieval.final_k = 0;
    assert!(config.validate().is_err());
}

#[test]
fn comparison_model_validation() {
    let models = |names: &[&str]| names.iter().map(ToString::to_string).collect::<Vec<_>>();

    assert!(validate_comparison_models(&models(&["a", "b", "c"])).is_ok());
    assert!(matches!(
        validate_comparison_models(&models(&["a", " "])),
        Err(ConfigError::EmptyComparisonModel)
    ));
    assert!(matches!(
        validate_comparison_models(&models(&["a", "b", "a"])),
        Err(ConfigError::DuplicateComparisonModel(name)) if name == "a"
    ));

    let eleven: Vec<String> = (0..11).map(|i| format!("model-{i}")).collect();
    assert!(matches!(
        validate_comparison_models(&eleven),
        Err(ConfigError::TooManyComparisonModels(11))
    ));
}

#[test]
fn fast_model_falls_back_to_generator() {
    let mut llm = LlmConfig::default();
    assert_eq!(llm.fast_model(), llm.generator_model);

    llm.fast_model = Some("tiny".to_string());
    assert_eq!(llm.fast_model(), "tiny");
}

#[test]
fn provider_kind_serialization() {
    let config: LlmConfig =
        toml::from_str("provider = \"openai\"\nbase_url = \"https://api.example.com/v1\"")
            .expect("can parse llm section");
    assert_eq!(config.provider, ProviderKind::OpenAi);
    assert_eq!(config.provider.to_string(), "openai");
}

#[test]
fn toml_serialization() {
    let config = Config::default();
    let toml_str = toml::to_string(&config).expect("should serialize toml correctly");
    let parsed_config: Config = toml::from_str(&toml_str).expect("should parse toml correctly");
    assert_eq!(config, parsed_config);
}

#[test]
fn derived_paths() {
    let temp_dir = TempDir::new().expect("can create temp dir");
    let mut config = Config::load(temp_dir.path()).expect("can load default config");

    assert_eq!(config.database_path(), temp_dir.path().join("metadata.db"));
    assert_eq!(config.vector_database_path(), temp_dir.path().join("vectors"));
    assert_eq!(config.repos_dir(), temp_dir.path().join("repos"));

    config.storage.repos_dir = Some(PathBuf::from("/srv/clones"));
    assert_eq!(config.repos_dir(), PathBuf::from("/srv/clones"));
}

#[test]
fn invalid_file_is_rejected_on_load() {
    let temp_dir = TempDir::new().expect("can create temp dir");
    fs::write(
        temp_dir.path().join("config.toml"),
        "[retrieval]\nrecall_k = 2\nprefilter_k = 10\nfinal_k = 5\n",
    )
    .expect("can write config");

    assert!(Config::load(temp_dir.path()).is_err());
}
