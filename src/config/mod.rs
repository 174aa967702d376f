// Configuration management module
// Global TOML settings plus the per-repository review configuration

pub mod repo;
pub mod settings;


pub use repo::{DEFAULT_EXCLUDE_DIRS, REPO_CONFIG_FILE, RepoConfig};
pub use settings::{
    Config, ConfigError, EmbeddingConfig, IndexerConfig, LlmConfig, ProviderKind, RerankerConfig,
    RetrievalConfig, ReviewConfig, StorageConfig, validate_comparison_models,
};

/// Get the default configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::default_dir()
}

/// Print the effective configuration in TOML form
#[inline]
pub fn show_config(config: &Config) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(config)?;
    println!(
        "{} {}",
        console::style("Configuration directory:").bold(),
        config.get_base_dir().display()
    );
    println!();
    println!("{}", rendered);
    Ok(())
}
