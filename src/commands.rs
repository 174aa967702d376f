use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cancel::{CancelSource, CancelToken};
use crate::config::{Config, RepoConfig};
use crate::context::{ContextAssembler, split_unified_diff};
use crate::database::{Database, LanceVectorStore, Repository, VectorIndex};
use crate::embeddings::{Embedder, Language};
use crate::indexer::{ContentIndexer, IndexReport};
use crate::llm::cache::{SnippetCache, SummaryCache};
use crate::llm::{LanguageModel, LlmReranker, ModelCatalog, NoopReranker, PromptManager, Reranker};
use crate::parser::StructuredReview;
use crate::providers::{build_embedder, build_model_catalog};
use crate::retrieval::Retriever;
use crate::review::{ReviewOrchestrator, ReviewRequest};
use crate::summarizer::ArchitecturalSummarizer;
use crate::sync::{GitClient, RepositoryRef, RepositorySynchronizer};

/// Stores and clients shared by every command
struct Services {
    database: Database,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    models: Arc<ModelCatalog>,
    prompts: Arc<PromptManager>,
}

impl Services {
    async fn open(config: &Config) -> Result<Self> {
        let database = Database::initialize_from_config_dir(config.get_base_dir())
            .await
            .context("Failed to initialize database")?;
        let index = LanceVectorStore::new(&config.vector_database_path())
            .await
            .context("Failed to initialize vector store")?;
        let embedder = build_embedder(&config.embedding).context("Failed to create embedder")?;

        Ok(Self {
            database,
            index: Arc::new(index),
            embedder,
            models: Arc::new(build_model_catalog(&config.llm)),
            prompts: Arc::new(PromptManager::new().context("Failed to load prompt templates")?),
        })
    }

    fn fast_model(&self, config: &Config) -> Result<Arc<dyn LanguageModel>> {
        Ok(self.models.get(config.llm.fast_model())?)
    }

    fn retriever(&self, config: &Config) -> Result<Arc<Retriever>> {
        let reranker: Arc<dyn Reranker> = if config.reranker.enabled {
            Arc::new(
                LlmReranker::new(
                    self.models.get(&config.reranker.model)?,
                    Arc::clone(&self.prompts),
                )
                .with_max_concurrent(config.reranker.max_concurrent),
            )
        } else {
            Arc::new(NoopReranker)
        };
        Ok(Arc::new(Retriever::new(
            Arc::clone(&self.index),
            Arc::clone(&self.embedder),
            reranker,
            config.retrieval.clone(),
        )))
    }

    fn orchestrator(&self, config: &Config) -> Result<ReviewOrchestrator> {
        let retriever = self.retriever(config)?;
        let context = ContextAssembler::new(
            Arc::clone(&retriever),
            self.fast_model(config)?,
            Arc::clone(&self.prompts),
            Arc::new(SnippetCache::new()),
        );
        Ok(ReviewOrchestrator::new(
            Arc::new(context),
            retriever,
            Arc::clone(&self.models),
            Arc::clone(&self.prompts),
            config.llm.generator_model.clone(),
            config.review.clone(),
        ))
    }

    fn indexer(&self, config: &Config) -> Result<ContentIndexer> {
        let summarizer = ArchitecturalSummarizer::new(
            Arc::clone(&self.index),
            Arc::clone(&self.embedder),
            self.fast_model(config)?,
            Arc::clone(&self.prompts),
            Arc::new(SummaryCache::new()),
            config.indexer.summary_workers,
        );
        Ok(ContentIndexer::new(
            self.database.clone(),
            Arc::clone(&self.index),
            Arc::clone(&self.embedder),
            config.indexer.clone(),
        )
        .with_summarizer(Arc::new(summarizer)))
    }

    async fn repository(&self, full_name: &str) -> Result<Repository> {
        self.database
            .get_repository(full_name)
            .await?
            .with_context(|| {
                format!("Repository {full_name} is not indexed, run `review-rag sync` first")
            })
    }
}

/// A token cancelled by Ctrl+C
fn interrupt_token() -> CancelToken {
    let source = CancelSource::new();
    let token = source.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n📴 Received interrupt signal, cancelling...");
            source.cancel();
        }
    });
    token
}

fn spinner(message: &str) -> ProgressBar {
    if !console::user_attended_stderr() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner().with_style(
        ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Clone or update a repository, then bring its index up to date
#[inline]
pub async fn sync_repository(
    config: &Config,
    full_name: &str,
    clone_url: &str,
    revision: &str,
    token: Option<&str>,
) -> Result<()> {
    let services = Services::open(config).await?;
    let cancel = interrupt_token();
    let synchronizer = RepositorySynchronizer::new(
        services.database.clone(),
        Arc::clone(&services.index),
        Arc::new(GitClient::new()),
        config.repos_dir(),
        services.embedder.model_id(),
    );

    let bar = spinner(&format!("Syncing {full_name} at {revision}"));
    let synced = synchronizer
        .sync(&RepositoryRef::new(full_name, clone_url), revision, token, &cancel)
        .await;
    bar.finish_and_clear();
    let synced = synced.with_context(|| format!("Failed to sync {full_name}"))?;

    println!(
        "{} {} at {}",
        style(if synced.is_initial_clone { "Cloned" } else { "Updated" }).green().bold(),
        full_name,
        synced.head_revision
    );

    let repo_config = RepoConfig::load(&synced.local_path)?;
    let indexer = services.indexer(config)?;
    let bar = spinner(&format!("Indexing {full_name}"));
    let report = if synced.is_initial_clone {
        indexer
            .index_initial(&synced.repository, &synced.local_path, &repo_config, &cancel)
            .await
    } else {
        indexer
            .index_incremental(
                &synced.repository,
                &synced.local_path,
                &synced.files_to_upsert,
                &synced.files_to_delete,
                &repo_config,
                &cancel,
            )
            .await
    };
    bar.finish_and_clear();
    let report = report.with_context(|| format!("Failed to index {full_name}"))?;

    synchronizer
        .mark_indexed(&synced.repository, &synced.head_revision)
        .await?;
    print_index_report(&report);
    Ok(())
}

fn print_index_report(report: &IndexReport) {
    println!("  Indexed files: {}", report.indexed);
    println!("  Unchanged files: {}", report.skipped);
    println!("  Removed files: {}", report.deleted);
    println!("  Documents written: {}", report.documents_written);
    println!("  Directory summaries: {}", report.summaries);
}

/// Build a review request from a diff file
fn load_request(diff_path: &Path, title: Option<String>, description: Option<String>) -> Result<ReviewRequest> {
    let diff = std::fs::read_to_string(diff_path)
        .with_context(|| format!("Failed to read diff {}", diff_path.display()))?;
    let changed_files = split_unified_diff(&diff);
    let language = primary_language(changed_files.iter().map(|file| file.filename.as_str()));

    Ok(ReviewRequest {
        title: title.unwrap_or_default(),
        description: description.unwrap_or_default(),
        language: language.to_string(),
        diff,
        changed_files,
    })
}

/// The most common known language among the changed files
fn primary_language<'a>(paths: impl Iterator<Item = &'a str>) -> &'static str {
    let mut counts: Vec<(Language, usize)> = Vec::new();
    for language in paths
        .map(|path| Language::from_path(Path::new(path)))
        .filter(|language| *language != Language::Unknown)
    {
        match counts.iter_mut().find(|(seen, _)| *seen == language) {
            Some((_, count)) => *count += 1,
            None => counts.push((language, 1)),
        }
    }
    // Ties go to the language seen first
    counts
        .iter()
        .rev()
        .max_by_key(|(_, count)| *count)
        .map_or(Language::Unknown.name(), |(language, _)| language.name())
}

fn print_review(review: &StructuredReview, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(review)?);
        return Ok(());
    }

    if let Some(title) = &review.title {
        println!("{}", style(title).bold());
    }
    println!("{} {}", style("Verdict:").bold(), review.verdict);
    println!();
    println!("{}", review.summary);
    for suggestion in &review.suggestions {
        println!();
        println!(
            "{} {}:{}-{} [{} / {}]",
            style("•").yellow(),
            style(&suggestion.file_path).bold(),
            suggestion.start_line,
            suggestion.end_line,
            suggestion.severity,
            suggestion.category
        );
        for line in suggestion.comment.lines() {
            println!("    {line}");
        }
    }
    Ok(())
}

/// Review a diff with the generator model
#[inline]
pub async fn review_diff(
    config: &Config,
    full_name: &str,
    diff_path: &Path,
    title: Option<String>,
    description: Option<String>,
    json: bool,
) -> Result<()> {
    let services = Services::open(config).await?;
    let repository = services.repository(full_name).await?;
    let repo_config = RepoConfig::load(repository.path())?;
    let request = load_request(diff_path, title, description)?;
    let orchestrator = services.orchestrator(config)?;

    let bar = spinner(&format!("Reviewing with {}", config.llm.generator_model));
    let review = orchestrator
        .generate_review(&repository, &repo_config, &request, &interrupt_token())
        .await;
    bar.finish_and_clear();

    print_review(&review?, json)
}

/// Review a diff with a committee and print the synthesized result
#[inline]
pub async fn consensus_review(
    config: &Config,
    full_name: &str,
    diff_path: &Path,
    models: Vec<String>,
    json: bool,
) -> Result<()> {
    let models = if models.is_empty() {
        config.llm.comparison_models.clone()
    } else {
        models
    };
    if models.is_empty() {
        bail!("No comparison models given; pass --models or set llm.comparison_models");
    }

    let services = Services::open(config).await?;
    let repository = services.repository(full_name).await?;
    let repo_config = RepoConfig::load(repository.path())?;
    let request = load_request(diff_path, None, None)?;
    let orchestrator = services.orchestrator(config)?;

    info!("Consensus review of {} with {}", full_name, models.join(", "));
    let bar = spinner(&format!("Reviewing with {} models", models.len()));
    let review = orchestrator
        .generate_consensus_review(&repository, &repo_config, &request, &models, &interrupt_token())
        .await;
    bar.finish_and_clear();

    print_review(&review?, json)
}

/// Check a new diff against an earlier review
#[inline]
pub async fn rereview_diff(
    config: &Config,
    full_name: &str,
    diff_path: &Path,
    original_path: &Path,
    json: bool,
) -> Result<()> {
    let original = std::fs::read_to_string(original_path)
        .with_context(|| format!("Failed to read review {}", original_path.display()))?;
    let services = Services::open(config).await?;
    // Confirms the repository is known before spending a model call
    services.repository(full_name).await?;
    let request = load_request(diff_path, None, None)?;
    let orchestrator = services.orchestrator(config)?;

    let bar = spinner("Re-reviewing");
    let review = orchestrator
        .generate_rereview(&original, &request.diff, &request.language, &interrupt_token())
        .await;
    bar.finish_and_clear();

    print_review(&review?, json)
}

/// Answer a question about an indexed repository
#[inline]
pub async fn ask_question(config: &Config, full_name: &str, question: &str) -> Result<()> {
    let services = Services::open(config).await?;
    let repository = services.repository(full_name).await?;
    let orchestrator = services.orchestrator(config)?;

    let bar = spinner("Thinking");
    let answer = orchestrator
        .answer_question(&repository, question, &[], &interrupt_token())
        .await;
    bar.finish_and_clear();

    println!("{}", answer?);
    Ok(())
}

/// Show every known repository and its last scan
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    let database = Database::initialize_from_config_dir(config.get_base_dir())
        .await
        .context("Failed to initialize database")?;
    let repositories = database.list_repositories().await?;

    println!("📊 review-rag status");
    println!("{}", "=".repeat(50));
    println!("Generator model: {}", config.llm.generator_model);
    println!("Fast model: {}", config.llm.fast_model());
    println!("Embedding model: {}", config.embedding.model);
    println!();

    if repositories.is_empty() {
        println!("No repositories have been synced yet.");
        println!("Use 'review-rag sync <owner/name> <clone-url>' to add one.");
        return Ok(());
    }

    for repository in &repositories {
        println!("📁 {}", style(&repository.full_name).bold());
        println!("   Clone: {}", repository.local_path);
        println!("   Collection: {}", repository.collection_name);
        println!(
            "   Indexed revision: {}",
            repository.last_indexed_sha.as_deref().unwrap_or("never")
        );

        match database.scan_state(repository.id).await {
            Ok(Some(state)) => {
                println!("   Scan: {}", state.status);
                if let Some(progress) = state.progress.as_ref().filter(|_| state.is_in_progress()) {
                    println!(
                        "   Progress: {}/{} files",
                        progress.files_done, progress.files_total
                    );
                }
                if let Some(artifacts) = &state.artifacts {
                    println!(
                        "   Last scan: {} indexed, {} unchanged, {} removed, {} summaries",
                        artifacts.indexed_files,
                        artifacts.skipped_files,
                        artifacts.deleted_files,
                        artifacts.summaries
                    );
                }
                if let Some(error) = &state.error_message {
                    println!("   ⚠️  Error: {}", error);
                }
            }
            Ok(None) => println!("   Scan: never"),
            Err(e) => {
                warn!("Failed to read scan state of {}: {}", repository.full_name, e);
                println!("   Scan: unavailable");
            }
        }
        println!(
            "   Updated: {}",
            repository.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!();
    }

    Ok(())
}
