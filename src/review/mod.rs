// Review orchestration
// Single-model reviews, multi-model consensus with quorum fan-in, re-reviews and repository Q&A

#[cfg(test)]
mod tests;

pub mod artifacts;

use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::{CancelSource, CancelToken};
use crate::config::{RepoConfig, ReviewConfig, validate_comparison_models};
use crate::context::{ChangedFile, ContextAssembler};
use crate::database::{ChunkKind, DocumentFilter, IndexedDocument, Repository};
use crate::llm::{LanguageModel, ModelCatalog, PromptKey, PromptManager, PromptValues};
use crate::parser::{Grammar, StructuredReview, parse_review_with};
use crate::retrieval::Retriever;
use crate::{Result, ReviewError};

pub use artifacts::{ArtifactWriter, sanitize_model_for_filename};

pub const NO_CHANGES_SUMMARY: &str = "This pull request contains no code changes. Looks good to me!";
pub const NO_NEW_CHANGES_SUMMARY: &str = "This pull request contains no new code changes to re-review.";

/// Documents retrieved to answer a question
const QUESTION_CONTEXT_DOCS: usize = 5;

/// Committee members left once the generator model is excluded
const MIN_COMMITTEE: usize = 2;

/// A change to review
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewRequest {
    pub title: String,
    pub description: String,
    /// Primary language, used to address the reviewer
    pub language: String,
    /// Unified diff of the whole change
    pub diff: String,
    pub changed_files: Vec<ChangedFile>,
}

/// One committee member's raw answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonResult {
    pub model: String,
    pub review: String,
    pub error: Option<String>,
}

impl ComparisonResult {
    #[inline]
    pub fn succeeded(model: impl Into<String>, review: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            review: review.into(),
            error: None,
        }
    }

    #[inline]
    pub fn failed(model: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            review: String::new(),
            error: Some(error.into()),
        }
    }

    /// Counts toward synthesis: no error and some text
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && !self.review.trim().is_empty()
    }
}

pub struct ReviewOrchestrator {
    context: Arc<ContextAssembler>,
    retriever: Arc<Retriever>,
    models: Arc<ModelCatalog>,
    prompts: Arc<PromptManager>,
    generator_model: String,
    settings: ReviewConfig,
    grammar: Grammar,
}

impl ReviewOrchestrator {
    #[inline]
    pub fn new(
        context: Arc<ContextAssembler>,
        retriever: Arc<Retriever>,
        models: Arc<ModelCatalog>,
        prompts: Arc<PromptManager>,
        generator_model: impl Into<String>,
        settings: ReviewConfig,
    ) -> Self {
        Self {
            context,
            retriever,
            models,
            prompts,
            generator_model: generator_model.into(),
            settings,
            grammar: Grammar::default(),
        }
    }

    /// Parse model output with a custom grammar
    #[inline]
    #[must_use]
    pub fn with_grammar(mut self, grammar: Grammar) -> Self {
        self.grammar = grammar;
        self
    }

    /// Review a change with the generator model.
    ///
    /// Output that cannot be parsed degrades to a review whose summary is the raw text.
    #[inline]
    pub async fn generate_review(
        &self,
        repository: &Repository,
        repo_config: &RepoConfig,
        request: &ReviewRequest,
        cancel: &CancelToken,
    ) -> Result<StructuredReview> {
        if request.diff.trim().is_empty() {
            info!("No code changes to review in {}", repository.full_name);
            return Ok(StructuredReview::from_summary(NO_CHANGES_SUMMARY));
        }

        info!(
            "Reviewing {} file(s) in {} with {}",
            request.changed_files.len(),
            repository.full_name,
            self.generator_model
        );
        let context = self
            .context
            .build_context(repository, &request.changed_files, &request.description, cancel)
            .await;
        let values = review_values(request, repo_config, context);

        let raw = self
            .call_generator(PromptKey::CodeReview, &values, cancel)
            .await?;
        Ok(self.parse_or_degrade(&raw))
    }

    /// Review a change independently with every model in `models`.
    ///
    /// Context is built once. Models run behind a concurrency gate, each with its own
    /// timeout. Once two thirds have answered, stragglers get a bounded window before they
    /// are cancelled and recorded as failures.
    #[inline]
    pub async fn generate_comparison_reviews(
        &self,
        repository: &Repository,
        repo_config: &RepoConfig,
        request: &ReviewRequest,
        models: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<ComparisonResult>> {
        validate_comparison_models(models).map_err(|e| ReviewError::Config(e.to_string()))?;
        if models.is_empty() {
            return Ok(Vec::new());
        }

        let context = self
            .context
            .build_context(repository, &request.changed_files, &request.description, cancel)
            .await;
        let values = review_values(request, repo_config, context);
        Ok(self.fan_out(models, &values, cancel).await)
    }

    /// Review with a committee, then have the generator model merge their findings.
    ///
    /// The generator is excluded from the committee. Fails with
    /// [`ReviewError::NoConsensus`] when no member produced a usable review.
    #[inline]
    pub async fn generate_consensus_review(
        &self,
        repository: &Repository,
        repo_config: &RepoConfig,
        request: &ReviewRequest,
        models: &[String],
        cancel: &CancelToken,
    ) -> Result<StructuredReview> {
        validate_comparison_models(models).map_err(|e| ReviewError::Config(e.to_string()))?;
        let committee: Vec<String> = models
            .iter()
            .filter(|model| {
                let is_generator = **model == self.generator_model;
                if is_generator {
                    info!(
                        "Excluding {} from the committee, it synthesizes the result",
                        model
                    );
                }
                !is_generator
            })
            .cloned()
            .collect();
        if committee.len() < MIN_COMMITTEE {
            return Err(ReviewError::Config(format!(
                "Consensus needs at least {MIN_COMMITTEE} comparison models besides the generator, got {}",
                committee.len()
            )));
        }

        if request.diff.trim().is_empty() {
            info!("No code changes to review in {}", repository.full_name);
            return Ok(StructuredReview::from_summary(NO_CHANGES_SUMMARY));
        }

        let context = self
            .context
            .build_context(repository, &request.changed_files, &request.description, cancel)
            .await;
        let review_values = review_values(request, repo_config, context.clone());
        let mut results = self.fan_out(&committee, &review_values, cancel).await;
        results.sort_by(|a, b| a.model.cmp(&b.model));

        let writer = self.settings.artifacts_dir.as_ref().map(ArtifactWriter::new);
        let mut reviews = String::new();
        let mut contributors = Vec::new();
        for result in &results {
            if let Some(error) = &result.error {
                warn!("Skipping {} in synthesis: {}", result.model, error);
                if let Some(writer) = &writer {
                    writer.write_error(&result.model, error).await;
                }
                continue;
            }
            if !result.is_usable() {
                warn!("Skipping {} in synthesis: empty review", result.model);
                continue;
            }
            if let Some(writer) = &writer {
                writer
                    .write_review(&result.model, &repository.full_name, &result.review)
                    .await;
            }
            let _ = write!(
                reviews,
                "\n--- Review from {} ---\n{}\n",
                result.model, result.review
            );
            contributors.push(result.model.as_str());
        }

        if contributors.is_empty() {
            return Err(ReviewError::NoConsensus(format!(
                "all {} committee models failed to produce a review",
                results.len()
            )));
        }

        info!("Synthesizing consensus from {}", contributors.join(", "));
        let values = PromptValues::from([
            ("reviews", reviews),
            ("context", context),
            ("changed_files", format_changed_files(&request.changed_files)),
            ("custom_instructions", repo_config.instructions()),
        ]);
        let raw = self
            .call_generator(PromptKey::ConsensusReview, &values, cancel)
            .await?;
        if let Some(writer) = &writer {
            writer.write_consensus(&raw).await;
        }

        let mut review = self.parse_or_degrade(&raw);
        let _ = write!(
            review.summary,
            "\n\n> 🤖 **AI Consensus Review**\n> Generated by synthesizing findings from: {}. \n> *Mistakes are possible. Please verify critical issues.*",
            contributors.join(", ")
        );
        Ok(review)
    }

    /// Check a new diff against an earlier review
    #[inline]
    pub async fn generate_rereview(
        &self,
        original_review: &str,
        new_diff: &str,
        language: &str,
        cancel: &CancelToken,
    ) -> Result<StructuredReview> {
        if new_diff.trim().is_empty() {
            info!("No new code changes to re-review");
            return Ok(StructuredReview::from_summary(NO_NEW_CHANGES_SUMMARY));
        }

        let values = PromptValues::from([
            ("language", language.to_string()),
            ("original_review", original_review.to_string()),
            ("new_diff", new_diff.to_string()),
        ]);
        let raw = self
            .call_generator(PromptKey::ReReview, &values, cancel)
            .await?;
        Ok(self.parse_or_degrade(&raw))
    }

    /// Answer a free-form question from the repository's indexed code.
    #[inline]
    pub async fn answer_question(
        &self,
        repository: &Repository,
        question: &str,
        history: &[String],
        cancel: &CancelToken,
    ) -> Result<String> {
        info!("Answering a question about {}", repository.full_name);
        let found = self
            .retriever
            .recall(
                &repository.collection_name,
                question,
                QUESTION_CONTEXT_DOCS,
                Some(DocumentFilter::ChunkKind(ChunkKind::Code)),
                cancel,
            )
            .await?;
        debug!("Retrieved {} documents for the question", found.len());

        let values = PromptValues::from([
            ("question", question.to_string()),
            ("history", history.join("\n")),
            ("context", format_question_context(found.iter().map(|scored| &scored.document))),
        ]);
        self.call_generator(PromptKey::Question, &values, cancel)
            .await
    }

    async fn call_generator(
        &self,
        key: PromptKey,
        values: &PromptValues,
        cancel: &CancelToken,
    ) -> Result<String> {
        let model = self.models.get(&self.generator_model)?;
        let prompt = self.prompts.render(key, model.model_id(), values)?;
        info!("Calling {} for {}", model.model_id(), key);

        let response = model.call(&prompt, cancel).await?;
        info!("{} answered with {} chars", model.model_id(), response.len());
        Ok(response)
    }

    fn parse_or_degrade(&self, raw: &str) -> StructuredReview {
        parse_review_with(raw, &self.grammar).unwrap_or_else(|e| {
            warn!("Could not parse the review, keeping the raw text: {}", e);
            StructuredReview::from_summary(raw.trim())
        })
    }

    /// Run every model with a quorum-based fan-in.
    ///
    /// Always returns one result per model: models that did not answer before the round
    /// ended are recorded as failures.
    async fn fan_out(
        &self,
        models: &[String],
        values: &PromptValues,
        cancel: &CancelToken,
    ) -> Vec<ComparisonResult> {
        let total = models.len();
        let quorum = (2 * total).div_ceil(3);
        let straggler_window = Duration::from_secs(self.settings.straggler_window_secs);
        let timeout = Duration::from_secs(self.settings.model_timeout_secs);

        let round = CancelSource::child_of(cancel);
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_models.max(1)));
        let mut pending: BTreeSet<String> = models.iter().cloned().collect();
        let mut tasks = JoinSet::new();

        for model in models {
            let catalog = Arc::clone(&self.models);
            let prompts = Arc::clone(&self.prompts);
            let semaphore = Arc::clone(&semaphore);
            let values = values.clone();
            let model = model.clone();
            let token = round.token();
            tasks.spawn(async move {
                let outcome =
                    review_with_model(&catalog, &prompts, &model, &values, &semaphore, &token, timeout)
                        .await;
                match outcome {
                    Ok(review) => ComparisonResult::succeeded(model, review),
                    Err(ReviewError::Timeout(after)) => {
                        ComparisonResult::failed(model, format!("generation timed out after {after:?}"))
                    }
                    Err(e) => ComparisonResult::failed(model, format!("model call failed: {e}")),
                }
            });
        }

        let mut results = Vec::with_capacity(total);
        let mut straggler_deadline: Option<Instant> = None;
        loop {
            let deadline = straggler_deadline;
            let stragglers = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(result)) => {
                        debug!("{} finished ({}/{})", result.model, results.len() + 1, total);
                        pending.remove(&result.model);
                        results.push(result);
                        if straggler_deadline.is_none() && results.len() >= quorum && results.len() < total {
                            info!(
                                "Quorum of {}/{} reached, waiting up to {:?} for the rest",
                                results.len(),
                                total,
                                straggler_window
                            );
                            straggler_deadline = Some(Instant::now() + straggler_window);
                        }
                    }
                    Some(Err(e)) => warn!("Review task failed: {}", e),
                    None => break,
                },
                () = stragglers => {
                    warn!("Straggler window elapsed with {}/{} reviews", results.len(), total);
                    break;
                }
                () = cancel.cancelled() => {
                    warn!("Review round cancelled with {}/{} reviews", results.len(), total);
                    break;
                }
            }
        }

        round.cancel();
        tasks.abort_all();

        let reason = if cancel.is_cancelled() {
            "cancelled before responding"
        } else {
            "did not respond before the round ended"
        };
        results.extend(
            pending
                .into_iter()
                .map(|model| ComparisonResult::failed(model, reason)),
        );
        results
    }
}

async fn review_with_model(
    catalog: &ModelCatalog,
    prompts: &PromptManager,
    model: &str,
    values: &PromptValues,
    semaphore: &Semaphore,
    cancel: &CancelToken,
    timeout: Duration,
) -> Result<String> {
    let _permit = cancel
        .run(async { semaphore.acquire().await.map_err(|_| ReviewError::Cancelled) })
        .await?;
    let client: Arc<dyn LanguageModel> = catalog.get(model)?;
    let prompt = prompts.render(PromptKey::CodeReview, model, values)?;

    info!("Generating review with {}", model);
    let deadline = cancel.with_timeout(timeout);
    deadline.run(client.call(&prompt, &deadline)).await
}

fn review_values(request: &ReviewRequest, repo_config: &RepoConfig, context: String) -> PromptValues {
    PromptValues::from([
        ("title", request.title.clone()),
        ("description", request.description.clone()),
        ("language", request.language.clone()),
        ("custom_instructions", repo_config.instructions()),
        ("changed_files", format_changed_files(&request.changed_files)),
        ("context", context),
        ("diff", request.diff.clone()),
    ])
}

/// Markdown list of changed paths
#[inline]
pub fn format_changed_files(files: &[ChangedFile]) -> String {
    files.iter().fold(String::new(), |mut out, file| {
        let _ = writeln!(out, "- `{}`", file.filename);
        out
    })
}

/// Question context: one block per distinct declaration, parent text preferred
fn format_question_context<'a>(
    documents: impl Iterator<Item = &'a IndexedDocument>,
) -> String {
    let mut seen = HashSet::new();
    let mut context = String::new();
    for document in documents {
        let key = document.parent_id.clone().unwrap_or_else(|| {
            format!(
                "{}-{}",
                document.source,
                document.identifier.as_deref().unwrap_or_default()
            )
        });
        if !seen.insert(key) {
            continue;
        }

        let _ = write!(context, "---\nFile: {}\n", document.source);
        if let Some(package) = document.package_name.as_deref().filter(|p| !p.is_empty()) {
            let _ = writeln!(context, "Package: {package}");
        }
        if document.parent_id.is_none() {
            if let Some(identifier) = document.identifier.as_deref().filter(|i| !i.is_empty()) {
                let _ = writeln!(context, "Identifier: {identifier}");
            }
        }
        let _ = write!(context, "\n{}\n---\n\n", document.display_text());
    }
    context
}
