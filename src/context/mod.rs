// Context assembly
// Gathers architectural, impact, hypothetical-document and description context for a change


use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::Result;
use crate::cancel::CancelToken;
use crate::database::sqlite::models::Repository;
use crate::database::vector::{ChunkKind, DocumentFilter, IndexedDocument, ScoredDocument};
use crate::embeddings::{Language, extract_metadata};
use crate::llm::{
    LanguageModel, PromptKey, PromptManager, PromptValues, SnippetCache, patch_hash, short_hash,
};
use crate::parser::is_safe_path;
use crate::retrieval::Retriever;
use crate::summarizer::directory_label;

/// One file of a change set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    /// Repository-relative path
    pub filename: String,
    /// Unified diff of the file, empty for binary or renamed-only files
    pub patch: String,
}

impl ChangedFile {
    #[inline]
    pub fn new(filename: impl Into<String>, patch: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            patch: patch.into(),
        }
    }
}

/// A retrieved snippet waiting for the merge
#[derive(Debug, Clone)]
struct Snippet {
    source: String,
    /// The changed file that led to this snippet
    origin: String,
    content: String,
    /// `parent_id`, or the source when the chunk has no parent
    key: String,
}

impl Snippet {
    fn from_document(document: &IndexedDocument, origin: &str) -> Self {
        Self {
            source: document.source.clone(),
            origin: origin.to_string(),
            content: document.display_text().to_string(),
            key: document
                .parent_id
                .clone()
                .unwrap_or_else(|| document.source.clone()),
        }
    }
}

/// Dedup state shared by every stage
#[derive(Debug, Default)]
struct SeenSnippets {
    keys: HashSet<String>,
    content: HashSet<String>,
}

impl SeenSnippets {
    fn claim_key(&mut self, key: &str) -> bool {
        self.keys.insert(key.to_string())
    }

    fn claim_content(&mut self, content: &str) -> bool {
        self.content.insert(short_hash(content.as_bytes()))
    }
}

pub struct ContextAssembler {
    retriever: Arc<Retriever>,
    fast_model: Arc<dyn LanguageModel>,
    prompts: Arc<PromptManager>,
    snippets: Arc<SnippetCache>,
}

impl ContextAssembler {
    #[inline]
    pub fn new(
        retriever: Arc<Retriever>,
        fast_model: Arc<dyn LanguageModel>,
        prompts: Arc<PromptManager>,
        snippets: Arc<SnippetCache>,
    ) -> Self {
        Self {
            retriever,
            fast_model,
            prompts,
            snippets,
        }
    }

    /// Build the prompt context for a change.
    ///
    /// The four stages run concurrently and are individually best-effort: a failing stage
    /// contributes nothing and is logged. Sections are merged in a fixed order
    /// (architectural, description, impact, related snippets) and a snippet retrieved by
    /// more than one stage appears once.
    #[inline]
    pub async fn build_context(
        &self,
        repository: &Repository,
        changed_files: &[ChangedFile],
        description: &str,
        cancel: &CancelToken,
    ) -> String {
        let settings = self.retriever.settings();
        let limit = settings.max_changed_files.min(changed_files.len());
        let files = changed_files.get(..limit).unwrap_or(changed_files);
        if files.len() < changed_files.len() {
            info!(
                "Building context from the first {} of {} changed files",
                files.len(),
                changed_files.len()
            );
        }
        if files.is_empty() && description.trim().is_empty() {
            return String::new();
        }

        let collection = repository.collection_name.as_str();
        let root = repository.path();
        let seen = Mutex::new(SeenSnippets::default());

        let (architecture, described, impacted, related) = tokio::join!(
            self.architectural_stage(collection, files, cancel),
            async {
                if settings.enable_description_search {
                    self.description_stage(collection, description, cancel).await
                } else {
                    info!("Skipping description search, disabled in config");
                    Vec::new()
                }
            },
            self.impact_stage(collection, &root, files, &seen, cancel),
            async {
                if settings.enable_hyde {
                    self.hyde_stage(collection, files, cancel).await
                } else {
                    info!("Skipping hypothetical-document search, disabled in config");
                    Vec::new()
                }
            },
        );

        let mut seen = seen.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut context = String::new();

        if !architecture.is_empty() {
            context.push_str("# Architectural Context\n\n");
            context.push_str("The following describes the purpose of the affected modules:\n\n");
            context.push_str(&architecture);
            context.push_str("\n---\n\n");
        }

        let described = described.into_iter().fold(String::new(), |mut out, snippet| {
            if seen.claim_content(&snippet.content) {
                seen.claim_key(&snippet.key);
                let _ = write!(
                    out,
                    "**{}** (matches the change description):\n```\n{}\n```\n\n",
                    snippet.source, snippet.content
                );
            }
            out
        });
        if !described.is_empty() {
            context.push_str("# Code Related to the Change Description\n\n");
            context.push_str(&described);
            context.push_str("---\n\n");
        }

        let impacted = impacted.into_iter().fold(String::new(), |mut out, snippet| {
            if seen.claim_content(&snippet.content) {
                let _ = write!(
                    out,
                    "File: {} (potential ripple effect from {})\n---\n{}\n\n",
                    snippet.source, snippet.origin, snippet.content
                );
            }
            out
        });
        if !impacted.is_empty() {
            info!(
                "Impact analysis found potential ripple effects ({} chars)",
                impacted.len()
            );
            context.push_str("# Potential Impacted Callers & Usages\n\n");
            context.push_str(
                "The following code snippets may be affected by the changes in modified symbols:\n\n",
            );
            context.push_str(&impacted);
            context.push_str("\n---\n\n");
        }

        let related = related.into_iter().fold(String::new(), |mut out, snippet| {
            if !seen.keys.contains(&snippet.key) && seen.claim_content(&snippet.content) {
                seen.claim_key(&snippet.key);
                let _ = write!(
                    out,
                    "**{}** (relevant to {}):\n```\n{}\n```\n\n",
                    snippet.source, snippet.origin, snippet.content
                );
            }
            out
        });
        if !related.is_empty() {
            context.push_str("# Related Code Snippets\n\n");
            context.push_str(&related);
        }

        info!(
            "Built context for {} changed files ({} chars)",
            files.len(),
            context.len()
        );
        context
    }

    /// `## dir` summaries of the directories holding the changed files
    async fn architectural_stage(
        &self,
        collection: &str,
        files: &[ChangedFile],
        cancel: &CancelToken,
    ) -> String {
        info!("Stage started: architectural context");
        let directories: BTreeSet<String> = files
            .iter()
            .map(|file| directory_label(&file.filename))
            .collect();

        let mut context = String::new();
        for directory in directories {
            let found = cancel
                .run(self.retriever.index().find(
                    collection,
                    &DocumentFilter::arch_for(&directory),
                    1,
                ))
                .await;
            match found {
                Ok(documents) => {
                    if let Some(summary) = documents.first() {
                        let _ = write!(context, "## {}\n{}\n\n", directory, summary.content);
                    }
                }
                Err(e) => {
                    warn!("Failed to fetch the summary of {}: {}", directory, e);
                }
            }
        }
        info!("Stage completed: architectural context");
        context
    }

    /// Code that imports the package of a changed file
    async fn impact_stage(
        &self,
        collection: &str,
        root: &Path,
        files: &[ChangedFile],
        seen: &Mutex<SeenSnippets>,
        cancel: &CancelToken,
    ) -> Vec<Snippet> {
        info!("Stage started: impact analysis");
        let settings = self.retriever.settings();
        let semaphore = Semaphore::new(settings.impact_workers.max(1));
        let semaphore = &semaphore;

        let lookups = futures::future::join_all(files.iter().map(|file| async move {
            let _permit = semaphore.acquire().await.ok()?;
            let dependents = self.dependents_of(collection, root, file, cancel).await;
            match dependents {
                Ok(dependents) => Some((file, dependents)),
                Err(e) => {
                    warn!("Impact lookup for {} failed: {}", file.filename, e);
                    None
                }
            }
        }))
        .await;

        let mut snippets = Vec::new();
        'files: for (file, dependents) in lookups.into_iter().flatten() {
            for document in dependents {
                if snippets.len() >= settings.max_impact_snippets {
                    break 'files;
                }
                let claimed = seen
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .claim_key(&document.source);
                if claimed {
                    snippets.push(Snippet::from_document(&document, &file.filename));
                }
            }
        }
        info!(
            "Stage completed: impact analysis ({} snippets)",
            snippets.len()
        );
        snippets
    }

    /// Reverse dependents of one changed file, read from its current content on disk
    async fn dependents_of(
        &self,
        collection: &str,
        root: &Path,
        file: &ChangedFile,
        cancel: &CancelToken,
    ) -> Result<Vec<IndexedDocument>> {
        if !is_safe_path(&file.filename) {
            warn!("Ignoring unsafe changed path {:?}", file.filename);
            return Ok(Vec::new());
        }
        let content = match tokio::fs::read(root.join(&file.filename)).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                // Deleted files have nothing on disk to analyse
                debug!("Cannot read {} for impact analysis: {}", file.filename, e);
                return Ok(Vec::new());
            }
        };

        let metadata = extract_metadata(&content, &file.filename);
        let Some(imported_as) = dependents_filter(&file.filename, metadata.package_name) else {
            return Ok(Vec::new());
        };
        debug!("Looking up dependents of {}: {:?}", file.filename, imported_as);

        let filter = DocumentFilter::And(vec![
            DocumentFilter::ChunkKind(ChunkKind::Code),
            imported_as,
        ]);
        let limit = self.retriever.settings().max_impact_snippets;
        let dependents = cancel
            .run(self.retriever.index().find(collection, &filter, limit))
            .await?;
        Ok(dependents
            .into_iter()
            .filter(|document| document.source != file.filename)
            .collect())
    }

    /// Two-stage search per changed file, driven by the diff and a synthesized snippet
    async fn hyde_stage(
        &self,
        collection: &str,
        files: &[ChangedFile],
        cancel: &CancelToken,
    ) -> Vec<Snippet> {
        info!("Stage started: hypothetical-document search");
        let semaphore = Semaphore::new(self.retriever.settings().hyde_workers.max(1));

        let per_file = futures::future::join_all(
            files
                .iter()
                .filter(|file| !file.patch.trim().is_empty())
                .map(|file| self.search_for_file(collection, file, &semaphore, cancel)),
        )
        .await;

        let snippets: Vec<Snippet> = per_file.into_iter().flatten().collect();
        info!(
            "Stage completed: hypothetical-document search ({} candidates)",
            snippets.len()
        );
        snippets
    }

    async fn search_for_file(
        &self,
        collection: &str,
        file: &ChangedFile,
        semaphore: &Semaphore,
        cancel: &CancelToken,
    ) -> Vec<Snippet> {
        // One permit covers the snippet and both searches of this file
        let Ok(_permit) = cancel
            .run(async { semaphore.acquire().await.map_err(|_| crate::ReviewError::Cancelled) })
            .await
        else {
            return Vec::new();
        };

        let cleaned = clean_diff(&file.patch);
        let mut queries = vec![format!(
            "To understand the impact of changes in the file '{}', find relevant code that interacts with or is related to the following diff:\n{}",
            file.filename, cleaned
        )];
        if let Some(snippet) = self.hypothetical_snippet(file, &cleaned, cancel).await {
            queries.push(snippet);
        }

        let filter = DocumentFilter::ChunkKind(ChunkKind::Code);
        let mut snippets = Vec::new();
        for query in &queries {
            match self
                .retriever
                .recall_and_rerank(collection, query, Some(filter.clone()), cancel)
                .await
            {
                Ok(results) => snippets.extend(
                    results
                        .iter()
                        .map(|scored: &ScoredDocument| &scored.document)
                        .filter(|document| document.chunk_kind == ChunkKind::Code)
                        .map(|document| Snippet::from_document(document, &file.filename)),
                ),
                Err(e) => warn!("Search for {} failed: {}", file.filename, e),
            }
        }
        snippets
    }

    /// Code the fast model expects to find near this change, cached by patch hash
    async fn hypothetical_snippet(
        &self,
        file: &ChangedFile,
        cleaned: &str,
        cancel: &CancelToken,
    ) -> Option<String> {
        let key = patch_hash(&file.patch);
        if let Some(cached) = self.snippets.get(&key) {
            debug!("Hypothetical snippet cache hit for {}", file.filename);
            return Some(cached);
        }

        let values = PromptValues::from([("patch", cleaned.to_string())]);
        let generated = match self
            .prompts
            .render(PromptKey::HydeCode, self.fast_model.model_id(), &values)
        {
            Ok(prompt) => self.fast_model.call(&prompt, cancel).await,
            Err(e) => Err(e),
        };

        match generated {
            Ok(snippet) if !snippet.trim().is_empty() => {
                self.snippets.insert(key, snippet.clone());
                Some(snippet)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(
                    "Failed to synthesize a snippet for {}: {}",
                    file.filename, e
                );
                None
            }
        }
    }

    /// Search with rewrites of the change description, keeping what the fast model
    /// does not reject
    async fn description_stage(
        &self,
        collection: &str,
        description: &str,
        cancel: &CancelToken,
    ) -> Vec<Snippet> {
        let description = description.trim();
        if description.is_empty() {
            return Vec::new();
        }
        info!("Stage started: description search");
        let settings = self.retriever.settings();

        let mut queries = vec![description.to_string()];
        queries.extend(self.rewrite_queries(description, cancel).await);

        let mut hashes = HashSet::new();
        let mut candidates = Vec::new();
        for query in &queries {
            let results = self
                .retriever
                .recall(
                    collection,
                    query,
                    settings.final_k,
                    Some(DocumentFilter::ChunkKind(ChunkKind::Code)),
                    cancel,
                )
                .await;
            match results {
                Ok(results) => {
                    for scored in results {
                        let snippet = Snippet::from_document(&scored.document, "description");
                        if hashes.insert(short_hash(snippet.content.as_bytes())) {
                            candidates.push(snippet);
                        }
                    }
                }
                Err(e) => warn!("Description search for {:?} failed: {}", query, e),
            }
        }

        let verdicts: Vec<bool> = stream::iter(&candidates)
            .map(|snippet| self.is_relevant(description, snippet, cancel))
            .buffered(settings.relevance_workers.max(1))
            .collect()
            .await;
        let kept: Vec<Snippet> = candidates
            .into_iter()
            .zip(verdicts)
            .filter_map(|(snippet, relevant)| relevant.then_some(snippet))
            .collect();

        info!(
            "Stage completed: description search ({} queries, {} snippets kept)",
            queries.len(),
            kept.len()
        );
        kept
    }

    async fn rewrite_queries(&self, description: &str, cancel: &CancelToken) -> Vec<String> {
        let count = self.retriever.settings().max_query_rewrites;
        if count == 0 {
            return Vec::new();
        }
        let values = PromptValues::from([
            ("count", count.to_string()),
            ("description", description.to_string()),
        ]);
        let answer = match self
            .prompts
            .render(PromptKey::QueryRewrite, self.fast_model.model_id(), &values)
        {
            Ok(prompt) => self.fast_model.call(&prompt, cancel).await,
            Err(e) => Err(e),
        };

        match answer {
            Ok(answer) => parse_rewrites(&answer, description, count),
            Err(e) => {
                warn!("Query rewrite failed, searching with the description only: {}", e);
                Vec::new()
            }
        }
    }

    /// Yes/no judgment that keeps the snippet unless the model clearly says no
    async fn is_relevant(&self, description: &str, snippet: &Snippet, cancel: &CancelToken) -> bool {
        let values = PromptValues::from([
            ("description", description.to_string()),
            ("source", snippet.source.clone()),
            ("document", snippet.content.clone()),
        ]);
        let answer = match self
            .prompts
            .render(PromptKey::RelevanceCheck, self.fast_model.model_id(), &values)
        {
            Ok(prompt) => self.fast_model.call(&prompt, cancel).await,
            Err(e) => Err(e),
        };

        match answer {
            Ok(answer) => !is_negative(&answer),
            Err(e) => {
                debug!("Relevance check for {} failed, keeping it: {}", snippet.source, e);
                true
            }
        }
    }
}

/// How dependents of `path` name it in their imports.
///
/// Go imports name a package by its directory, so `internal/billing/invoice.go` is found
/// through imports ending in `/internal/billing`. Other languages import the package the
/// file declares.
fn dependents_filter(path: &str, package: Option<String>) -> Option<DocumentFilter> {
    if Language::from_path(Path::new(path)) == Language::Go {
        let directory = Path::new(path).parent()?.to_str()?.trim_matches('/');
        return (!directory.is_empty())
            .then(|| DocumentFilter::ImportsPathSuffix(directory.to_string()));
    }
    package.map(DocumentFilter::ImportsPackage)
}

/// Additions and context of a unified diff, without headers, hunk markers or deleted lines
#[inline]
pub fn clean_diff(patch: &str) -> String {
    const HEADERS: &[&str] = &[
        "diff --git",
        "index ",
        "--- ",
        "+++ ",
        "@@",
        "new file mode",
        "deleted file mode",
        "old mode",
        "new mode",
        "similarity index",
        "rename from",
        "rename to",
        "Binary files",
        "\\ No newline",
    ];

    let kept: Vec<&str> = patch
        .lines()
        .filter(|line| !HEADERS.iter().any(|header| line.starts_with(header)))
        .filter(|line| !line.starts_with('-'))
        .map(|line| {
            line.strip_prefix('+')
                .or_else(|| line.strip_prefix(' '))
                .unwrap_or(line)
        })
        .collect();
    kept.join("\n")
}

/// Split a multi-file unified diff into per-file patches.
///
/// Files are named by their post-image path, or the pre-image path for deletions.
#[inline]
pub fn split_unified_diff(diff: &str) -> Vec<ChangedFile> {
    let mut files: Vec<ChangedFile> = Vec::new();
    for line in diff.split_inclusive('\n') {
        if let Some(header) = line.strip_prefix("diff --git ") {
            files.push(ChangedFile::new(header_path(header.trim_end()), ""));
        } else if let Some(path) = line.strip_prefix("+++ b/") {
            // Quoted or odd header paths are replaced by the post-image path
            if let Some(file) = files.last_mut() {
                file.filename = path.trim_end().to_string();
            }
        }
        if let Some(file) = files.last_mut() {
            file.patch.push_str(line);
        }
    }
    files
}

/// `a/old b/new` -> `new`
fn header_path(header: &str) -> String {
    header
        .rsplit_once(" b/")
        .map(|(_, path)| path)
        .or_else(|| header.strip_prefix("a/"))
        .unwrap_or(header)
        .to_string()
}

/// One query per line, list markers removed, distinct from the description
fn parse_rewrites(answer: &str, description: &str, count: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    answer
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | ')' | '-' | '*'))
                .trim()
                .trim_matches('"')
                .trim()
        })
        .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case(description))
        .filter(|line| seen.insert(line.to_lowercase()))
        .take(count)
        .map(ToString::to_string)
        .collect()
}

fn is_negative(answer: &str) -> bool {
    let first = answer
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_matches(|c: char| !c.is_ascii_alphabetic())
        .to_ascii_lowercase();
    first == "no"
}
