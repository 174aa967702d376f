// Architectural summaries
// One model-written summary per source directory, regenerated only when the directory's file set changes


use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::config::RepoConfig;
use crate::database::vector::{DocumentFilter, IndexedDocument, VectorIndex};
use crate::embeddings::{ChunkingConfig, Embedder, chunk_code, extract_metadata};
use crate::llm::{LanguageModel, PromptKey, PromptManager, PromptValues, SummaryCache, short_hash};
use crate::{Result, ReviewError};

/// Label of the repository root directory
pub const ROOT_LABEL: &str = "root";

/// Extensions whose files make a directory worth summarizing
pub const CODE_EXTENSIONS: &[&str] = &[
    "go", "js", "ts", "tsx", "jsx", "py", "java", "c", "cpp", "h", "hpp", "rs", "rb", "php", "cs",
    "swift", "kt", "scala",
];

/// Symbols listed per directory in the summary prompt
const MAX_PROMPT_SYMBOLS: usize = 200;

/// Code files and symbols of one directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryInfo {
    /// Repository-relative directory, or [`ROOT_LABEL`]
    pub path: String,
    /// File names, sorted
    pub files: Vec<String>,
    pub symbols: Vec<String>,
    pub imports: Vec<String>,
    pub content_hash: String,
}

pub struct ArchitecturalSummarizer {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn LanguageModel>,
    prompts: Arc<PromptManager>,
    cache: Arc<SummaryCache>,
    workers: usize,
}

impl ArchitecturalSummarizer {
    #[inline]
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
        prompts: Arc<PromptManager>,
        cache: Arc<SummaryCache>,
        workers: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            model,
            prompts,
            cache,
            workers: workers.max(1),
        }
    }

    /// Refresh the summaries of every non-hidden, non-excluded directory under `root`.
    ///
    /// Returns the number of summaries written.
    #[inline]
    pub async fn summarize_repository(
        &self,
        collection: &str,
        root: &Path,
        repo_config: &RepoConfig,
        cancel: &CancelToken,
    ) -> Result<usize> {
        info!("Generating architectural summaries for {}", root.display());

        let mut labels = Vec::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || entry
                    .path()
                    .strip_prefix(root)
                    .is_ok_and(|relative| !repo_config.is_excluded_dir(relative))
        });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry while summarizing: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                if let Ok(relative) = entry.path().strip_prefix(root) {
                    labels.push(label_for_relative(relative));
                }
            }
        }

        self.refresh(collection, root, labels, cancel).await
    }

    /// Refresh only the given directories (labels as produced by [`directory_label`]).
    ///
    /// A directory that no longer holds code loses its summary.
    #[inline]
    pub async fn summarize_paths(
        &self,
        collection: &str,
        root: &Path,
        directories: &[String],
        cancel: &CancelToken,
    ) -> Result<usize> {
        let labels: BTreeSet<String> = directories.iter().cloned().collect();
        debug!("Refreshing summaries for {} directories", labels.len());
        self.refresh(collection, root, labels.into_iter().collect(), cancel)
            .await
    }

    async fn refresh(
        &self,
        collection: &str,
        root: &Path,
        labels: Vec<String>,
        cancel: &CancelToken,
    ) -> Result<usize> {
        let mut stale = Vec::new();
        let mut fresh = 0_usize;

        for label in labels {
            cancel.check()?;
            let Some(directory) = directory_path(root, &label) else {
                warn!("Ignoring directory outside the repository: {}", label);
                continue;
            };

            let Some(info) = scan_directory(&directory, &label)? else {
                self.forget(collection, &label).await;
                continue;
            };

            if self.is_fresh(collection, &info).await {
                fresh += 1;
                continue;
            }
            stale.push(info);
        }

        info!(
            "Summary check complete: {} up to date, {} to generate",
            fresh,
            stale.len()
        );
        if stale.is_empty() {
            return Ok(0);
        }

        let mut documents = self.generate(root, stale, cancel).await;
        if documents.is_empty() {
            warn!("No architectural summaries were generated");
            return Ok(0);
        }

        let texts: Vec<String> = documents.iter().map(|doc| doc.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts, cancel).await?;
        if vectors.len() != documents.len() {
            return Err(ReviewError::Embedding(format!(
                "Mismatch between request and response counts: {} vs {}",
                documents.len(),
                vectors.len()
            )));
        }
        for (document, vector) in documents.iter_mut().zip(vectors) {
            document.sparse = Some(self.embedder.sparse(&document.content));
            document.vector = vector;
        }

        let hashes: Vec<(String, String)> = documents
            .iter()
            .filter_map(|doc| Some((doc.source.clone(), doc.content_hash.clone()?)))
            .collect();
        let written = cancel
            .run(self.index.add_documents(collection, documents))
            .await?;
        for (label, hash) in hashes {
            self.cache.insert(cache_key(collection, &label), hash);
        }

        info!("Stored {} architectural summaries in {}", written, collection);
        Ok(written)
    }

    /// Whether the stored summary was built from the same file set
    async fn is_fresh(&self, collection: &str, info: &DirectoryInfo) -> bool {
        let key = cache_key(collection, &info.path);
        if self.cache.get(&key).as_deref() == Some(info.content_hash.as_str()) {
            return true;
        }

        match self
            .index
            .find(collection, &DocumentFilter::arch_for(&info.path), 1)
            .await
        {
            Ok(stored) => {
                let stored_hash = stored.into_iter().next().and_then(|doc| doc.content_hash);
                if stored_hash.as_deref() == Some(info.content_hash.as_str()) {
                    self.cache.insert(key, info.content_hash.clone());
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                warn!("Failed to look up the summary of {}: {}", info.path, e);
                false
            }
        }
    }

    async fn forget(&self, collection: &str, label: &str) {
        self.cache.remove(&cache_key(collection, label));
        if let Err(e) = self
            .index
            .delete_by_filter(collection, &DocumentFilter::arch_for(label))
            .await
        {
            warn!("Failed to remove the summary of {}: {}", label, e);
        }
    }

    /// Summarize directories on a bounded pool; failures are logged and skipped
    async fn generate(
        &self,
        root: &Path,
        stale: Vec<DirectoryInfo>,
        cancel: &CancelToken,
    ) -> Vec<IndexedDocument> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for info in stale {
            let semaphore = Arc::clone(&semaphore);
            let model = Arc::clone(&self.model);
            let prompts = Arc::clone(&self.prompts);
            let cancel = cancel.clone();
            let directory = directory_path(root, &info.path).unwrap_or_else(|| root.to_path_buf());

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ReviewError::Cancelled)?;
                let label = info.path.clone();
                match summarize_directory(model.as_ref(), &prompts, directory, info, &cancel).await {
                    Ok(document) => Ok::<_, ReviewError>(document),
                    Err(e) => {
                        warn!("Failed to summarize {}: {}", label, e);
                        Ok(None)
                    }
                }
            });
        }

        let mut documents = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some(document))) => documents.push(document),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!("Summary worker stopped: {}", e),
                Err(e) => warn!("Summary worker panicked: {}", e),
            }
        }
        documents
    }
}

async fn summarize_directory(
    model: &dyn LanguageModel,
    prompts: &PromptManager,
    directory: PathBuf,
    mut info: DirectoryInfo,
    cancel: &CancelToken,
) -> Result<Option<IndexedDocument>> {
    let files = info.files.clone();
    let (symbols, imports) = tokio::task::spawn_blocking(move || gather_symbols(&directory, &files))
        .await
        .map_err(|e| ReviewError::Other(anyhow::anyhow!("Symbol scan failed: {e}")))?;
    info.symbols = symbols;
    info.imports = imports;

    let values = PromptValues::from([
        ("path", info.path.clone()),
        ("files", info.files.join("\n")),
        ("symbols", info.symbols.join("\n")),
        ("imports", info.imports.join("\n")),
    ]);
    let prompt = prompts.render(PromptKey::ArchSummary, model.model_id(), &values)?;
    let summary = model.call(&prompt, cancel).await?;
    let summary = summary.trim();
    if summary.is_empty() {
        debug!("Empty summary for {}", info.path);
        return Ok(None);
    }

    debug!("Summarized {} in {} characters", info.path, summary.len());
    let file_count = u32::try_from(info.files.len()).unwrap_or(u32::MAX);
    Ok(Some(IndexedDocument::arch(
        &info.path,
        summary.to_string(),
        info.content_hash,
        file_count,
    )))
}

/// Declarations (as `kind: name`) and imports found in the directory's code files
fn gather_symbols(directory: &Path, files: &[String]) -> (Vec<String>, Vec<String>) {
    let chunking = ChunkingConfig::default();
    let mut symbols = BTreeSet::new();
    let mut imports = BTreeSet::new();

    for file in files {
        let Ok(bytes) = std::fs::read(directory.join(file)) else {
            continue;
        };
        let content = String::from_utf8_lossy(&bytes);
        for chunk in chunk_code(&content, file, &chunking) {
            if let Some(identifier) = chunk.identifier {
                symbols.insert(format!("{}: {}", chunk.kind, identifier));
            }
        }
        imports.extend(extract_metadata(&content, file).imports);
    }

    (
        symbols.into_iter().take(MAX_PROMPT_SYMBOLS).collect(),
        imports.into_iter().collect(),
    )
}

/// The code files of one directory and their fingerprint, or `None` when it holds no code.
///
/// The fingerprint covers file names and sizes only; modification times change on every
/// checkout.
#[inline]
pub fn scan_directory(directory: &Path, label: &str) -> Result<Option<DirectoryInfo>> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut files: Vec<(String, u64)> = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !is_code_file(&name) {
            continue;
        }
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            files.push((name, metadata.len()));
        }
    }
    if files.is_empty() {
        return Ok(None);
    }
    files.sort();

    let fingerprint = files.iter().fold(String::new(), |mut out, (name, size)| {
        let _ = write!(out, "{name}:{size}|");
        out
    });

    Ok(Some(DirectoryInfo {
        path: label.to_string(),
        files: files.into_iter().map(|(name, _)| name).collect(),
        symbols: Vec::new(),
        imports: Vec::new(),
        content_hash: short_hash(fingerprint.as_bytes()),
    }))
}

/// Summary label of the directory holding `file`
#[inline]
pub fn directory_label(file: &str) -> String {
    let normalized = file.replace('\\', "/");
    match normalized.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() && dir != "." => dir.to_string(),
        _ => ROOT_LABEL.to_string(),
    }
}

#[inline]
pub fn is_code_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            CODE_EXTENSIONS
                .iter()
                .any(|code| code.eq_ignore_ascii_case(ext))
        })
}

fn label_for_relative(relative: &Path) -> String {
    if relative.as_os_str().is_empty() {
        ROOT_LABEL.to_string()
    } else {
        relative.to_string_lossy().replace('\\', "/")
    }
}

/// On-disk directory for a label; `None` when the label would leave `root`
fn directory_path(root: &Path, label: &str) -> Option<PathBuf> {
    if label == ROOT_LABEL {
        return Some(root.to_path_buf());
    }
    let relative = Path::new(label);
    relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
        .then(|| root.join(relative))
}

fn cache_key(collection: &str, label: &str) -> String {
    format!("{collection}:{label}")
}
