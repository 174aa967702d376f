// Indexer module
// Turns repository files into chunked, embedded documents, skipping files whose content is unchanged


use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::config::{IndexerConfig, RepoConfig};
use crate::database::sqlite::models::{Repository, ScanArtifacts, ScanProgress};
use crate::database::vector::{ChunkKind, DocumentFilter, IndexedDocument, VectorIndex};
use crate::database::{Database, store_error};
use crate::embeddings::{
    ChunkingConfig, Embedder, chunk_code, embed_in_batches, extract_metadata, is_test_file,
};
use crate::summarizer::{ArchitecturalSummarizer, directory_label};
use crate::{Result, ReviewError};

/// Bytes inspected when deciding whether a file is binary
const BINARY_SNIFF_BYTES: usize = 8000;

/// Counts from one indexing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Files chunked and written
    pub indexed: usize,
    /// Files whose content hash matched the stored record
    pub skipped: usize,
    /// Files removed from the index
    pub deleted: usize,
    pub documents_written: usize,
    pub summaries: usize,
}

impl IndexReport {
    fn artifacts(&self) -> ScanArtifacts {
        ScanArtifacts {
            indexed_files: self.indexed as u64,
            skipped_files: self.skipped as u64,
            deleted_files: self.deleted as u64,
            summaries: self.summaries as u64,
        }
    }
}

/// A file read, hashed and chunked, waiting for embeddings
#[derive(Debug)]
struct PreparedFile {
    path: String,
    hash: String,
    documents: Vec<IndexedDocument>,
    /// A record existed, so older chunks of this file may still be stored
    replaces: bool,
}

enum Preparation {
    Unchanged,
    Missing,
    Ready(PreparedFile),
}

pub struct ContentIndexer {
    database: Database,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    summarizer: Option<Arc<ArchitecturalSummarizer>>,
    settings: IndexerConfig,
    embedding_batch_size: usize,
}

impl ContentIndexer {
    #[inline]
    pub fn new(
        database: Database,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        settings: IndexerConfig,
    ) -> Self {
        let embedding_batch_size = settings.batch_size;
        Self {
            database,
            index,
            embedder,
            summarizer: None,
            settings,
            embedding_batch_size,
        }
    }

    /// Refresh architectural summaries after every pass
    #[inline]
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<ArchitecturalSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Texts sent to the embedder per request
    #[inline]
    #[must_use]
    pub fn with_embedding_batch_size(mut self, batch_size: usize) -> Self {
        self.embedding_batch_size = batch_size.max(1);
        self
    }

    /// Index every file under `root`, skipping files whose content is unchanged since the
    /// last pass, then drop what no longer exists on disk.
    #[inline]
    pub async fn index_initial(
        &self,
        repository: &Repository,
        root: &Path,
        repo_config: &RepoConfig,
        cancel: &CancelToken,
    ) -> Result<IndexReport> {
        info!(
            "Indexing {} from {} into {}",
            repository.full_name,
            root.display(),
            repository.collection_name
        );
        self.tracked(repository, self.initial_pass(repository, root, repo_config, cancel))
            .await
    }

    /// Apply a file delta from the synchronizer.
    #[inline]
    pub async fn index_incremental(
        &self,
        repository: &Repository,
        root: &Path,
        to_upsert: &[String],
        to_delete: &[String],
        repo_config: &RepoConfig,
        cancel: &CancelToken,
    ) -> Result<IndexReport> {
        let to_upsert = repo_config.filter_paths(to_upsert);
        let to_delete = repo_config.filter_paths(to_delete);
        info!(
            "Updating {}: {} to index, {} to delete",
            repository.full_name,
            to_upsert.len(),
            to_delete.len()
        );
        self.tracked(
            repository,
            self.incremental_pass(repository, root, to_upsert, to_delete, cancel),
        )
        .await
    }

    /// Record the scan state around a pass
    async fn tracked<F>(&self, repository: &Repository, pass: F) -> Result<IndexReport>
    where
        F: Future<Output = Result<IndexReport>>,
    {
        self.database
            .set_scan_progress(repository.id, &ScanProgress::default())
            .await
            .map_err(store_error)?;

        match pass.await {
            Ok(report) => {
                self.database
                    .complete_scan(repository.id, &report.artifacts())
                    .await
                    .map_err(store_error)?;
                info!(
                    "Indexed {}: {} files indexed, {} unchanged, {} deleted, {} documents written",
                    repository.full_name,
                    report.indexed,
                    report.skipped,
                    report.deleted,
                    report.documents_written
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(state_error) = self.database.fail_scan(repository.id, &e.to_string()).await {
                    warn!("Failed to record scan failure: {}", state_error);
                }
                Err(e)
            }
        }
    }

    async fn initial_pass(
        &self,
        repository: &Repository,
        root: &Path,
        repo_config: &RepoConfig,
        cancel: &CancelToken,
    ) -> Result<IndexReport> {
        let known = self
            .database
            .file_hashes(repository.id)
            .await
            .map_err(store_error)?;
        let mut report = IndexReport::default();

        let mut progress = ScanProgress {
            files_total: walk_files(root, repo_config).count() as u64,
            ..ScanProgress::default()
        };
        let batch_size = self.settings.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);

        for path in walk_files(root, repo_config) {
            batch.push(path);
            if batch.len() == batch_size {
                self.index_batch(repository, root, &known, &mut batch, &mut report, cancel)
                    .await?;
                self.record_progress(repository, &mut progress, batch_size, &report)
                    .await;
            }
        }
        if !batch.is_empty() {
            let remaining = batch.len();
            self.index_batch(repository, root, &known, &mut batch, &mut report, cancel)
                .await?;
            self.record_progress(repository, &mut progress, remaining, &report)
                .await;
        }

        report.deleted = self
            .sweep(repository, root, repo_config, known.into_keys(), cancel)
            .await?;

        if let Some(summarizer) = &self.summarizer {
            report.summaries = summarizer
                .summarize_repository(&repository.collection_name, root, repo_config, cancel)
                .await
                .unwrap_or_else(|e| {
                    warn!("Failed to generate architectural summaries: {}", e);
                    0
                });
        }
        Ok(report)
    }

    async fn incremental_pass(
        &self,
        repository: &Repository,
        root: &Path,
        to_upsert: Vec<String>,
        to_delete: Vec<String>,
        cancel: &CancelToken,
    ) -> Result<IndexReport> {
        let mut report = IndexReport::default();

        if !to_delete.is_empty() {
            cancel
                .run(self.index.delete_by_filter(
                    &repository.collection_name,
                    &code_chunks_of(to_delete.clone()),
                ))
                .await?;
            self.database
                .delete_file_records(repository.id, &to_delete)
                .await
                .map_err(store_error)?;
            report.deleted = to_delete.len();
        }

        if !to_upsert.is_empty() {
            let known = self
                .database
                .file_hashes(repository.id)
                .await
                .map_err(store_error)?;
            let mut batch = to_upsert.clone();
            self.index_batch(repository, root, &known, &mut batch, &mut report, cancel)
                .await?;
        }

        if let Some(summarizer) = &self.summarizer {
            let directories: Vec<String> = to_upsert
                .iter()
                .chain(&to_delete)
                .map(|path| directory_label(path))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            report.summaries = summarizer
                .summarize_paths(&repository.collection_name, root, &directories, cancel)
                .await
                .unwrap_or_else(|e| {
                    warn!("Failed to refresh architectural summaries: {}", e);
                    0
                });
        }
        Ok(report)
    }

    /// Prepare, embed and write one batch with a single bulk upsert. File records are
    /// written only after the documents are stored.
    async fn index_batch(
        &self,
        repository: &Repository,
        root: &Path,
        known: &HashMap<String, String>,
        batch: &mut Vec<String>,
        report: &mut IndexReport,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        let prepared = self.prepare_files(root, known, std::mem::take(batch)).await?;

        let mut ready = Vec::new();
        for preparation in prepared {
            match preparation {
                Preparation::Unchanged => report.skipped += 1,
                Preparation::Missing => {}
                Preparation::Ready(file) => ready.push(file),
            }
        }
        if ready.is_empty() {
            return Ok(());
        }

        let mut documents: Vec<IndexedDocument> = ready
            .iter_mut()
            .flat_map(|file| std::mem::take(&mut file.documents))
            .collect();
        let texts: Vec<String> = documents.iter().map(|doc| doc.content.clone()).collect();
        let vectors =
            embed_in_batches(self.embedder.as_ref(), &texts, self.embedding_batch_size, cancel)
                .await?;
        for (document, vector) in documents.iter_mut().zip(vectors) {
            document.sparse = Some(self.embedder.sparse(&document.content));
            document.vector = vector;
        }

        let replaced: Vec<String> = ready
            .iter()
            .filter(|file| file.replaces)
            .map(|file| file.path.clone())
            .collect();
        if !replaced.is_empty() {
            // Chunk ids follow line ranges, so an edited file can leave stale chunks behind
            cancel
                .run(self.index.delete_by_filter(
                    &repository.collection_name,
                    &code_chunks_of(replaced),
                ))
                .await?;
        }

        if !documents.is_empty() {
            report.documents_written += cancel
                .run(self.index.add_documents(&repository.collection_name, documents))
                .await?;
        }

        let records: Vec<(String, String)> = ready
            .into_iter()
            .map(|file| (file.path, file.hash))
            .collect();
        report.indexed += records.len();
        self.database
            .upsert_file_records(repository.id, &records)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    /// Read, hash and chunk files on a bounded pool of blocking workers
    async fn prepare_files(
        &self,
        root: &Path,
        known: &HashMap<String, String>,
        paths: Vec<String>,
    ) -> Result<Vec<Preparation>> {
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut tasks = JoinSet::new();

        for path in paths {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| ReviewError::Cancelled)?;
            let root = root.to_path_buf();
            let previous = known.get(&path).cloned();
            let chunking = self.settings.chunking.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                prepare_file(&root, path, previous.as_deref(), &chunking)
            });
        }

        let mut prepared = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let preparation = joined
                .map_err(|e| ReviewError::Other(anyhow::anyhow!("File worker failed: {e}")))?;
            prepared.push(preparation);
        }
        Ok(prepared)
    }

    /// Remove records and documents of files that are gone from disk or now excluded
    async fn sweep(
        &self,
        repository: &Repository,
        root: &Path,
        repo_config: &RepoConfig,
        recorded: impl Iterator<Item = String>,
        cancel: &CancelToken,
    ) -> Result<usize> {
        let gone: Vec<String> = recorded
            .filter(|path| {
                repo_config.is_excluded(Path::new(path)) || !root.join(path).is_file()
            })
            .collect();
        if gone.is_empty() {
            return Ok(0);
        }

        info!("Removing {} files that no longer exist", gone.len());
        cancel
            .run(self.index.delete_by_filter(
                &repository.collection_name,
                &code_chunks_of(gone.clone()),
            ))
            .await?;
        self.database
            .delete_file_records(repository.id, &gone)
            .await
            .map_err(store_error)?;
        Ok(gone.len())
    }

    async fn record_progress(
        &self,
        repository: &Repository,
        progress: &mut ScanProgress,
        processed: usize,
        report: &IndexReport,
    ) {
        progress.files_done += processed as u64;
        progress.current_file = None;
        debug!(
            "Indexed {}/{} files ({} written so far)",
            progress.files_done, progress.files_total, report.documents_written
        );
        if let Err(e) = self.database.set_scan_progress(repository.id, progress).await {
            warn!("Failed to record scan progress: {}", e);
        }
    }
}

/// Repository-relative paths of indexable files, streamed in walk order
fn walk_files<'a>(root: &'a Path, repo_config: &'a RepoConfig) -> impl Iterator<Item = String> + 'a {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || entry
                    .path()
                    .strip_prefix(root)
                    .is_ok_and(|relative| !repo_config.is_excluded_dir(relative))
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(move |entry| {
            let relative = entry.path().strip_prefix(root).ok()?;
            (!repo_config.is_excluded(relative))
                .then(|| relative.to_string_lossy().replace('\\', "/"))
        })
}

fn prepare_file(
    root: &Path,
    path: String,
    previous: Option<&str>,
    chunking: &ChunkingConfig,
) -> Preparation {
    let full_path: PathBuf = root.join(&path);
    let bytes = match std::fs::read(&full_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to read {}, skipping: {}", path, e);
            return Preparation::Missing;
        }
    };

    let hash = content_hash(&bytes);
    if previous == Some(hash.as_str()) {
        return Preparation::Unchanged;
    }

    let documents = if is_binary(&bytes) {
        debug!("Not chunking binary file {}", path);
        Vec::new()
    } else {
        let content = String::from_utf8_lossy(&bytes);
        file_documents(&path, &content, chunking)
    };

    Preparation::Ready(PreparedFile {
        path,
        hash,
        documents,
        replaces: previous.is_some(),
    })
}

/// Code documents of one file, without vectors
#[inline]
pub fn file_documents(path: &str, content: &str, chunking: &ChunkingConfig) -> Vec<IndexedDocument> {
    let metadata = extract_metadata(content, path);
    let is_test = is_test_file(path);

    chunk_code(content, path, chunking)
        .into_iter()
        .map(|chunk| {
            let mut document =
                IndexedDocument::code(path, chunk.content, chunk.line_start, chunk.line_end);
            document.identifier = chunk.identifier;
            document.package_name.clone_from(&metadata.package_name);
            document.imports.clone_from(&metadata.imports);
            document.is_test = is_test;
            match (chunk.parent_id, chunk.full_parent_text) {
                (Some(parent_id), Some(parent_text)) => document.with_parent(parent_id, &parent_text),
                _ => document,
            }
        })
        .collect()
}

/// Hex SHA-256 of file content
#[inline]
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Code chunks of the given files. Directory summaries share the `source` column, so
/// file deletes must never match them.
fn code_chunks_of(sources: Vec<String>) -> DocumentFilter {
    DocumentFilter::And(vec![
        DocumentFilter::ChunkKind(ChunkKind::Code),
        DocumentFilter::Sources(sources),
    ])
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(BINARY_SNIFF_BYTES).any(|b| *b == 0)
}
