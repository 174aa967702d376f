// Repository synchronization
// Keeps one local clone per repository and reports which files changed since the last index

#[cfg(test)]
mod tests;

pub mod git;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::Result;
use crate::cancel::CancelToken;
use crate::database::sqlite::models::{NewRepository, Repository, RepositoryUpdate};
use crate::database::{Database, VectorIndex, store_error};

pub use git::{GitClient, TreeDelta, VersionControl, clone_path};

/// Longest collection name accepted by the vector index backends
const MAX_COLLECTION_NAME_CHARS: usize = 255;

/// Identity of a remote repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    /// `owner/name`
    pub full_name: String,
    pub clone_url: String,
}

impl RepositoryRef {
    #[inline]
    pub fn new(full_name: impl Into<String>, clone_url: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            clone_url: clone_url.into(),
        }
    }
}

/// Outcome of one sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub repository: Repository,
    pub files_to_upsert: Vec<String>,
    pub files_to_delete: Vec<String>,
    pub local_path: PathBuf,
    /// Every tracked file is listed for upsert and the index must be rebuilt from scratch
    pub is_initial_clone: bool,
    pub head_revision: String,
}

/// Owns the local clones under `repos_dir` and their bookkeeping rows.
pub struct RepositorySynchronizer {
    database: Database,
    index: Arc<dyn VectorIndex>,
    vcs: Arc<dyn VersionControl>,
    repos_dir: PathBuf,
    embedder_model: String,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepositorySynchronizer {
    #[inline]
    pub fn new(
        database: Database,
        index: Arc<dyn VectorIndex>,
        vcs: Arc<dyn VersionControl>,
        repos_dir: PathBuf,
        embedder_model: impl Into<String>,
    ) -> Self {
        Self {
            database,
            index,
            vcs,
            repos_dir,
            embedder_model: embedder_model.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Bring the local clone to `target_revision` and compute the file delta.
    ///
    /// Syncs of the same repository are serialized; different repositories proceed in
    /// parallel. The indexed revision is not advanced here, see [`Self::mark_indexed`].
    #[inline]
    pub async fn sync(
        &self,
        repo: &RepositoryRef,
        target_revision: &str,
        credentials: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<SyncResult> {
        let local_path = clone_path(&self.repos_dir, &repo.full_name)?;

        let lock = self.lock_for(&repo.full_name);
        let _guard = cancel.run(async { Ok(lock.lock().await) }).await?;

        let collection = collection_name(&repo.full_name, &self.embedder_model);
        let mut record = self
            .database
            .get_repository(&repo.full_name)
            .await
            .map_err(store_error)?;

        let mut reset = false;
        if let Some(existing) = record.as_ref() {
            if existing.embedder_model != self.embedder_model {
                warn!(
                    "Embedding model for {} changed from {} to {}, rebuilding its index",
                    repo.full_name, existing.embedder_model, self.embedder_model
                );
                self.reset_index(existing, &collection).await?;
                reset = true;
            }
        }

        let needs_clone = record.is_none() || reset || !self.vcs.is_cloned(&local_path);
        if needs_clone {
            self.fresh_clone(repo, &local_path, credentials, cancel).await?;
        } else {
            self.vcs.fetch(&local_path, credentials, cancel).await?;
        }
        self.vcs.checkout(&local_path, target_revision, cancel).await?;
        let head_revision = self.vcs.head_revision(&local_path, cancel).await?;

        let previous = record
            .as_ref()
            .filter(|_| !needs_clone)
            .and_then(|existing| existing.last_indexed_sha.clone());
        let delta = match previous {
            Some(previous) if previous == head_revision => Some(TreeDelta::default()),
            Some(previous) => match self
                .vcs
                .diff(&local_path, &previous, &head_revision, cancel)
                .await
            {
                Ok(delta) => Some(delta),
                Err(e) if !e.is_unreachable() => {
                    warn!(
                        "Diff {}..{} failed for {}, falling back to a full index: {}",
                        previous, head_revision, repo.full_name, e
                    );
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        let (files_to_upsert, files_to_delete, is_initial_clone) = match delta {
            Some(delta) => (delta.upserted, delta.deleted, false),
            None => (self.vcs.list_files(&local_path, cancel).await?, Vec::new(), true),
        };

        let local_path_text = local_path.to_string_lossy().to_string();
        let repository = match record.take() {
            None => self
                .database
                .create_repository(NewRepository {
                    full_name: repo.full_name.clone(),
                    clone_url: repo.clone_url.clone(),
                    local_path: local_path_text,
                    collection_name: collection,
                    embedder_model: self.embedder_model.clone(),
                })
                .await
                .map_err(store_error)?,
            Some(existing) => self
                .database
                .update_repository(
                    existing.id,
                    RepositoryUpdate {
                        clone_url: Some(repo.clone_url.clone()),
                        local_path: Some(local_path_text),
                        ..RepositoryUpdate::default()
                    },
                )
                .await
                .map_err(store_error)?
                .unwrap_or(existing),
        };

        info!(
            "Synced {} at {}: {} to upsert, {} to delete{}",
            repo.full_name,
            head_revision,
            files_to_upsert.len(),
            files_to_delete.len(),
            if is_initial_clone { " (full index)" } else { "" }
        );

        Ok(SyncResult {
            repository,
            files_to_upsert,
            files_to_delete,
            local_path,
            is_initial_clone,
            head_revision,
        })
    }

    /// Record that the index now reflects `revision`
    #[inline]
    pub async fn mark_indexed(&self, repository: &Repository, revision: &str) -> Result<()> {
        self.database
            .update_repository(
                repository.id,
                RepositoryUpdate {
                    last_indexed_sha: Some(Some(revision.to_string())),
                    ..RepositoryUpdate::default()
                },
            )
            .await
            .map_err(store_error)?;
        Ok(())
    }

    #[inline]
    pub fn embedder_model(&self) -> &str {
        &self.embedder_model
    }

    /// Per-repository lock. Entries nobody else holds are dropped on the way, so the map
    /// only covers repositories with a sync in flight.
    fn lock_for(&self, full_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(full_name.to_string()).or_default())
    }

    /// Forget everything indexed under the previous embedding model
    async fn reset_index(&self, existing: &Repository, collection: &str) -> Result<()> {
        if let Err(e) = self.index.drop_collection(&existing.collection_name).await {
            warn!(
                "Failed to drop collection {}: {}",
                existing.collection_name, e
            );
        }
        self.database
            .clear_file_records(existing.id)
            .await
            .map_err(store_error)?;
        self.database
            .update_repository(
                existing.id,
                RepositoryUpdate {
                    collection_name: Some(collection.to_string()),
                    embedder_model: Some(self.embedder_model.clone()),
                    last_indexed_sha: Some(None),
                    ..RepositoryUpdate::default()
                },
            )
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn fresh_clone(
        &self,
        repo: &RepositoryRef,
        local_path: &Path,
        credentials: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<()> {
        info!("Cloning {} into {}", repo.full_name, local_path.display());
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // A partial clone from an earlier failure would make the clone fail
        remove_dir_if_present(local_path).await;

        let cloned = self
            .vcs
            .clone_repo(&repo.clone_url, local_path, credentials, cancel)
            .await;
        if cloned.is_err() {
            remove_dir_if_present(local_path).await;
        }
        cloned
    }
}

async fn remove_dir_if_present(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Deterministic collection name for a repository and embedding model.
///
/// `repo-{full name}-{model family}` lowercased, with `/` turned into `-`, the model tag
/// after `:` dropped and anything outside `[a-z0-9_-]` removed.
#[inline]
pub fn collection_name(full_name: &str, embedder_model: &str) -> String {
    let safe = |raw: &str| -> String {
        raw.to_lowercase()
            .replace('/', "-")
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
            .collect()
    };
    let family = embedder_model.split(':').next().unwrap_or_default();

    let mut name = format!("repo-{}-{}", safe(full_name), safe(family));
    name.truncate(MAX_COLLECTION_NAME_CHARS);
    name
}
