// Git plumbing behind the version-control contract
// git2 handles are opened per operation on the blocking pool; nothing git2-owned crosses an await


use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Cred, Delta, FetchOptions, Object, ObjectType, RemoteCallbacks, Repository, TreeWalkMode,
    TreeWalkResult,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::{Result, ReviewError};

/// Username paired with token credentials on HTTPS remotes
const TOKEN_USERNAME: &str = "x-access-token";

/// Files changed between two revisions, as repository-relative `/`-separated paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDelta {
    /// Added or modified, including the new side of a rename
    pub upserted: Vec<String>,
    /// Removed, including the old side of a rename
    pub deleted: Vec<String>,
}

/// Version-control operations needed to keep a local clone current.
///
/// Each call is bounded by the caller's cancellation token.
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn clone_repo(
        &self,
        url: &str,
        path: &Path,
        credentials: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<()>;

    async fn fetch(&self, path: &Path, credentials: Option<&str>, cancel: &CancelToken) -> Result<()>;

    /// Force the working tree to `revision`, a commit id or a branch name
    async fn checkout(&self, path: &Path, revision: &str, cancel: &CancelToken) -> Result<()>;

    async fn diff(&self, path: &Path, from: &str, to: &str, cancel: &CancelToken) -> Result<TreeDelta>;

    async fn head_revision(&self, path: &Path, cancel: &CancelToken) -> Result<String>;

    /// Every file tracked at HEAD
    async fn list_files(&self, path: &Path, cancel: &CancelToken) -> Result<Vec<String>>;

    /// Whether a clone exists at `path`
    #[inline]
    fn is_cloned(&self, path: &Path) -> bool {
        path.join(".git").is_dir()
    }
}

/// [`VersionControl`] on top of libgit2
#[derive(Debug, Clone, Copy, Default)]
pub struct GitClient;

impl GitClient {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VersionControl for GitClient {
    async fn clone_repo(
        &self,
        url: &str,
        path: &Path,
        credentials: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<()> {
        info!("Cloning {} into {}", url, path.display());
        let url = url.to_string();
        let path = path.to_path_buf();
        let credentials = credentials.map(str::to_string);
        let token = cancel.clone();

        blocking(cancel, move || {
            let mut builder = RepoBuilder::new();
            builder.fetch_options(fetch_options(credentials, token));
            builder
                .clone(&url, &path)
                .map_err(|e| vcs_error(&format!("Failed to clone {url}"), &e))?;
            Ok(())
        })
        .await
    }

    async fn fetch(&self, path: &Path, credentials: Option<&str>, cancel: &CancelToken) -> Result<()> {
        debug!("Fetching origin for {}", path.display());
        let path = path.to_path_buf();
        let credentials = credentials.map(str::to_string);
        let token = cancel.clone();

        blocking(cancel, move || {
            let repo = open(&path)?;
            let mut remote = repo
                .find_remote("origin")
                .map_err(|e| vcs_error("Repository has no origin remote", &e))?;
            remote
                .fetch(
                    &["+refs/heads/*:refs/remotes/origin/*"],
                    Some(&mut fetch_options(credentials, token)),
                    None,
                )
                .map_err(|e| vcs_error("Failed to fetch from origin", &e))?;
            Ok(())
        })
        .await
    }

    async fn checkout(&self, path: &Path, revision: &str, cancel: &CancelToken) -> Result<()> {
        debug!("Checking out {} in {}", revision, path.display());
        let path = path.to_path_buf();
        let revision = revision.to_string();

        blocking(cancel, move || {
            let repo = open(&path)?;
            let commit = resolve(&repo, &revision)?
                .peel_to_commit()
                .map_err(|e| vcs_error(&format!("{revision} is not a commit"), &e))?;

            let mut checkout = CheckoutBuilder::new();
            checkout.force();
            repo.checkout_tree(commit.as_object(), Some(&mut checkout))
                .map_err(|e| vcs_error(&format!("Failed to check out {revision}"), &e))?;
            repo.set_head_detached(commit.id())
                .map_err(|e| vcs_error(&format!("Failed to move HEAD to {revision}"), &e))?;
            Ok(())
        })
        .await
    }

    async fn diff(&self, path: &Path, from: &str, to: &str, cancel: &CancelToken) -> Result<TreeDelta> {
        let path = path.to_path_buf();
        let from = from.to_string();
        let to = to.to_string();

        blocking(cancel, move || {
            let repo = open(&path)?;
            let old_tree = resolve(&repo, &from)?
                .peel_to_tree()
                .map_err(|e| vcs_error(&format!("No tree for {from}"), &e))?;
            let new_tree = resolve(&repo, &to)?
                .peel_to_tree()
                .map_err(|e| vcs_error(&format!("No tree for {to}"), &e))?;

            let diff = repo
                .diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)
                .map_err(|e| vcs_error(&format!("Failed to diff {from}..{to}"), &e))?;

            let mut delta = TreeDelta::default();
            for change in diff.deltas() {
                let old_path = change.old_file().path().map(relative_path);
                let new_path = change.new_file().path().map(relative_path);
                match change.status() {
                    Delta::Added | Delta::Copied | Delta::Modified | Delta::Typechange => {
                        delta.upserted.extend(new_path);
                    }
                    Delta::Deleted => delta.deleted.extend(old_path),
                    Delta::Renamed => {
                        delta.deleted.extend(old_path);
                        delta.upserted.extend(new_path);
                    }
                    _ => {}
                }
            }

            debug!(
                "Diff {}..{}: {} to upsert, {} to delete",
                from,
                to,
                delta.upserted.len(),
                delta.deleted.len()
            );
            Ok(delta)
        })
        .await
    }

    async fn head_revision(&self, path: &Path, cancel: &CancelToken) -> Result<String> {
        let path = path.to_path_buf();
        blocking(cancel, move || {
            let repo = open(&path)?;
            let head = repo
                .head()
                .and_then(|head| head.peel_to_commit())
                .map_err(|e| vcs_error("Failed to resolve HEAD", &e))?;
            Ok(head.id().to_string())
        })
        .await
    }

    async fn list_files(&self, path: &Path, cancel: &CancelToken) -> Result<Vec<String>> {
        let path = path.to_path_buf();
        blocking(cancel, move || {
            let repo = open(&path)?;
            let tree = repo
                .head()
                .and_then(|head| head.peel_to_tree())
                .map_err(|e| vcs_error("Failed to resolve HEAD tree", &e))?;

            let mut files = Vec::new();
            tree.walk(TreeWalkMode::PreOrder, |root, entry| {
                if entry.kind() == Some(ObjectType::Blob) {
                    if let Some(name) = entry.name() {
                        files.push(format!("{root}{name}"));
                    }
                }
                TreeWalkResult::Ok
            })
            .map_err(|e| vcs_error("Failed to walk HEAD tree", &e))?;

            Ok(files)
        })
        .await
    }
}

/// Run a git2 operation on the blocking pool, racing it against `cancel`
async fn blocking<T, F>(cancel: &CancelToken, operation: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    cancel
        .run(async move {
            tokio::task::spawn_blocking(operation)
                .await
                .map_err(|e| ReviewError::Vcs(format!("Git task failed: {e}")))?
        })
        .await
}

fn open(path: &Path) -> Result<Repository> {
    Repository::open(path)
        .map_err(|e| vcs_error(&format!("Failed to open repository at {}", path.display()), &e))
}

/// Remote-tracking branches win over same-named local ones, so a fetched branch name
/// resolves to what origin has now
fn resolve<'r>(repo: &'r Repository, revision: &str) -> Result<Object<'r>> {
    repo.revparse_single(&format!("refs/remotes/origin/{revision}"))
        .or_else(|_| repo.revparse_single(revision))
        .map_err(|e| vcs_error(&format!("Unknown revision {revision}"), &e))
}

fn fetch_options(credentials: Option<String>, cancel: CancelToken) -> FetchOptions<'static> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(token) = credentials.filter(|token| !token.is_empty()) {
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext(TOKEN_USERNAME, &token)
        });
    }
    // Returning false aborts the transfer
    callbacks.transfer_progress(move |_| !cancel.is_cancelled());

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

fn relative_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn vcs_error(context: &str, error: &git2::Error) -> ReviewError {
    ReviewError::Vcs(format!("{context}: {}", error.message()))
}

/// `{repos_dir}/{owner}/{name}` for a full name like `owner/name`.
///
/// Both components must be plain directory names so the clone cannot land outside `repos_dir`.
#[inline]
pub fn clone_path(repos_dir: &Path, full_name: &str) -> Result<PathBuf> {
    let invalid = || ReviewError::Config(format!("Invalid repository name: {full_name:?}"));

    let (owner, name) = full_name.split_once('/').ok_or_else(invalid)?;
    for component in [owner, name] {
        let plain = !component.is_empty()
            && component != "."
            && component != ".."
            && component
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !plain {
            return Err(invalid());
        }
    }

    Ok(repos_dir.join(owner).join(name))
}
