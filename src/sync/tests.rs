use super::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use crate::ReviewError;
use crate::database::MemoryVectorIndex;
use crate::database::vector::IndexedDocument;

/// Scripted version control that records how many operations overlap
#[derive(Default)]
struct CountingVcs {
    active: AtomicUsize,
    max_active: AtomicUsize,
    clones: AtomicUsize,
    fetches: AtomicUsize,
    fail_clone: bool,
    head: Mutex<String>,
    diffs: Mutex<Vec<(String, String)>>,
}

impl CountingVcs {
    fn at(head: &str) -> Self {
        Self {
            head: Mutex::new(head.to_string()),
            ..Self::default()
        }
    }

    fn move_head(&self, head: &str) {
        *self.head.lock().unwrap_or_else(PoisonError::into_inner) = head.to_string();
    }

    async fn busy(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VersionControl for CountingVcs {
    async fn clone_repo(
        &self,
        _url: &str,
        path: &Path,
        _credentials: Option<&str>,
        _cancel: &CancelToken,
    ) -> Result<()> {
        self.busy().await;
        self.clones.fetch_add(1, Ordering::SeqCst);
        if self.fail_clone {
            std::fs::create_dir_all(path)?;
            return Err(ReviewError::Vcs("remote hung up".to_string()));
        }
        std::fs::create_dir_all(path.join(".git"))?;
        Ok(())
    }

    async fn fetch(&self, _path: &Path, _credentials: Option<&str>, _cancel: &CancelToken) -> Result<()> {
        self.busy().await;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn checkout(&self, _path: &Path, _revision: &str, _cancel: &CancelToken) -> Result<()> {
        Ok(())
    }

    async fn diff(&self, _path: &Path, from: &str, to: &str, _cancel: &CancelToken) -> Result<TreeDelta> {
        self.diffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((from.to_string(), to.to_string()));
        Ok(TreeDelta {
            upserted: vec!["src/changed.rs".to_string()],
            deleted: vec!["src/removed.rs".to_string()],
        })
    }

    async fn head_revision(&self, _path: &Path, _cancel: &CancelToken) -> Result<String> {
        Ok(self.head.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn list_files(&self, _path: &Path, _cancel: &CancelToken) -> Result<Vec<String>> {
        Ok(vec!["README.md".to_string(), "src/lib.rs".to_string()])
    }
}

struct Fixture {
    _dir: TempDir,
    repos_dir: PathBuf,
    database: Database,
    index: Arc<MemoryVectorIndex>,
}

impl Fixture {
    async fn new() -> Self {
        let dir = TempDir::new().expect("can create temp dir");
        let database = Database::initialize_from_config_dir(dir.path())
            .await
            .expect("can open database");
        Self {
            repos_dir: dir.path().join("repos"),
            _dir: dir,
            database,
            index: Arc::new(MemoryVectorIndex::new()),
        }
    }

    fn synchronizer(&self, vcs: &Arc<CountingVcs>, model: &str) -> RepositorySynchronizer {
        RepositorySynchronizer::new(
            self.database.clone(),
            Arc::clone(&self.index) as Arc<dyn VectorIndex>,
            Arc::clone(vcs) as Arc<dyn VersionControl>,
            self.repos_dir.clone(),
            model,
        )
    }
}

fn widgets() -> RepositoryRef {
    RepositoryRef::new("acme/widgets", "https://example.com/acme/widgets.git")
}

#[tokio::test]
async fn first_sync_clones_and_lists_every_file() {
    let fixture = Fixture::new().await;
    let vcs = Arc::new(CountingVcs::at("aaa"));
    let sync = fixture.synchronizer(&vcs, "nomic-embed-text:latest");

    let result = sync
        .sync(&widgets(), "main", None, &CancelToken::never())
        .await
        .expect("can sync");

    assert!(result.is_initial_clone);
    assert_eq!(result.files_to_upsert, vec!["README.md", "src/lib.rs"]);
    assert!(result.files_to_delete.is_empty());
    assert_eq!(result.head_revision, "aaa");
    assert_eq!(result.local_path, fixture.repos_dir.join("acme/widgets"));
    assert_eq!(result.repository.collection_name, "repo-acme-widgets-nomic-embed-text");
    assert_eq!(result.repository.last_indexed_sha, None);
    assert_eq!(vcs.clones.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn later_syncs_diff_from_the_indexed_revision() {
    let fixture = Fixture::new().await;
    let vcs = Arc::new(CountingVcs::at("aaa"));
    let sync = fixture.synchronizer(&vcs, "nomic-embed-text");
    let cancel = CancelToken::never();

    let first = sync.sync(&widgets(), "aaa", None, &cancel).await.expect("can sync");
    sync.mark_indexed(&first.repository, &first.head_revision)
        .await
        .expect("can record revision");

    vcs.move_head("bbb");
    let second = sync.sync(&widgets(), "bbb", None, &cancel).await.expect("can sync again");

    assert!(!second.is_initial_clone);
    assert_eq!(second.files_to_upsert, vec!["src/changed.rs"]);
    assert_eq!(second.files_to_delete, vec!["src/removed.rs"]);
    assert_eq!(vcs.clones.load(Ordering::SeqCst), 1);
    assert_eq!(vcs.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(
        *vcs.diffs.lock().unwrap_or_else(PoisonError::into_inner),
        vec![("aaa".to_string(), "bbb".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn syncs_of_one_repository_are_serialized() {
    let fixture = Fixture::new().await;
    let vcs = Arc::new(CountingVcs::at("aaa"));
    let sync = fixture.synchronizer(&vcs, "nomic-embed-text");
    let cancel = CancelToken::never();

    let repo = widgets();
    let (a, b, c) = tokio::join!(
        sync.sync(&repo, "aaa", None, &cancel),
        sync.sync(&repo, "aaa", None, &cancel),
        sync.sync(&repo, "aaa", None, &cancel),
    );
    for result in [a, b, c] {
        result.expect("can sync");
    }

    assert_eq!(vcs.max_active.load(Ordering::SeqCst), 1);
    // Only the first caller clones; the others find the clone and fetch
    assert_eq!(vcs.clones.load(Ordering::SeqCst), 1);
    assert_eq!(vcs.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(
        fixture
            .database
            .list_repositories()
            .await
            .expect("can list")
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_repositories_sync_in_parallel() {
    let fixture = Fixture::new().await;
    let vcs = Arc::new(CountingVcs::at("aaa"));
    let sync = fixture.synchronizer(&vcs, "nomic-embed-text");
    let cancel = CancelToken::never();

    let gadgets = RepositoryRef::new("acme/gadgets", "https://example.com/acme/gadgets.git");
    let widgets = widgets();
    let (a, b) = tokio::join!(
        sync.sync(&widgets, "aaa", None, &cancel),
        sync.sync(&gadgets, "aaa", None, &cancel),
    );
    a.expect("can sync widgets");
    b.expect("can sync gadgets");

    assert_eq!(vcs.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn embedder_change_rebuilds_from_scratch() {
    let fixture = Fixture::new().await;
    let vcs = Arc::new(CountingVcs::at("aaa"));
    let cancel = CancelToken::never();

    let old = fixture.synchronizer(&vcs, "nomic-embed-text");
    let first = old.sync(&widgets(), "aaa", None, &cancel).await.expect("can sync");
    old.mark_indexed(&first.repository, "aaa")
        .await
        .expect("can record revision");
    fixture
        .database
        .upsert_file_records(first.repository.id, &[("src/lib.rs".to_string(), "h".to_string())])
        .await
        .expect("can record file");
    fixture
        .index
        .add_documents(
            &first.repository.collection_name,
            vec![IndexedDocument::code("src/lib.rs", "fn a() {}".to_string(), 1, 1)],
        )
        .await
        .expect("can add document");

    let new = fixture.synchronizer(&vcs, "mxbai-embed-large:latest");
    let second = new.sync(&widgets(), "aaa", None, &cancel).await.expect("can sync");

    assert!(second.is_initial_clone);
    assert_eq!(second.files_to_upsert, vec!["README.md", "src/lib.rs"]);
    assert_eq!(second.repository.collection_name, "repo-acme-widgets-mxbai-embed-large");
    assert_eq!(second.repository.embedder_model, "mxbai-embed-large:latest");
    assert_eq!(second.repository.last_indexed_sha, None);
    assert_eq!(
        fixture
            .index
            .count(&first.repository.collection_name)
            .await
            .expect("can count"),
        0
    );
    assert!(
        fixture
            .database
            .file_hashes(first.repository.id)
            .await
            .expect("can read hashes")
            .is_empty()
    );
    assert_eq!(vcs.clones.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn missing_clone_is_recloned() {
    let fixture = Fixture::new().await;
    let vcs = Arc::new(CountingVcs::at("aaa"));
    let sync = fixture.synchronizer(&vcs, "nomic-embed-text");
    let cancel = CancelToken::never();

    let first = sync.sync(&widgets(), "aaa", None, &cancel).await.expect("can sync");
    sync.mark_indexed(&first.repository, "aaa")
        .await
        .expect("can record revision");
    std::fs::remove_dir_all(&first.local_path).expect("can remove clone");

    let second = sync.sync(&widgets(), "aaa", None, &cancel).await.expect("can sync");
    assert!(second.is_initial_clone);
    assert_eq!(vcs.clones.load(Ordering::SeqCst), 2);
    assert_eq!(vcs.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_clone_cleans_up() {
    let fixture = Fixture::new().await;
    let vcs = Arc::new(CountingVcs {
        fail_clone: true,
        ..CountingVcs::at("aaa")
    });
    let sync = fixture.synchronizer(&vcs, "nomic-embed-text");

    let result = sync.sync(&widgets(), "aaa", None, &CancelToken::never()).await;

    assert!(matches!(result, Err(ReviewError::Vcs(_))));
    assert!(!fixture.repos_dir.join("acme/widgets").exists());
    assert!(
        fixture
            .database
            .get_repository("acme/widgets")
            .await
            .expect("can query")
            .is_none()
    );
}

#[tokio::test]
async fn traversal_names_are_rejected_before_any_git_work() {
    let fixture = Fixture::new().await;
    let vcs = Arc::new(CountingVcs::at("aaa"));
    let sync = fixture.synchronizer(&vcs, "nomic-embed-text");

    let result = sync
        .sync(
            &RepositoryRef::new("../escape", "https://example.com/x.git"),
            "aaa",
            None,
            &CancelToken::never(),
        )
        .await;

    assert!(matches!(result, Err(ReviewError::Config(_))));
    assert_eq!(vcs.clones.load(Ordering::SeqCst), 0);
}

#[test]
fn collection_names_are_deterministic() {
    assert_eq!(
        collection_name("Acme/Widgets", "nomic-embed-text:latest"),
        "repo-acme-widgets-nomic-embed-text"
    );
    assert_eq!(
        collection_name("acme/wid gets!", "bge.m3:v1"),
        "repo-acme-widgets-bgem3"
    );
    assert_eq!(
        collection_name("acme/widgets", "nomic-embed-text"),
        collection_name("acme/widgets", "nomic-embed-text:v1.5")
    );
    assert_eq!(collection_name(&"a".repeat(400), "m").len(), 255);
}

#[tokio::test]
async fn unchanged_head_needs_no_diff() {
    let fixture = Fixture::new().await;
    let vcs = Arc::new(CountingVcs::at("aaa"));
    let sync = fixture.synchronizer(&vcs, "nomic-embed-text");
    let cancel = CancelToken::never();

    let first = sync.sync(&widgets(), "aaa", None, &cancel).await.expect("can sync");
    sync.mark_indexed(&first.repository, "aaa")
        .await
        .expect("can record revision");

    let second = sync.sync(&widgets(), "aaa", None, &cancel).await.expect("can sync");
    assert!(!second.is_initial_clone);
    assert!(second.files_to_upsert.is_empty());
    assert!(second.files_to_delete.is_empty());
    assert!(vcs.diffs.lock().unwrap_or_else(PoisonError::into_inner).is_empty());
}

#[tokio::test]
async fn finished_syncs_release_their_locks() {
    let fixture = Fixture::new().await;
    let vcs = Arc::new(CountingVcs::at("aaa"));
    let sync = fixture.synchronizer(&vcs, "nomic-embed-text:latest");
    let tracked = || sync.locks.lock().unwrap_or_else(PoisonError::into_inner).len();

    for name in ["acme/widgets", "acme/gadgets", "acme/gizmos", "acme/widgets"] {
        let repo = RepositoryRef::new(name, format!("https://example.com/{name}.git"));
        sync.sync(&repo, "main", None, &CancelToken::never())
            .await
            .expect("can sync");
        assert_eq!(tracked(), 1, "only the last repository is still tracked");
    }

    // A held lock survives pruning by other repositories
    let held = sync.lock_for("acme/widgets");
    let _guard = held.lock().await;
    let gadgets = RepositoryRef::new("acme/gadgets", "https://example.com/acme/gadgets.git");
    sync.sync(&gadgets, "main", None, &CancelToken::never())
        .await
        .expect("can sync");
    assert_eq!(tracked(), 2);
}
