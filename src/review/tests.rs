use super::*;
use std::time::Instant as StdInstant;
use tempfile::TempDir;

use crate::config::RetrievalConfig;
use crate::database::{MemoryVectorIndex, VectorIndex};
use crate::embeddings::Embedder;
use crate::llm::cache::SnippetCache;
use crate::llm::{NoopReranker, Reranker};
use crate::parser::Verdict;
use crate::testing::{self, FakeEmbedder, FakeModel};

const COLLECTION: &str = "repo-acme-widgets-fake";
const GENERATOR: &str = "generator";

const DIFF: &str = "diff --git a/src/lib.rs b/src/lib.rs\n\
--- a/src/lib.rs\n\
+++ b/src/lib.rs\n\
@@ -1 +1 @@\n\
-pub fn answer() -> u32 { 41 }\n\
+pub fn answer() -> u32 { 42 }\n";

const APPROVAL: &str = "# REVIEW SUMMARY\nThe change is small and correct.\n\n# VERDICT\nAPPROVE\n";

fn is_consensus(prompt: &str) -> bool {
    prompt.contains("chair of a code review committee")
}

fn request() -> ReviewRequest {
    ReviewRequest {
        title: "Fix the answer".to_string(),
        description: "The answer was off by one.".to_string(),
        language: "Rust".to_string(),
        diff: DIFF.to_string(),
        changed_files: vec![ChangedFile::new("src/lib.rs", DIFF)],
    }
}

fn models(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_string()).collect()
}

fn failing(id: &str) -> FakeModel {
    FakeModel::new(id, |_| {
        Err(ReviewError::Unreachable("connection refused".to_string()))
    })
}

struct Fixture {
    root: TempDir,
    repository: Repository,
    index: Arc<MemoryVectorIndex>,
    embedder: Arc<FakeEmbedder>,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().expect("can create temp dir");
        let repository = testing::repository(root.path(), COLLECTION);
        Self {
            root,
            repository,
            index: Arc::new(MemoryVectorIndex::new()),
            embedder: Arc::new(FakeEmbedder::new("fake", 64)),
        }
    }

    fn orchestrator(&self, models: &[Arc<FakeModel>], settings: ReviewConfig) -> ReviewOrchestrator {
        let retrieval = RetrievalConfig {
            enable_hyde: false,
            enable_description_search: false,
            ..RetrievalConfig::default()
        };
        let retriever = Arc::new(Retriever::new(
            Arc::clone(&self.index) as Arc<dyn VectorIndex>,
            Arc::clone(&self.embedder) as Arc<dyn Embedder>,
            Arc::new(NoopReranker) as Arc<dyn Reranker>,
            retrieval,
        ));
        let prompts = Arc::new(PromptManager::new().expect("built-in prompts load"));
        let context = ContextAssembler::new(
            Arc::clone(&retriever),
            Arc::new(failing("fast")) as Arc<dyn LanguageModel>,
            Arc::clone(&prompts),
            Arc::new(SnippetCache::new()),
        );
        let catalog = ModelCatalog::fixed(
            models
                .iter()
                .map(|model| Arc::clone(model) as Arc<dyn LanguageModel>)
                .collect(),
        );

        ReviewOrchestrator::new(
            Arc::new(context),
            retriever,
            Arc::new(catalog),
            prompts,
            GENERATOR,
            settings,
        )
    }
}

fn fast_rounds() -> ReviewConfig {
    ReviewConfig {
        model_timeout_secs: 30,
        straggler_window_secs: 1,
        ..ReviewConfig::default()
    }
}

#[tokio::test]
async fn empty_diff_needs_no_model() {
    let fixture = Fixture::new();
    let generator = Arc::new(failing(GENERATOR));
    let orchestrator = fixture.orchestrator(&[Arc::clone(&generator)], ReviewConfig::default());

    let blank = ReviewRequest {
        diff: " \n".to_string(),
        ..request()
    };
    let review = orchestrator
        .generate_review(&fixture.repository, &RepoConfig::default(), &blank, &CancelToken::never())
        .await
        .expect("can review");

    assert_eq!(review.summary, NO_CHANGES_SUMMARY);
    assert_eq!(review.verdict, Verdict::Comment);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn review_prompt_carries_the_change() {
    let fixture = Fixture::new();
    let generator = Arc::new(FakeModel::replying(GENERATOR, APPROVAL));
    let orchestrator = fixture.orchestrator(&[Arc::clone(&generator)], ReviewConfig::default());
    let repo_config = RepoConfig {
        custom_instructions: vec!["Prefer explicit error types.".to_string()],
        ..RepoConfig::default()
    };

    let review = orchestrator
        .generate_review(&fixture.repository, &repo_config, &request(), &CancelToken::never())
        .await
        .expect("can review");

    assert_eq!(review.verdict, Verdict::Approve);
    assert_eq!(review.summary, "The change is small and correct.");

    let prompts = generator.prompts();
    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert!(prompt.contains("senior Rust engineer"));
    assert!(prompt.contains("Fix the answer"));
    assert!(prompt.contains("- `src/lib.rs`\n"));
    assert!(prompt.contains("+pub fn answer() -> u32 { 42 }"));
    assert!(prompt.contains("Prefer explicit error types."));
}

#[tokio::test]
async fn unparseable_review_keeps_the_raw_text() {
    let fixture = Fixture::new();
    let generator = Arc::new(FakeModel::replying(GENERATOR, "  Looks fine to me, ship it.  "));
    let orchestrator = fixture.orchestrator(&[generator], ReviewConfig::default());

    let review = orchestrator
        .generate_review(&fixture.repository, &RepoConfig::default(), &request(), &CancelToken::never())
        .await
        .expect("degrades instead of failing");

    assert_eq!(review.summary, "Looks fine to me, ship it.");
    assert_eq!(review.verdict, Verdict::Comment);
    assert!(review.suggestions.is_empty());
}

#[tokio::test]
async fn generator_failure_is_propagated() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator(&[Arc::new(failing(GENERATOR))], ReviewConfig::default());

    let error = orchestrator
        .generate_review(&fixture.repository, &RepoConfig::default(), &request(), &CancelToken::never())
        .await
        .expect_err("unreachable generator fails the review");
    assert!(error.is_unreachable());
}

#[tokio::test]
async fn consensus_excludes_the_generator_and_credits_contributors() {
    let fixture = Fixture::new();
    let generator = Arc::new(FakeModel::new(GENERATOR, |prompt| {
        if is_consensus(prompt) {
            Ok("# REVIEW SUMMARY\nBoth reviewers agree.\n\n# VERDICT\nREQUEST_CHANGES\n".to_string())
        } else {
            Err(ReviewError::Unparseable("generator asked to review".to_string()))
        }
    }));
    let alpha = Arc::new(FakeModel::replying("alpha", "Alpha found an off-by-one."));
    let beta = Arc::new(FakeModel::replying("beta", "Beta agrees."));
    let orchestrator = fixture.orchestrator(
        &[Arc::clone(&generator), Arc::clone(&alpha), Arc::clone(&beta)],
        fast_rounds(),
    );

    let review = orchestrator
        .generate_consensus_review(
            &fixture.repository,
            &RepoConfig::default(),
            &request(),
            &models(&["beta", GENERATOR, "alpha"]),
            &CancelToken::never(),
        )
        .await
        .expect("can reach consensus");

    assert_eq!(review.verdict, Verdict::RequestChanges);
    assert!(review.summary.starts_with("Both reviewers agree."));
    assert!(review.summary.ends_with(
        "\n\n> 🤖 **AI Consensus Review**\n> Generated by synthesizing findings from: alpha, beta. \n> *Mistakes are possible. Please verify critical issues.*"
    ));

    assert_eq!(generator.calls(), 1);
    assert_eq!(alpha.calls(), 1);
    assert_eq!(beta.calls(), 1);

    let synthesis = &generator.prompts()[0];
    let alpha_at = synthesis
        .find("\n--- Review from alpha ---\nAlpha found an off-by-one.\n")
        .expect("alpha's review is included");
    let beta_at = synthesis
        .find("\n--- Review from beta ---\nBeta agrees.\n")
        .expect("beta's review is included");
    assert!(alpha_at < beta_at);
    assert!(synthesis.contains("- `src/lib.rs`\n"));
}

#[tokio::test]
async fn consensus_needs_two_members_besides_the_generator() {
    let fixture = Fixture::new();
    let generator = Arc::new(FakeModel::replying(GENERATOR, APPROVAL));
    let alpha = Arc::new(FakeModel::replying("alpha", "ok"));
    let orchestrator = fixture.orchestrator(&[Arc::clone(&generator), Arc::clone(&alpha)], fast_rounds());

    for requested in [models(&[GENERATOR, "alpha"]), models(&["alpha"]), Vec::new()] {
        let error = orchestrator
            .generate_consensus_review(
                &fixture.repository,
                &RepoConfig::default(),
                &request(),
                &requested,
                &CancelToken::never(),
            )
            .await
            .expect_err("committee too small");
        assert!(matches!(error, ReviewError::Config(_)), "{error:?}");
    }
    assert_eq!(generator.calls() + alpha.calls(), 0);
}

#[tokio::test]
async fn invalid_model_lists_are_rejected() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator(&[], fast_rounds());

    let too_many: Vec<String> = (0..11).map(|i| format!("model-{i}")).collect();
    for requested in [models(&["alpha", "alpha", "beta"]), models(&["alpha", " "]), too_many] {
        let error = orchestrator
            .generate_comparison_reviews(
                &fixture.repository,
                &RepoConfig::default(),
                &request(),
                &requested,
                &CancelToken::never(),
            )
            .await
            .expect_err("invalid list");
        assert!(matches!(error, ReviewError::Config(_)), "{error:?}");
    }
}

#[tokio::test]
async fn failed_members_are_skipped_and_recorded() {
    let fixture = Fixture::new();
    let artifacts = fixture.root.path().join("reviews");
    let settings = ReviewConfig {
        artifacts_dir: Some(artifacts.clone()),
        ..fast_rounds()
    };
    let generator = Arc::new(FakeModel::replying(GENERATOR, APPROVAL));
    let orchestrator = fixture.orchestrator(
        &[
            Arc::clone(&generator),
            Arc::new(failing("alpha")),
            Arc::new(FakeModel::replying("beta", "Beta: fine.")),
            Arc::new(FakeModel::replying("gamma", "   ")),
            Arc::new(FakeModel::replying("delta", "Delta: fine too.")),
        ],
        settings,
    );

    let review = orchestrator
        .generate_consensus_review(
            &fixture.repository,
            &RepoConfig::default(),
            &request(),
            &models(&["alpha", "beta", "gamma", "delta"]),
            &CancelToken::never(),
        )
        .await
        .expect("two usable reviews are enough");

    assert!(review.summary.contains("synthesizing findings from: beta, delta."));
    let synthesis = &generator.prompts()[0];
    assert!(!synthesis.contains("Review from alpha"));
    assert!(!synthesis.contains("Review from gamma"));

    let mut names: Vec<String> = std::fs::read_dir(&artifacts)
        .expect("artifacts directory exists")
        .map(|entry| {
            entry
                .expect("can read entry")
                .file_name()
                .to_string_lossy()
                .to_string()
        })
        .collect();
    names.sort();
    assert_eq!(names.len(), 4, "{names:?}");
    assert!(names[0].starts_with("error_alpha_"));
    assert!(names[1].starts_with("review_beta_"));
    assert!(names[2].starts_with("review_consensus_"));
    assert!(names[3].starts_with("review_delta_"));
}

#[tokio::test]
async fn no_usable_reviews_is_no_consensus() {
    let fixture = Fixture::new();
    let generator = Arc::new(FakeModel::replying(GENERATOR, APPROVAL));
    let orchestrator = fixture.orchestrator(
        &[Arc::clone(&generator), Arc::new(failing("alpha")), Arc::new(failing("beta"))],
        fast_rounds(),
    );

    let error = orchestrator
        .generate_consensus_review(
            &fixture.repository,
            &RepoConfig::default(),
            &request(),
            &models(&["alpha", "beta"]),
            &CancelToken::never(),
        )
        .await
        .expect_err("nothing to synthesize");

    assert!(matches!(error, ReviewError::NoConsensus(_)), "{error:?}");
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn consensus_on_an_empty_diff_calls_nobody() {
    let fixture = Fixture::new();
    let alpha = Arc::new(FakeModel::replying("alpha", "ok"));
    let beta = Arc::new(FakeModel::replying("beta", "ok"));
    let orchestrator = fixture.orchestrator(&[Arc::clone(&alpha), Arc::clone(&beta)], fast_rounds());

    let blank = ReviewRequest {
        diff: String::new(),
        ..request()
    };
    let review = orchestrator
        .generate_consensus_review(
            &fixture.repository,
            &RepoConfig::default(),
            &blank,
            &models(&["alpha", "beta"]),
            &CancelToken::never(),
        )
        .await
        .expect("can review");

    assert_eq!(review.summary, NO_CHANGES_SUMMARY);
    assert_eq!(alpha.calls() + beta.calls(), 0);
}

#[tokio::test]
async fn stragglers_are_cut_off_after_quorum() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator(
        &[
            Arc::new(FakeModel::replying("alpha", "a")),
            Arc::new(FakeModel::replying("beta", "b")),
            Arc::new(FakeModel::replying("slow", "late").with_delay(Duration::from_secs(60))),
        ],
        fast_rounds(),
    );

    let started = StdInstant::now();
    let results = orchestrator
        .generate_comparison_reviews(
            &fixture.repository,
            &RepoConfig::default(),
            &request(),
            &models(&["alpha", "beta", "slow"]),
            &CancelToken::never(),
        )
        .await
        .expect("can fan out");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(results.len(), 3);
    let slow = results
        .iter()
        .find(|result| result.model == "slow")
        .expect("straggler is reported");
    assert!(!slow.is_usable());
    assert!(slow.error.as_deref().is_some_and(|e| e.contains("did not respond")));
    assert_eq!(results.iter().filter(|result| result.is_usable()).count(), 2);
}

#[tokio::test]
async fn failures_count_toward_quorum() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator(
        &[
            Arc::new(failing("alpha")),
            Arc::new(FakeModel::replying("beta", "b")),
            Arc::new(FakeModel::replying("slow", "late").with_delay(Duration::from_secs(60))),
        ],
        fast_rounds(),
    );

    let started = StdInstant::now();
    let results = orchestrator
        .generate_comparison_reviews(
            &fixture.repository,
            &RepoConfig::default(),
            &request(),
            &models(&["alpha", "beta", "slow"]),
            &CancelToken::never(),
        )
        .await
        .expect("can fan out");

    assert!(started.elapsed() < Duration::from_secs(10));
    let alpha = results
        .iter()
        .find(|result| result.model == "alpha")
        .expect("failure is reported");
    assert!(alpha.error.as_deref().is_some_and(|e| e.contains("connection refused")));
}

#[tokio::test]
async fn slow_models_time_out() {
    let fixture = Fixture::new();
    let settings = ReviewConfig {
        model_timeout_secs: 1,
        straggler_window_secs: 60,
        ..ReviewConfig::default()
    };
    let orchestrator = fixture.orchestrator(
        &[
            Arc::new(FakeModel::replying("alpha", "a")),
            Arc::new(FakeModel::replying("slow", "late").with_delay(Duration::from_secs(60))),
        ],
        settings,
    );

    let started = StdInstant::now();
    let results = orchestrator
        .generate_comparison_reviews(
            &fixture.repository,
            &RepoConfig::default(),
            &request(),
            &models(&["alpha", "slow"]),
            &CancelToken::never(),
        )
        .await
        .expect("can fan out");

    assert!(started.elapsed() < Duration::from_secs(10));
    let slow = results
        .iter()
        .find(|result| result.model == "slow")
        .expect("timeout is reported");
    assert!(slow.error.as_deref().is_some_and(|e| e.contains("timed out")));
}

#[tokio::test]
async fn cancellation_ends_the_round() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator(
        &[
            Arc::new(FakeModel::replying("alpha", "a").with_delay(Duration::from_secs(60))),
            Arc::new(FakeModel::replying("beta", "b").with_delay(Duration::from_secs(60))),
        ],
        fast_rounds(),
    );

    let source = CancelSource::new();
    let token = source.token();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        source.cancel();
    });

    let results = orchestrator
        .generate_comparison_reviews(
            &fixture.repository,
            &RepoConfig::default(),
            &request(),
            &models(&["alpha", "beta"]),
            &token,
        )
        .await
        .expect("partial results are returned");
    canceller.await.expect("canceller finishes");

    assert_eq!(results.len(), 2);
    assert!(
        results
            .iter()
            .all(|result| result.error.as_deref() == Some("cancelled before responding"))
    );
}

#[tokio::test]
async fn rereview_compares_against_the_original() {
    let fixture = Fixture::new();
    let generator = Arc::new(FakeModel::replying(GENERATOR, APPROVAL));
    let orchestrator = fixture.orchestrator(&[Arc::clone(&generator)], ReviewConfig::default());

    let blank = orchestrator
        .generate_rereview("Original findings.", "\n", "Rust", &CancelToken::never())
        .await
        .expect("can re-review");
    assert_eq!(blank.summary, NO_NEW_CHANGES_SUMMARY);
    assert_eq!(generator.calls(), 0);

    let review = orchestrator
        .generate_rereview("Original findings.", DIFF, "Rust", &CancelToken::never())
        .await
        .expect("can re-review");
    assert_eq!(review.verdict, Verdict::Approve);

    let prompt = &generator.prompts()[0];
    assert!(prompt.contains("reviewed a Rust pull request"));
    assert!(prompt.contains("Original findings."));
    assert!(prompt.contains("+pub fn answer() -> u32 { 42 }"));
}

#[tokio::test]
async fn questions_are_answered_from_distinct_declarations() {
    let fixture = Fixture::new();
    let parent = "impl Ledger {\n    fn post(&self) {}\n    fn void(&self) {}\n}";
    let mut post = IndexedDocument::code("src/ledger.rs", "fn post ledger entry".to_string(), 2, 2)
        .with_parent("ledger-impl".to_string(), parent);
    post.package_name = Some("crate::ledger".to_string());
    let void = IndexedDocument::code("src/ledger.rs", "fn void ledger entry".to_string(), 3, 3)
        .with_parent("ledger-impl".to_string(), parent);
    let mut standalone =
        IndexedDocument::code("src/report.rs", "fn print ledger report".to_string(), 1, 3);
    standalone.identifier = Some("print_report".to_string());
    testing::seed(
        fixture.index.as_ref(),
        &fixture.embedder,
        COLLECTION,
        vec![post, void, standalone],
    )
    .await;

    let generator = Arc::new(FakeModel::replying(GENERATOR, "The ledger posts entries."));
    let orchestrator = fixture.orchestrator(&[Arc::clone(&generator)], ReviewConfig::default());

    let answer = orchestrator
        .answer_question(
            &fixture.repository,
            "How does the ledger post an entry?",
            &["user: hi".to_string(), "assistant: hello".to_string()],
            &CancelToken::never(),
        )
        .await
        .expect("can answer");
    assert_eq!(answer, "The ledger posts entries.");

    let prompt = &generator.prompts()[0];
    assert_eq!(prompt.matches("impl Ledger {").count(), 1, "{prompt}");
    assert!(prompt.contains("user: hi\nassistant: hello"));
    assert!(prompt.contains("How does the ledger post an entry?"));
    assert!(prompt.contains("File: src/report.rs\nIdentifier: print_report\n\nfn print ledger report\n---\n\n"));
    assert!(!prompt.contains("Identifier: ledger"));
}

#[tokio::test]
async fn questions_draw_only_on_code() {
    let fixture = Fixture::new();
    let question = "How does the ledger post an entry?";
    testing::seed(
        fixture.index.as_ref(),
        &fixture.embedder,
        COLLECTION,
        vec![
            IndexedDocument::arch("src", question.to_string(), "hash".to_string(), 2),
            IndexedDocument::code("src/ledger.rs", "fn post ledger entry".to_string(), 2, 2),
        ],
    )
    .await;

    let generator = Arc::new(FakeModel::replying(GENERATOR, "It appends a row."));
    let orchestrator = fixture.orchestrator(&[Arc::clone(&generator)], ReviewConfig::default());
    orchestrator
        .answer_question(&fixture.repository, question, &[], &CancelToken::never())
        .await
        .expect("can answer");

    let prompt = &generator.prompts()[0];
    assert!(prompt.contains("File: src/ledger.rs"), "{prompt}");
    assert!(!prompt.contains("File: src\n"), "{prompt}");
    assert_eq!(prompt.matches(question).count(), 1, "only the question itself: {prompt}");
}

#[test]
fn question_context_layout() {
    let mut document = IndexedDocument::code("src/a.rs", "fn a() {}".to_string(), 1, 1);
    document.package_name = Some("crate::a".to_string());
    document.identifier = Some("a".to_string());
    let duplicate = document.clone();

    let context = format_question_context([&document, &duplicate].into_iter());
    assert_eq!(
        context,
        "---\nFile: src/a.rs\nPackage: crate::a\nIdentifier: a\n\nfn a() {}\n---\n\n"
    );
}

#[test]
fn changed_files_are_listed() {
    let files = vec![ChangedFile::new("a.rs", ""), ChangedFile::new("dir/b.go", "")];
    assert_eq!(format_changed_files(&files), "- `a.rs`\n- `dir/b.go`\n");
    assert_eq!(format_changed_files(&[]), "");
}
