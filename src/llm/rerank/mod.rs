// Precision reranking of recalled documents


use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::LanguageModel;
use super::prompts::{PromptKey, PromptManager, PromptValues};
use crate::cancel::CancelToken;
use crate::database::vector::{ScoredDocument, truncate_chars};
use crate::{Result, ReviewError};

/// Document text shown to the judging model is capped to keep prompts small
const MAX_RERANK_DOCUMENT_CHARS: usize = 1500;

const DEFAULT_MAX_CONCURRENT: usize = 5;

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Order `candidates` by relevance to `query`, most relevant first.
    async fn rerank(
        &self,
        query: &str,
        candidates: &[ScoredDocument],
        cancel: &CancelToken,
    ) -> Result<Vec<ScoredDocument>>;
}

/// Keeps the recall order
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReranker;

#[async_trait]
impl Reranker for NoopReranker {
    #[inline]
    async fn rerank(
        &self,
        _query: &str,
        candidates: &[ScoredDocument],
        _cancel: &CancelToken,
    ) -> Result<Vec<ScoredDocument>> {
        Ok(candidates.to_vec())
    }
}

/// Asks a small model to grade each candidate as `score|reason`.
///
/// Grading calls from every concurrent `rerank` share one gate, so the model never sees
/// more than `max_concurrent` requests at once.
pub struct LlmReranker {
    model: Arc<dyn LanguageModel>,
    prompts: Arc<PromptManager>,
    gate: Semaphore,
}

impl LlmReranker {
    #[inline]
    pub fn new(model: Arc<dyn LanguageModel>, prompts: Arc<PromptManager>) -> Self {
        Self {
            model,
            prompts,
            gate: Semaphore::new(DEFAULT_MAX_CONCURRENT),
        }
    }

    #[inline]
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.gate = Semaphore::new(max_concurrent.max(1));
        self
    }

    async fn grade(&self, query: &str, candidate: &ScoredDocument, cancel: &CancelToken) -> Result<ScoredDocument> {
        let _permit = cancel
            .run(async { self.gate.acquire().await.map_err(|_| ReviewError::Cancelled) })
            .await?;
        let values = PromptValues::from([
            ("query", query.to_string()),
            ("source", candidate.document.source.clone()),
            (
                "document",
                truncate_chars(&candidate.document.content, MAX_RERANK_DOCUMENT_CHARS),
            ),
        ]);
        let prompt = self
            .prompts
            .render(PromptKey::RerankPrecision, self.model.model_id(), &values)?;
        let answer = self.model.call(&prompt, cancel).await?;

        let mut graded = candidate.clone();
        match parse_grade(&answer) {
            Some((score, reason)) => {
                graded.score = score;
                graded.reason = reason;
            }
            None => {
                warn!(
                    "Unparseable rerank grade for {}: {:?}",
                    candidate.document.source,
                    truncate_chars(&answer, 80)
                );
                graded.score = 0.0;
                graded.reason = None;
            }
        }
        Ok(graded)
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    #[inline]
    async fn rerank(
        &self,
        query: &str,
        candidates: &[ScoredDocument],
        cancel: &CancelToken,
    ) -> Result<Vec<ScoredDocument>> {
        let grades = futures::future::join_all(
            candidates
                .iter()
                .map(|candidate| self.grade(query, candidate, cancel)),
        )
        .await;

        let mut graded = grades.into_iter().collect::<Result<Vec<_>>>()?;
        // Stable: equal grades keep recall order
        graded.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        debug!("Reranked {} candidates with {}", graded.len(), self.model.model_id());
        Ok(graded)
    }
}

/// Parse `score|reason`. The score may be wrapped in markup and is clamped to 0..=10.
fn parse_grade(answer: &str) -> Option<(f32, Option<String>)> {
    let line = answer.lines().map(str::trim).find(|line| !line.is_empty())?;
    let (score, reason) = match line.split_once('|') {
        Some((score, reason)) => (score, Some(reason.trim().to_string())),
        None => (line, None),
    };

    let score = score
        .trim_matches(|c: char| !c.is_ascii_digit() && c != '.')
        .parse::<f32>()
        .ok()
        .filter(|score| score.is_finite())?;

    Some((
        score.clamp(0.0, 10.0),
        reason.filter(|reason| !reason.is_empty()),
    ))
}
