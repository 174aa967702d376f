// Cancellation module
// Cooperative cancellation and deadlines threaded through every external call


use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::{Result, ReviewError};

/// Owner side of a cancellation signal. Dropping it does not cancel.
#[derive(Debug)]
pub struct CancelSource {
    sender: watch::Sender<bool>,
    parent: CancelToken,
}

/// Cheap, cloneable view of one or more cancellation signals plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    receivers: Vec<watch::Receiver<bool>>,
    deadline: Option<(Instant, Duration)>,
}

impl CancelSource {
    #[inline]
    pub fn new() -> Self {
        Self::child_of(&CancelToken::never())
    }

    /// A source whose tokens are also cancelled when `parent` is.
    #[inline]
    pub fn child_of(parent: &CancelToken) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender,
            parent: parent.clone(),
        }
    }

    #[inline]
    pub fn token(&self) -> CancelToken {
        let mut token = self.parent.clone();
        token.receivers.push(self.sender.subscribe());
        token
    }

    #[inline]
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl Default for CancelSource {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that is never cancelled and has no deadline.
    #[inline]
    pub fn never() -> Self {
        Self::default()
    }

    /// Derive a token whose deadline is the earlier of the current one and `timeout` from now.
    #[inline]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some((existing, budget)) if existing <= candidate => Some((existing, budget)),
            _ => Some((candidate, timeout)),
        };
        Self {
            receivers: self.receivers.clone(),
            deadline,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.receivers.iter().any(|rx| *rx.borrow())
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|(deadline, _)| Instant::now() >= deadline)
    }

    /// Time left before the deadline, if one is set.
    #[inline]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
    }

    /// Resolves once any attached signal fires. Never resolves for a token without signals.
    #[inline]
    pub async fn cancelled(&self) {
        if self.receivers.is_empty() {
            return std::future::pending().await;
        }

        let waits = self.receivers.iter().cloned().map(|mut rx| {
            Box::pin(async move {
                let closed = rx.wait_for(|flag| *flag).await.is_err();
                if closed {
                    // sender gone without cancelling
                    std::future::pending::<()>().await;
                }
            })
        });
        futures::future::select_all(waits).await;
    }

    /// Run `fut` until it completes, the token is cancelled, or the deadline passes.
    #[inline]
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        tokio::select! {
            biased;
            () = self.cancelled() => Err(ReviewError::Cancelled),
            res = Self::bounded(self.deadline, fut) => res,
        }
    }

    /// Fail fast when the token is already cancelled or expired.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ReviewError::Cancelled);
        }
        if let Some((_, budget)) = self.deadline.filter(|_| self.is_expired()) {
            return Err(ReviewError::Timeout(budget));
        }
        Ok(())
    }

    async fn bounded<T, F>(deadline: Option<(Instant, Duration)>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match deadline {
            Some((at, budget)) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| ReviewError::Timeout(budget))?,
            None => fut.await,
        }
    }
}
