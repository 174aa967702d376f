// Blocking JSON-over-HTTP transport shared by the model backends
// Requests run on the blocking pool and are raced against the caller's cancel token


use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

use crate::cancel::CancelToken;
use crate::{Result, ReviewError};

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HttpClient {
    base_url: Url,
    agent: ureq::Agent,
    api_key: Option<String>,
    retry_attempts: u32,
    backoff: Duration,
}

/// Why a single attempt failed
#[derive(Debug)]
enum Failure {
    Server(u16),
    Client(u16),
    Transport(String),
    Fatal(String),
}

impl HttpClient {
    #[inline]
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self {
            base_url,
            agent: build_agent(timeout),
            api_key: None,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Send `Authorization: Bearer <key>` with every request
    #[inline]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Delay before the first retry; each further retry doubles it
    #[inline]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[inline]
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    /// Resolve `path` below the base URL, keeping any path prefix the base carries.
    #[inline]
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
            .map_err(|e| ReviewError::Config(format!("Invalid endpoint {path}: {e}")))
    }

    #[inline]
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, cancel: &CancelToken) -> Result<T> {
        let text = self.send(path, None, cancel).await?;
        decode(&text)
    }

    #[inline]
    pub async fn post_json<B, T>(&self, path: &str, body: &B, cancel: &CancelToken) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let body = serde_json::to_string(body)
            .map_err(|e| ReviewError::Other(anyhow::anyhow!("Failed to serialize request: {e}")))?;
        let text = self.send(path, Some(body), cancel).await?;
        decode(&text)
    }

    async fn send(&self, path: &str, body: Option<String>, cancel: &CancelToken) -> Result<String> {
        let url = self.endpoint(path)?;
        let client = self.clone();

        cancel
            .run(async move {
                tokio::task::spawn_blocking(move || client.request_with_retry(&url, body.as_deref()))
                    .await
                    .map_err(|e| ReviewError::Other(anyhow::anyhow!("HTTP task failed: {e}")))?
            })
            .await
    }

    fn request_once(&self, url: &Url, body: Option<&str>) -> std::result::Result<String, ureq::Error> {
        let bearer = self.api_key.as_ref().map(|key| format!("Bearer {key}"));
        let response = match body {
            Some(body) => {
                let mut request = self
                    .agent
                    .post(url.as_str())
                    .header("Content-Type", "application/json");
                if let Some(bearer) = bearer {
                    request = request.header("Authorization", bearer);
                }
                request.send(body)
            }
            None => {
                let mut request = self.agent.get(url.as_str());
                if let Some(bearer) = bearer {
                    request = request.header("Authorization", bearer);
                }
                request.call()
            }
        };
        response.and_then(|mut response| response.body_mut().read_to_string())
    }

    fn request_with_retry(&self, url: &Url, body: Option<&str>) -> Result<String> {
        let mut last_failure = None;

        for attempt in 1..=self.retry_attempts {
            debug!("HTTP request attempt {}/{} to {}", attempt, self.retry_attempts, url);

            let failure = match self.request_once(url, body) {
                Ok(text) => {
                    debug!("Request succeeded on attempt {}", attempt);
                    return Ok(text);
                }
                Err(error) => classify(error),
            };

            match &failure {
                Failure::Server(status) => warn!(
                    "Server error (status {}), attempt {}/{}",
                    status, attempt, self.retry_attempts
                ),
                Failure::Transport(message) => warn!(
                    "Transport error: {}, attempt {}/{}",
                    message, attempt, self.retry_attempts
                ),
                Failure::Client(status) => warn!("Client error (status {}), not retrying", status),
                Failure::Fatal(message) => warn!("Non-retryable error: {}", message),
            }
            if matches!(failure, Failure::Client(_) | Failure::Fatal(_)) {
                return Err(into_error(failure));
            }
            last_failure = Some(failure);

            if attempt < self.retry_attempts {
                let delay = self.backoff * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1);
                debug!("Waiting {:?} before retry", delay);
                std::thread::sleep(delay);
            }
        }

        error!("All retry attempts failed for request to {}", url);
        Err(last_failure.map_or_else(
            || ReviewError::Unreachable(format!("Request to {url} failed after retries")),
            into_error,
        ))
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

fn classify(error: ureq::Error) -> Failure {
    match error {
        ureq::Error::StatusCode(status) if status >= 500 => Failure::Server(status),
        ureq::Error::StatusCode(status) => Failure::Client(status),
        ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound
        | ureq::Error::Timeout(_)
        | ureq::Error::Io(_) => Failure::Transport(error.to_string()),
        other => Failure::Fatal(other.to_string()),
    }
}

fn into_error(failure: Failure) -> ReviewError {
    match failure {
        Failure::Server(status) => ReviewError::Unreachable(format!("Server error: HTTP {status}")),
        Failure::Transport(message) => ReviewError::Unreachable(message),
        Failure::Client(status) => ReviewError::Other(anyhow::anyhow!("Client error: HTTP {status}")),
        Failure::Fatal(message) => ReviewError::Other(anyhow::anyhow!("Request error: {message}")),
    }
}

/// A body that arrived but does not match the expected shape
fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| {
        ReviewError::Unparseable(format!(
            "Failed to decode response ({e}): {}",
            crate::database::vector::truncate_chars(text, 200)
        ))
    })
}
