// Review artifacts
// Raw per-model reviews and failures kept on disk for auditing, readable by the owner only


use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::llm::cache::short_hash;

/// Longest file stem produced for a model name
const MAX_MODEL_STEM_CHARS: usize = 120;

const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// A file-name-safe, collision-resistant stem for a model name.
///
/// Characters outside `[A-Za-z0-9.-]` become `_`, runs of `_` collapse and are trimmed,
/// Windows device names get a `safe_` prefix, and 8 hex characters of the name's SHA-256
/// keep `model:v1` and `model/v1` apart.
#[inline]
pub fn sanitize_model_for_filename(model: &str) -> String {
    let mapped: String = model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut collapsed = String::with_capacity(mapped.len());
    for c in mapped.chars() {
        if !(c == '_' && collapsed.ends_with('_')) {
            collapsed.push(c);
        }
    }

    let mut stem = collapsed.trim_matches('_').to_string();
    if stem.is_empty() {
        stem = "model".to_string();
    }

    let base = match stem.rfind('.') {
        Some(dot) if dot > 0 => stem.get(..dot).unwrap_or(&stem),
        _ => stem.as_str(),
    };
    if WINDOWS_RESERVED
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(base))
    {
        stem = format!("safe_{stem}");
    }

    let digest = short_hash(model.as_bytes());
    let mut name = format!("{stem}_{}", digest.get(..8).unwrap_or(&digest));
    // Only ASCII remains, so byte truncation is safe
    name.truncate(MAX_MODEL_STEM_CHARS);
    name
}

/// Writes the artifacts of one consensus round, sharing a timestamp
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
    timestamp: String,
}

impl ArtifactWriter {
    #[inline]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timestamp: Utc::now().format("%Y%m%d_%H%M%S_%9f").to_string(),
        }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `review_{model}_{timestamp}.md`, headed with the model and date
    #[inline]
    pub async fn write_review(&self, model: &str, repository: &str, review: &str) -> Option<PathBuf> {
        let header = format!(
            "# Code Review by {model}\n\n**Date:** {}\n**Repository:** {repository}\n\n",
            Utc::now().to_rfc3339()
        );
        let name = format!(
            "review_{}_{}.md",
            sanitize_model_for_filename(model),
            self.timestamp
        );
        self.write(&name, &format!("{header}{review}")).await
    }

    /// `error_{model}_{timestamp}.txt`
    #[inline]
    pub async fn write_error(&self, model: &str, error: &str) -> Option<PathBuf> {
        let name = format!(
            "error_{}_{}.txt",
            sanitize_model_for_filename(model),
            self.timestamp
        );
        self.write(&name, error).await
    }

    /// `review_consensus_{timestamp}.md`
    #[inline]
    pub async fn write_consensus(&self, raw: &str) -> Option<PathBuf> {
        let name = format!("review_consensus_{}.md", self.timestamp);
        self.write(&name, raw).await
    }

    /// Artifacts never fail a review; problems are logged
    async fn write(&self, name: &str, content: &str) -> Option<PathBuf> {
        let path = self.dir.join(name);
        match write_private(&self.dir, &path, content).await {
            Ok(()) => {
                info!("Saved review artifact {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Failed to save review artifact {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(unix)]
async fn write_private(dir: &Path, path: &Path, content: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .await?;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await
}

#[cfg(not(unix))]
async fn write_private(dir: &Path, path: &Path, content: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, content).await
}
