
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Repository {
    pub id: i64,
    pub full_name: String,
    pub clone_url: String,
    pub local_path: String,
    pub collection_name: String,
    pub embedder_model: String,
    pub last_indexed_sha: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Repository {
    #[inline]
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.local_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRepository {
    pub full_name: String,
    pub clone_url: String,
    pub local_path: String,
    pub collection_name: String,
    pub embedder_model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RepositoryUpdate {
    pub clone_url: Option<String>,
    pub local_path: Option<String>,
    pub collection_name: Option<String>,
    pub embedder_model: Option<String>,
    /// `Some(None)` clears the indexed revision
    pub last_indexed_sha: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub repository_id: i64,
    pub file_path: String,
    pub file_hash: String,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for ScanStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ScanStatus::Pending => write!(f, "Pending"),
            ScanStatus::InProgress => write!(f, "In progress"),
            ScanStatus::Completed => write!(f, "Completed"),
            ScanStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Live counters while a scan walks the tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub files_total: u64,
    pub files_done: u64,
    pub current_file: Option<String>,
}

/// What a finished scan produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanArtifacts {
    pub indexed_files: u64,
    pub skipped_files: u64,
    pub deleted_files: u64,
    pub summaries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanState {
    pub repository_id: i64,
    pub status: ScanStatus,
    pub progress: Option<ScanProgress>,
    pub artifacts: Option<ScanArtifacts>,
    pub error_message: Option<String>,
    pub updated_at: NaiveDateTime,
}

impl ScanState {
    #[inline]
    pub fn is_in_progress(&self) -> bool {
        self.status == ScanStatus::InProgress
    }

    /// Share of files processed, 0.0 when nothing is known yet
    #[inline]
    pub fn progress_percentage(&self) -> f64 {
        match &self.progress {
            Some(progress) if progress.files_total > 0 => {
                (progress.files_done as f64 / progress.files_total as f64) * 100.0
            }
            _ => 0.0,
        }
    }
}
