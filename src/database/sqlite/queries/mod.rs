
use super::models::*;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

const REPOSITORY_COLUMNS: &str = "id, full_name, clone_url, local_path, collection_name, \
     embedder_model, last_indexed_sha, created_at, updated_at";

pub struct RepositoryQueries;

impl RepositoryQueries {
    #[inline]
    pub async fn create(pool: &SqlitePool, new_repo: NewRepository) -> Result<Repository> {
        let now = Utc::now().naive_utc();
        let id = sqlx::query(
            "INSERT INTO repositories (full_name, clone_url, local_path, collection_name, embedder_model, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new_repo.full_name)
        .bind(&new_repo.clone_url)
        .bind(&new_repo.local_path)
        .bind(&new_repo.collection_name)
        .bind(&new_repo.embedder_model)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to create repository {}", new_repo.full_name))?
        .last_insert_rowid();

        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created repository"))
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Repository>> {
        let result = sqlx::query_as::<_, Repository>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get repository by id")?;

        Ok(result)
    }

    #[inline]
    pub async fn get_by_full_name(pool: &SqlitePool, full_name: &str) -> Result<Option<Repository>> {
        let result = sqlx::query_as::<_, Repository>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE full_name = ?"
        ))
        .bind(full_name)
        .fetch_optional(pool)
        .await
        .context("Failed to get repository by full name")?;

        Ok(result)
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Repository>> {
        let results = sqlx::query_as::<_, Repository>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories ORDER BY full_name"
        ))
        .fetch_all(pool)
        .await
        .context("Failed to list repositories")?;

        Ok(results)
    }

    #[inline]
    pub async fn update(
        pool: &SqlitePool,
        id: i64,
        update: RepositoryUpdate,
    ) -> Result<Option<Repository>> {
        let Some(current) = Self::get_by_id(pool, id).await? else {
            return Ok(None);
        };

        let clone_url = update.clone_url.unwrap_or(current.clone_url);
        let local_path = update.local_path.unwrap_or(current.local_path);
        let collection_name = update.collection_name.unwrap_or(current.collection_name);
        let embedder_model = update.embedder_model.unwrap_or(current.embedder_model);
        let last_indexed_sha = update.last_indexed_sha.unwrap_or(current.last_indexed_sha);
        let now = Utc::now().naive_utc();

        sqlx::query(
            "UPDATE repositories SET clone_url = ?, local_path = ?, collection_name = ?, \
             embedder_model = ?, last_indexed_sha = ?, updated_at = ? WHERE id = ?",
        )
        .bind(clone_url)
        .bind(local_path)
        .bind(collection_name)
        .bind(embedder_model)
        .bind(last_indexed_sha)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to update repository")?;

        Self::get_by_id(pool, id).await
    }

    #[inline]
    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM repositories WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to delete repository")?;

        Ok(result.rows_affected() > 0)
    }
}

pub struct FileRecordQueries;

impl FileRecordQueries {
    /// All stored hashes for a repository keyed by relative path
    #[inline]
    pub async fn hashes_for_repository(
        pool: &SqlitePool,
        repository_id: i64,
    ) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT file_path, file_hash FROM file_records WHERE repository_id = ?")
            .bind(repository_id)
            .fetch_all(pool)
            .await
            .context("Failed to load file records")?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("file_path"), row.get::<String, _>("file_hash")))
            .collect())
    }

    #[inline]
    pub async fn get(
        pool: &SqlitePool,
        repository_id: i64,
        file_path: &str,
    ) -> Result<Option<FileRecord>> {
        let result = sqlx::query_as::<_, FileRecord>(
            "SELECT id, repository_id, file_path, file_hash, updated_at FROM file_records \
             WHERE repository_id = ? AND file_path = ?",
        )
        .bind(repository_id)
        .bind(file_path)
        .fetch_optional(pool)
        .await
        .context("Failed to get file record")?;

        Ok(result)
    }

    /// Insert or refresh hashes in one transaction
    #[inline]
    pub async fn upsert_many(
        pool: &SqlitePool,
        repository_id: i64,
        records: &[(String, String)],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let now = Utc::now().naive_utc();
        let mut tx = pool.begin().await.context("Failed to begin transaction")?;
        for (file_path, file_hash) in records {
            sqlx::query(
                "INSERT INTO file_records (repository_id, file_path, file_hash, updated_at) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT (repository_id, file_path) DO UPDATE SET \
                 file_hash = excluded.file_hash, updated_at = excluded.updated_at",
            )
            .bind(repository_id)
            .bind(file_path)
            .bind(file_hash)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to upsert file record for {}", file_path))?;
        }
        tx.commit().await.context("Failed to commit file records")?;

        debug!(
            "Upserted {} file records for repository {}",
            records.len(),
            repository_id
        );
        Ok(())
    }

    #[inline]
    pub async fn delete_paths(
        pool: &SqlitePool,
        repository_id: i64,
        paths: &[String],
    ) -> Result<u64> {
        if paths.is_empty() {
            return Ok(0);
        }

        let mut deleted = 0;
        let mut tx = pool.begin().await.context("Failed to begin transaction")?;
        for path in paths {
            deleted += sqlx::query("DELETE FROM file_records WHERE repository_id = ? AND file_path = ?")
                .bind(repository_id)
                .bind(path)
                .execute(&mut *tx)
                .await
                .context("Failed to delete file record")?
                .rows_affected();
        }
        tx.commit().await.context("Failed to commit file record deletion")?;

        Ok(deleted)
    }

    #[inline]
    pub async fn clear_for_repository(pool: &SqlitePool, repository_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM file_records WHERE repository_id = ?")
            .bind(repository_id)
            .execute(pool)
            .await
            .context("Failed to clear file records")?;

        Ok(result.rows_affected())
    }
}

pub struct ScanStateQueries;

impl ScanStateQueries {
    #[inline]
    pub async fn get(pool: &SqlitePool, repository_id: i64) -> Result<Option<ScanState>> {
        let row = sqlx::query(
            "SELECT repository_id, status, progress, artifacts, error_message, updated_at \
             FROM scan_states WHERE repository_id = ?",
        )
        .bind(repository_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get scan state")?;

        row.map(|row| scan_state_from_row(&row)).transpose()
    }

    /// Write the current status; `None` fields keep their stored value
    #[inline]
    pub async fn upsert(
        pool: &SqlitePool,
        repository_id: i64,
        status: ScanStatus,
        progress: Option<&ScanProgress>,
        artifacts: Option<&ScanArtifacts>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let progress = progress
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode scan progress")?;
        let artifacts = artifacts
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode scan artifacts")?;
        let now = Utc::now().naive_utc();

        sqlx::query(
            "INSERT INTO scan_states (repository_id, status, progress, artifacts, error_message, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (repository_id) DO UPDATE SET \
             status = excluded.status, \
             progress = COALESCE(excluded.progress, scan_states.progress), \
             artifacts = COALESCE(excluded.artifacts, scan_states.artifacts), \
             error_message = excluded.error_message, \
             updated_at = excluded.updated_at",
        )
        .bind(repository_id)
        .bind(status)
        .bind(progress)
        .bind(artifacts)
        .bind(error_message)
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to write scan state")?;

        Ok(())
    }
}

fn scan_state_from_row(row: &SqliteRow) -> Result<ScanState> {
    let progress = row
        .get::<Option<String>, _>("progress")
        .map(|json| serde_json::from_str::<ScanProgress>(&json))
        .transpose()
        .context("Failed to decode scan progress")?;
    let artifacts = row
        .get::<Option<String>, _>("artifacts")
        .map(|json| serde_json::from_str::<ScanArtifacts>(&json))
        .transpose()
        .context("Failed to decode scan artifacts")?;

    Ok(ScanState {
        repository_id: row.get("repository_id"),
        status: row.get("status"),
        progress,
        artifacts,
        error_message: row.get("error_message"),
        updated_at: row.get("updated_at"),
    })
}
