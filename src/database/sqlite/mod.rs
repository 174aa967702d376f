use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::database::sqlite::models::{
    NewRepository, Repository, RepositoryUpdate, ScanArtifacts, ScanProgress, ScanState,
    ScanStatus,
};
use crate::database::sqlite::queries::{FileRecordQueries, RepositoryQueries, ScanStateQueries};


pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_url: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_url)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    #[inline]
    pub async fn initialize_from_config_dir(config_dir: &Path) -> Result<Self> {
        let db_path = config_dir.join("metadata.db");

        std::fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        Self::new(db_path).await
    }

    // Repository operations
    #[inline]
    pub async fn create_repository(&self, new_repo: NewRepository) -> Result<Repository> {
        RepositoryQueries::create(&self.pool, new_repo).await
    }

    #[inline]
    pub async fn get_repository(&self, full_name: &str) -> Result<Option<Repository>> {
        RepositoryQueries::get_by_full_name(&self.pool, full_name).await
    }

    #[inline]
    pub async fn get_repository_by_id(&self, id: i64) -> Result<Option<Repository>> {
        RepositoryQueries::get_by_id(&self.pool, id).await
    }

    #[inline]
    pub async fn list_repositories(&self) -> Result<Vec<Repository>> {
        RepositoryQueries::list_all(&self.pool).await
    }

    #[inline]
    pub async fn update_repository(
        &self,
        id: i64,
        update: RepositoryUpdate,
    ) -> Result<Option<Repository>> {
        RepositoryQueries::update(&self.pool, id, update).await
    }

    // File record operations
    #[inline]
    pub async fn file_hashes(&self, repository_id: i64) -> Result<HashMap<String, String>> {
        FileRecordQueries::hashes_for_repository(&self.pool, repository_id).await
    }

    #[inline]
    pub async fn upsert_file_records(
        &self,
        repository_id: i64,
        records: &[(String, String)],
    ) -> Result<()> {
        FileRecordQueries::upsert_many(&self.pool, repository_id, records).await
    }

    #[inline]
    pub async fn delete_file_records(&self, repository_id: i64, paths: &[String]) -> Result<u64> {
        FileRecordQueries::delete_paths(&self.pool, repository_id, paths).await
    }

    #[inline]
    pub async fn clear_file_records(&self, repository_id: i64) -> Result<u64> {
        FileRecordQueries::clear_for_repository(&self.pool, repository_id).await
    }

    // Scan state operations
    #[inline]
    pub async fn scan_state(&self, repository_id: i64) -> Result<Option<ScanState>> {
        ScanStateQueries::get(&self.pool, repository_id).await
    }

    #[inline]
    pub async fn set_scan_progress(
        &self,
        repository_id: i64,
        progress: &ScanProgress,
    ) -> Result<()> {
        ScanStateQueries::upsert(
            &self.pool,
            repository_id,
            ScanStatus::InProgress,
            Some(progress),
            None,
            None,
        )
        .await
    }

    #[inline]
    pub async fn complete_scan(&self, repository_id: i64, artifacts: &ScanArtifacts) -> Result<()> {
        ScanStateQueries::upsert(
            &self.pool,
            repository_id,
            ScanStatus::Completed,
            None,
            Some(artifacts),
            None,
        )
        .await
    }

    #[inline]
    pub async fn fail_scan(&self, repository_id: i64, error_message: &str) -> Result<()> {
        ScanStateQueries::upsert(
            &self.pool,
            repository_id,
            ScanStatus::Failed,
            None,
            None,
            Some(error_message),
        )
        .await
    }

    /// Optimize database performance by running VACUUM and ANALYZE
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        info!("Optimizing database performance");

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .context("Failed to vacuum database")?;

        sqlx::query("ANALYZE")
            .execute(&self.pool)
            .await
            .context("Failed to analyze database")?;

        debug!("Database optimization completed");
        Ok(())
    }
}
