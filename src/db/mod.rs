//! SQLite storage for threads, posts, subscriptions and monitoring events.

mod migrations;
mod models;
mod queries;

pub use models::*;
pub use queries::*;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

const MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// Missing parent directories are created.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for writing or a migration fails.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(connect_options(path))
            .await
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;

        let db = Self { pool };
        migrations::run(&db.pool).await?;
        db.ensure_writable(path).await?;
        info!(path = %path.display(), "Database ready");

        Ok(db)
    }

    /// Opening a write transaction fails early on a read-only data directory.
    async fn ensure_writable(&self, path: &Path) -> Result<()> {
        let tx = self.pool.begin().await.with_context(|| {
            format!("SQLite database is not writable (path: {})", path.display())
        })?;
        tx.commit()
            .await
            .context("Failed to commit SQLite writability check")?;
        Ok(())
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Wait for in-flight queries and close every connection, checkpointing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Database closed");
    }
}

fn connect_options(path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        // API reads overlap with page batch writes from the monitor.
        .busy_timeout(Duration::from_secs(10))
}
