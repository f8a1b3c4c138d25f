use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    if current_version < 3 {
        debug!("Running migration v3");
        run_migration_v3(pool).await?;
        set_schema_version(pool, 3).await?;
    }

    if current_version < 4 {
        debug!("Running migration v4");
        run_migration_v4(pool).await?;
        set_schema_version(pool, 4).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("DELETE FROM _schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: creating threads and posts");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS threads (
            tid INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            author_name TEXT NOT NULL,
            author_uid INTEGER NOT NULL,
            total_posts INTEGER NOT NULL DEFAULT 0,
            total_pages INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create threads table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS posts (
            pid INTEGER PRIMARY KEY,
            tid INTEGER NOT NULL REFERENCES threads(tid) ON DELETE CASCADE,
            fid INTEGER NOT NULL DEFAULT 0,
            author_uid INTEGER NOT NULL,
            author_name TEXT NOT NULL,
            post_date TEXT NOT NULL,
            post_timestamp INTEGER NOT NULL,
            post_number INTEGER NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create posts table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_tid_number ON posts(tid, post_number)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_author_uid ON posts(author_uid)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_timestamp ON posts(post_timestamp)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_threads_author_uid ON threads(author_uid)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v2: adding subscriptions and monitoring events");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS monitored_threads (
            tid INTEGER PRIMARY KEY REFERENCES threads(tid) ON DELETE CASCADE,
            author_filter TEXT,
            author_notification TEXT,
            check_interval INTEGER NOT NULL DEFAULT 300,
            last_checked TEXT,
            last_post_timestamp INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create monitored_threads table")?;

    // No foreign key: errors are recorded for threads that were never stored.
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS monitoring_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tid INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            post_count INTEGER NOT NULL DEFAULT 0,
            message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create monitoring_events table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_monitored_active ON monitored_threads(is_active)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_monitoring_events_tid ON monitoring_events(tid)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn run_migration_v3(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v3: adding per-thread check schedules");

    sqlx::query("ALTER TABLE monitored_threads ADD COLUMN check_schedule TEXT")
        .execute(pool)
        .await
        .context("Failed to add check_schedule column")?;

    Ok(())
}

async fn run_migration_v4(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v4: tracking pages left unstored by a crawl");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS pending_pages (
            tid INTEGER NOT NULL REFERENCES threads(tid) ON DELETE CASCADE,
            page INTEGER NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (tid, page)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create pending_pages table")?;

    Ok(())
}
