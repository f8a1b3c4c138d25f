use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{
    encode_uid_list, format_db_time, EventKind, MonitoredThread, MonitoringEvent, NewPost,
    NewThread, Post, Subscription, SubscriptionSettings, Thread,
};

// ========== Threads ==========

/// Insert or refresh a thread's metadata.
pub async fn save_thread(pool: &SqlitePool, thread: &NewThread) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO threads (tid, title, author_name, author_uid, total_posts, total_pages)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(tid) DO UPDATE SET
            title = excluded.title,
            author_name = excluded.author_name,
            author_uid = excluded.author_uid,
            total_posts = excluded.total_posts,
            total_pages = excluded.total_pages,
            updated_at = datetime('now')
        ",
    )
    .bind(thread.tid)
    .bind(&thread.title)
    .bind(&thread.author_name)
    .bind(thread.author_uid)
    .bind(thread.total_posts)
    .bind(thread.total_pages)
    .execute(pool)
    .await
    .context("Failed to save thread")?;

    Ok(())
}

/// Get a thread by tid.
pub async fn get_thread(pool: &SqlitePool, tid: i64) -> Result<Option<Thread>> {
    sqlx::query_as("SELECT * FROM threads WHERE tid = ?")
        .bind(tid)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch thread")
}

// ========== Posts ==========

/// Upsert a batch of posts in one transaction, keyed by pid.
///
/// Returns the number of rows written.
pub async fn save_posts_batch(pool: &SqlitePool, posts: &[NewPost]) -> Result<u64> {
    if posts.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    let mut written = 0;

    for post in posts {
        let result = sqlx::query(
            r"
            INSERT INTO posts (pid, tid, fid, author_uid, author_name, post_date,
                               post_timestamp, post_number, content)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pid) DO UPDATE SET
                author_name = excluded.author_name,
                post_date = excluded.post_date,
                post_timestamp = excluded.post_timestamp,
                post_number = excluded.post_number,
                content = excluded.content
            ",
        )
        .bind(post.pid)
        .bind(post.tid)
        .bind(post.fid)
        .bind(post.author_uid)
        .bind(&post.author_name)
        .bind(&post.post_date)
        .bind(post.post_timestamp)
        .bind(post.post_number)
        .bind(&post.content)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to save post {}", post.pid))?;

        written += result.rows_affected();
    }

    tx.commit().await.context("Failed to commit post batch")?;
    Ok(written)
}

/// Highest stored post number for a thread.
pub async fn get_max_post_number(pool: &SqlitePool, tid: i64) -> Result<Option<i64>> {
    let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(post_number) FROM posts WHERE tid = ?")
        .bind(tid)
        .fetch_one(pool)
        .await
        .context("Failed to get max post number")?;
    Ok(row.0)
}

pub async fn count_posts_for_thread(pool: &SqlitePool, tid: i64) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE tid = ?")
        .bind(tid)
        .fetch_one(pool)
        .await
        .context("Failed to count posts")?;
    Ok(row.0)
}

pub async fn post_exists(pool: &SqlitePool, pid: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM posts WHERE pid = ?")
        .bind(pid)
        .fetch_optional(pool)
        .await
        .context("Failed to check post existence")?;
    Ok(row.is_some())
}

/// Newest post timestamp stored for a thread, 0 when empty.
pub async fn get_max_post_timestamp(pool: &SqlitePool, tid: i64) -> Result<i64> {
    let row: (Option<i64>,) =
        sqlx::query_as("SELECT MAX(post_timestamp) FROM posts WHERE tid = ?")
            .bind(tid)
            .fetch_one(pool)
            .await
            .context("Failed to get max post timestamp")?;
    Ok(row.0.unwrap_or(0))
}

/// Posts after `start_post_number` (exclusive), oldest first.
pub async fn get_posts_after(
    pool: &SqlitePool,
    tid: i64,
    start_post_number: Option<i64>,
    author_uid: Option<i64>,
) -> Result<Vec<Post>> {
    sqlx::query_as(
        r"
        SELECT * FROM posts
        WHERE tid = ?
          AND (? IS NULL OR post_number > ?)
          AND (? IS NULL OR author_uid = ?)
        ORDER BY post_number ASC
        ",
    )
    .bind(tid)
    .bind(start_post_number)
    .bind(start_post_number)
    .bind(author_uid)
    .bind(author_uid)
    .fetch_all(pool)
    .await
    .context("Failed to fetch posts")
}

// ========== Pending Pages ==========

/// Remember pages of a thread whose posts could not be stored.
pub async fn record_pending_pages(pool: &SqlitePool, tid: i64, pages: &[u32]) -> Result<()> {
    if pages.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    for &page in pages {
        sqlx::query("INSERT OR IGNORE INTO pending_pages (tid, page) VALUES (?, ?)")
            .bind(tid)
            .bind(i64::from(page))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to record pending page {page} of thread {tid}"))?;
    }
    tx.commit().await.context("Failed to commit pending pages")?;
    Ok(())
}

/// Pending pages of a thread, lowest first.
pub async fn list_pending_pages(pool: &SqlitePool, tid: i64) -> Result<Vec<u32>> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT page FROM pending_pages WHERE tid = ? ORDER BY page")
            .bind(tid)
            .fetch_all(pool)
            .await
            .context("Failed to list pending pages")?;
    Ok(rows.into_iter().map(|(page,)| page as u32).collect())
}

pub async fn clear_pending_pages(pool: &SqlitePool, tid: i64, pages: &[u32]) -> Result<()> {
    for &page in pages {
        sqlx::query("DELETE FROM pending_pages WHERE tid = ? AND page = ?")
            .bind(tid)
            .bind(i64::from(page))
            .execute(pool)
            .await
            .context("Failed to clear pending page")?;
    }
    Ok(())
}

// ========== Subscriptions ==========

pub async fn get_subscription(pool: &SqlitePool, tid: i64) -> Result<Option<Subscription>> {
    sqlx::query_as("SELECT * FROM monitored_threads WHERE tid = ?")
        .bind(tid)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch subscription")
}

/// Insert or update a subscription's settings and mark it active.
///
/// `last_checked` and `last_post_timestamp` are left untouched on update.
/// The thread row must already exist.
pub async fn upsert_subscription(pool: &SqlitePool, settings: &SubscriptionSettings) -> Result<()> {
    let schedule = if settings.check_schedule.is_empty() {
        None
    } else {
        Some(
            serde_json::to_string(&settings.check_schedule)
                .context("Failed to encode check schedule")?,
        )
    };

    sqlx::query(
        r"
        INSERT INTO monitored_threads
            (tid, author_filter, author_notification, check_interval, check_schedule, is_active)
        VALUES (?, ?, ?, ?, ?, 1)
        ON CONFLICT(tid) DO UPDATE SET
            author_filter = excluded.author_filter,
            author_notification = excluded.author_notification,
            check_interval = excluded.check_interval,
            check_schedule = excluded.check_schedule,
            is_active = 1
        ",
    )
    .bind(settings.tid)
    .bind(encode_uid_list(&settings.author_filter))
    .bind(encode_uid_list(&settings.author_notification))
    .bind(settings.check_interval as i64)
    .bind(schedule)
    .execute(pool)
    .await
    .context("Failed to upsert subscription")?;

    Ok(())
}

pub async fn mark_subscription_checked(
    pool: &SqlitePool,
    tid: i64,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE monitored_threads SET last_checked = ? WHERE tid = ?")
        .bind(format_db_time(at))
        .bind(tid)
        .execute(pool)
        .await
        .context("Failed to mark subscription checked")?;
    Ok(())
}

/// Raise `last_post_timestamp`; never lowers it.
pub async fn set_last_post_timestamp(pool: &SqlitePool, tid: i64, timestamp: i64) -> Result<()> {
    sqlx::query(
        "UPDATE monitored_threads SET last_post_timestamp = MAX(last_post_timestamp, ?) WHERE tid = ?",
    )
    .bind(timestamp)
    .bind(tid)
    .execute(pool)
    .await
    .context("Failed to set last post timestamp")?;
    Ok(())
}

/// Soft-delete a subscription. Returns true if an active row was deactivated.
pub async fn deactivate_subscription(pool: &SqlitePool, tid: i64) -> Result<bool> {
    let result =
        sqlx::query("UPDATE monitored_threads SET is_active = 0 WHERE tid = ? AND is_active = 1")
            .bind(tid)
            .execute(pool)
            .await
            .context("Failed to deactivate subscription")?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_active_subscriptions(pool: &SqlitePool) -> Result<Vec<Subscription>> {
    sqlx::query_as("SELECT * FROM monitored_threads WHERE is_active = 1 ORDER BY tid")
        .fetch_all(pool)
        .await
        .context("Failed to list active subscriptions")
}

/// Active subscriptions joined with their thread metadata.
pub async fn list_monitored_threads(pool: &SqlitePool) -> Result<Vec<MonitoredThread>> {
    sqlx::query_as(
        r"
        SELECT m.*, t.title, t.author_name, t.total_posts
        FROM monitored_threads m
        JOIN threads t ON t.tid = m.tid
        WHERE m.is_active = 1
        ORDER BY m.tid
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list monitored threads")
}

// ========== Monitoring Events ==========

/// Append an audit event, returning its id.
pub async fn append_event(
    pool: &SqlitePool,
    tid: i64,
    kind: EventKind,
    post_count: i64,
    message: Option<&str>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO monitoring_events (tid, event_type, post_count, message) VALUES (?, ?, ?, ?)",
    )
    .bind(tid)
    .bind(kind.as_str())
    .bind(post_count)
    .bind(message)
    .execute(pool)
    .await
    .context("Failed to append monitoring event")?;

    Ok(result.last_insert_rowid())
}

/// Newest events first, optionally for one thread.
pub async fn get_events(
    pool: &SqlitePool,
    tid: Option<i64>,
    limit: i64,
) -> Result<Vec<MonitoringEvent>> {
    sqlx::query_as(
        r"
        SELECT * FROM monitoring_events
        WHERE (? IS NULL OR tid = ?)
        ORDER BY id DESC
        LIMIT ?
        ",
    )
    .bind(tid)
    .bind(tid)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to fetch monitoring events")
}
