use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ThreadEntry};
use crate::crawler::{FetchError, PageHandler, PageSource, RangeCrawler, ThreadPage};
use crate::db::{self, Database, EventKind, NewPost, SubscriptionSettings};
use crate::notify::{Notification, NotificationDispatcher};

/// Knobs for the sync engine that do not come from a subscription.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Base URL for notification deep links.
    pub forum_url: String,
    /// Characters of post content included in a notification.
    pub preview_chars: usize,
    pub default_check_interval: u64,
}

impl SyncOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            forum_url: config.forum_url.trim_end_matches('/').to_string(),
            preview_chars: config.notify_preview_chars,
            default_check_interval: config.default_check_interval,
        }
    }
}

/// Result of a full initial crawl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub tid: i64,
    pub total_pages: u32,
    pub pages_failed: u32,
    pub posts_saved: u64,
    /// Pages left unstored and queued for the next reconcile.
    pub pages_pending: u32,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing was stored; the thread was crawled from scratch.
    Bootstrapped(BootstrapReport),
    /// Stored posts already cover the thread; only settings were written.
    Current,
    /// Missing posts were fetched starting at `from_page`.
    CaughtUp {
        from_page: u32,
        posts_saved: u64,
        cancelled: bool,
    },
}

/// Totals for one pass over the subscriptions file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    NoNewPosts,
    NewPosts {
        saved: usize,
        eligible: usize,
        notified: usize,
    },
    /// A page fetch failed; posts before it are stored and the thread
    /// total is held back so the next check starts at `failed_page`.
    Incomplete {
        saved: usize,
        eligible: usize,
        notified: usize,
        failed_page: u32,
    },
    /// Stopped between pages; whatever was fetched is stored.
    Cancelled { saved: usize },
    /// Recorded as an `error` event.
    Failed(String),
}

/// First page that can contain a post numbered above `high_water`.
///
/// `None` means nothing is stored yet.
#[must_use]
pub fn first_unseen_page(high_water: Option<i64>, per_page: u32) -> u32 {
    let next_post = high_water.unwrap_or(-1) + 1;
    let per_page = i64::from(per_page.max(1));
    (next_post / per_page + 1) as u32
}

/// Subscription settings for a config entry.
#[must_use]
pub fn settings_from_entry(entry: &ThreadEntry, default_interval: u64) -> SubscriptionSettings {
    SubscriptionSettings {
        tid: entry.tid,
        author_filter: entry.author_filter.clone().unwrap_or_default(),
        author_notification: entry.author_notification.clone().unwrap_or_default(),
        check_interval: entry
            .check_interval
            .filter(|i| *i > 0)
            .unwrap_or(default_interval),
        check_schedule: entry.check_schedule.clone(),
    }
}

/// Keeps stored threads in step with the forum.
pub struct SyncEngine {
    db: Database,
    source: Arc<dyn PageSource>,
    crawler: RangeCrawler,
    dispatcher: Arc<NotificationDispatcher>,
    options: SyncOptions,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        db: Database,
        source: Arc<dyn PageSource>,
        max_workers: usize,
        dispatcher: Arc<NotificationDispatcher>,
        options: SyncOptions,
    ) -> Self {
        let crawler = RangeCrawler::new(source.clone(), max_workers);
        Self {
            db,
            source,
            crawler,
            dispatcher,
            options,
        }
    }

    #[must_use]
    pub const fn db(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub const fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Crawl a thread from page 1 and start monitoring it.
    ///
    /// # Errors
    ///
    /// Returns an error if page 1 cannot be fetched or storage fails.
    /// Failures on later pages are logged and counted in the report.
    pub async fn subscribe(
        &self,
        settings: &SubscriptionSettings,
        cancel: &CancellationToken,
    ) -> Result<BootstrapReport> {
        let tid = settings.tid;
        info!(tid, "Bootstrapping thread");

        let first = self
            .source
            .fetch_page(tid, 1)
            .await
            .with_context(|| format!("Failed to fetch page 1 of thread {tid}"))?;
        let total_pages = page_count(&first);

        let pool = self.db.pool();
        db::save_thread(pool, &first.thread).await?;

        let mut handler = PersistPages::new(&self.db, tid, None);
        handler.persist(1, &first).await?;

        let summary = self
            .crawler
            .fetch_range(tid, 2, total_pages, &mut handler, cancel)
            .await;
        let pending = handler.unstored(2..=total_pages);
        db::record_pending_pages(pool, tid, &pending).await?;

        db::upsert_subscription(pool, settings).await?;
        db::set_last_post_timestamp(pool, tid, handler.max_timestamp).await?;
        // A partial crawl is left unchecked so the next reconcile fills it in
        if !summary.cancelled {
            db::mark_subscription_checked(pool, tid, Utc::now()).await?;
        }

        let report = BootstrapReport {
            tid,
            total_pages,
            pages_failed: summary.failed + handler.write_failures,
            posts_saved: handler.saved,
            pages_pending: pending.len() as u32,
            cancelled: summary.cancelled,
        };
        info!(
            tid,
            posts = report.posts_saved,
            failed_pages = report.pages_failed,
            pending_pages = report.pages_pending,
            cancelled = report.cancelled,
            "Bootstrap finished"
        );
        Ok(report)
    }

    /// Bring one configured thread up to date with the forum.
    ///
    /// # Errors
    ///
    /// Returns an error if page 1 cannot be fetched or storage fails.
    pub async fn reconcile(
        &self,
        entry: &ThreadEntry,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let tid = entry.tid;
        let settings = settings_from_entry(entry, self.options.default_check_interval);
        let pool = self.db.pool();

        if db::count_posts_for_thread(pool, tid).await? == 0 {
            return self
                .subscribe(&settings, cancel)
                .await
                .map(ReconcileOutcome::Bootstrapped);
        }

        let first = self
            .source
            .fetch_page(tid, 1)
            .await
            .with_context(|| format!("Failed to fetch page 1 of thread {tid}"))?;
        let refilled = self.refill_pending_pages(tid, &first, cancel).await?;
        let high_water = db::get_max_post_number(pool, tid).await?;

        if high_water.is_some_and(|hw| hw >= first.thread.total_posts - 1) {
            debug!(tid, ?high_water, refilled, "Thread already current");
            db::upsert_subscription(pool, &settings).await?;
            if refilled > 0 {
                let newest = db::get_max_post_timestamp(pool, tid).await?;
                db::set_last_post_timestamp(pool, tid, newest).await?;
            }
            return Ok(ReconcileOutcome::Current);
        }

        db::save_thread(pool, &first.thread).await?;

        let from_page = first_unseen_page(high_water, first.per_page);
        info!(
            tid,
            ?high_water,
            total_posts = first.thread.total_posts,
            from_page,
            "Catching up on missed posts"
        );

        let mut handler = PersistPages::new(&self.db, tid, high_water);
        let mut crawl_start = from_page;
        if from_page == 1 {
            handler.on_page(1, Ok(first.clone())).await;
            crawl_start = 2;
        }

        let last_page = page_count(&first);
        let summary = self
            .crawler
            .fetch_range(tid, crawl_start, last_page, &mut handler, cancel)
            .await;
        db::record_pending_pages(pool, tid, &handler.unstored(from_page..=last_page)).await?;

        db::upsert_subscription(pool, &settings).await?;
        let newest = db::get_max_post_timestamp(pool, tid).await?;
        db::set_last_post_timestamp(pool, tid, newest).await?;

        Ok(ReconcileOutcome::CaughtUp {
            from_page,
            posts_saved: handler.saved,
            cancelled: summary.cancelled,
        })
    }

    /// Re-fetch pages an earlier crawl failed to store, returning posts written.
    async fn refill_pending_pages(
        &self,
        tid: i64,
        first: &ThreadPage,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let pool = self.db.pool();
        let pending = db::list_pending_pages(pool, tid).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!(tid, pages = ?pending, "Refilling pages missed by an earlier crawl");

        let mut handler = PersistPages::new(&self.db, tid, None);
        let mut to_fetch = pending.clone();
        if to_fetch.first() == Some(&1) {
            handler.on_page(1, Ok(first.clone())).await;
            to_fetch.remove(0);
        }
        self.crawler
            .fetch_pages(tid, &to_fetch, &mut handler, cancel)
            .await;

        let refilled: Vec<u32> = pending
            .into_iter()
            .filter(|page| handler.stored.contains(page))
            .collect();
        db::clear_pending_pages(pool, tid, &refilled).await?;
        Ok(handler.saved)
    }

    /// Reconcile every configured thread in order.
    ///
    /// Per-entry failures are logged, recorded and counted. Disabled
    /// entries deactivate their subscription.
    pub async fn sync_subscriptions(
        &self,
        entries: &[ThreadEntry],
        cancel: &CancellationToken,
    ) -> SyncSummary {
        let mut summary = SyncSummary::default();

        for entry in entries {
            if cancel.is_cancelled() {
                info!("Subscription sync cancelled");
                break;
            }
            let tid = entry.tid;

            if !entry.enabled {
                match self.unsubscribe(tid).await {
                    Ok(true) => summary.removed += 1,
                    Ok(false) => summary.skipped += 1,
                    Err(e) => {
                        error!(tid, error = %e, "Failed to deactivate thread");
                        summary.errors += 1;
                    }
                }
                continue;
            }

            let existed = match db::get_subscription(self.db.pool(), tid).await {
                Ok(sub) => sub.is_some_and(|s| s.is_active),
                Err(e) => {
                    error!(tid, error = %e, "Failed to load subscription");
                    summary.errors += 1;
                    continue;
                }
            };

            match self.reconcile(entry, cancel).await {
                Ok(outcome) => {
                    debug!(tid, ?outcome, "Thread reconciled");
                    if existed {
                        summary.updated += 1;
                    } else {
                        summary.added += 1;
                    }
                }
                Err(e) => {
                    summary.errors += 1;
                    self.record_error(tid, &e).await;
                }
            }
        }

        info!(
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            skipped = summary.skipped,
            errors = summary.errors,
            "Subscription sync complete"
        );
        summary
    }

    /// Stop monitoring a thread. Stored posts are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub async fn unsubscribe(&self, tid: i64) -> Result<bool> {
        let removed = db::deactivate_subscription(self.db.pool(), tid).await?;
        if removed {
            info!(tid, "Thread unsubscribed");
        }
        Ok(removed)
    }

    /// Look for new posts in a monitored thread.
    ///
    /// Never fails: errors become an `error` event and a
    /// [`CheckOutcome::Failed`].
    pub async fn check_thread(
        &self,
        tid: i64,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> CheckOutcome {
        match self.try_check_thread(tid, now, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_error(tid, &e).await;
                CheckOutcome::Failed(format!("{e:#}"))
            }
        }
    }

    async fn try_check_thread(
        &self,
        tid: i64,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome> {
        let pool = self.db.pool();
        let sub = db::get_subscription(pool, tid)
            .await?
            .filter(|s| s.is_active)
            .with_context(|| format!("Thread {tid} is not monitored"))?;
        let stored = db::get_thread(pool, tid)
            .await?
            .with_context(|| format!("Thread {tid} not found in database"))?;

        let first = self
            .source
            .fetch_page(tid, 1)
            .await
            .with_context(|| format!("Failed to fetch page 1 of thread {tid}"))?;

        let old_total = stored.total_posts;
        let new_count = first.thread.total_posts - old_total;

        if new_count <= 0 {
            db::save_thread(pool, &first.thread).await?;
            db::mark_subscription_checked(pool, tid, now).await?;
            db::append_event(pool, tid, EventKind::Check, 0, Some("No new posts")).await?;
            debug!(tid, "No new posts");
            return Ok(CheckOutcome::NoNewPosts);
        }

        let high_water = db::get_max_post_number(pool, tid).await?;
        if high_water.unwrap_or(-1) != old_total - 1 {
            warn!(
                tid,
                ?high_water,
                stored_total = old_total,
                "SyncInconsistency: stored posts disagree with thread total, using stored posts"
            );
        }

        let from_page = first_unseen_page(high_water, first.per_page);
        let last_page = page_count(&first).max(from_page);
        info!(tid, new_count, from_page, last_page, "New posts detected");

        let author_filter = sub.author_filter_set();
        let mut seen = HashSet::new();
        let mut eligible: Vec<(NewPost, u32)> = Vec::new();
        let mut saved = 0;
        let mut newest = 0;
        let mut failed: Option<(u32, FetchError)> = None;

        for page in from_page..=last_page {
            if cancel.is_cancelled() {
                info!(tid, page, saved, "Check cancelled");
                return Ok(CheckOutcome::Cancelled { saved });
            }

            let fetched = if page == 1 {
                Ok(first.clone())
            } else {
                self.source.fetch_page(tid, page).await
            };
            let data = match fetched {
                Ok(data) => data,
                Err(e) => {
                    warn!(tid, page, error = %e, "Page fetch failed, stopping check");
                    failed = Some((page, e));
                    break;
                }
            };

            let mut fresh = Vec::new();
            for post in data.posts {
                if !seen.insert(post.pid) || db::post_exists(pool, post.pid).await? {
                    continue;
                }
                fresh.push(post);
            }
            if fresh.is_empty() {
                continue;
            }

            db::save_posts_batch(pool, &fresh).await?;
            saved += fresh.len();

            for post in fresh {
                newest = newest.max(post.post_timestamp);
                if author_filter.is_empty() || author_filter.contains(&post.author_uid) {
                    eligible.push((post, page));
                }
            }
        }

        let mut thread = first.thread.clone();
        if failed.is_some() {
            // Held back so the next check resumes at the failed page
            let stored_max = db::get_max_post_number(pool, tid).await?;
            thread.total_posts = thread.total_posts.min(stored_max.map_or(0, |n| n + 1));
        }
        db::save_thread(pool, &thread).await?;
        db::set_last_post_timestamp(pool, tid, newest).await?;
        db::mark_subscription_checked(pool, tid, now).await?;

        if !eligible.is_empty() {
            let message = format!("Found {} new posts", eligible.len());
            db::append_event(
                pool,
                tid,
                EventKind::NewPost,
                eligible.len() as i64,
                Some(&message),
            )
            .await?;
        } else if saved > 0 {
            db::append_event(
                pool,
                tid,
                EventKind::Check,
                saved as i64,
                Some("New posts found but none match filter"),
            )
            .await?;
        } else if failed.is_none() {
            db::append_event(pool, tid, EventKind::Check, 0, Some("No new posts found")).await?;
        }

        if let Some((page, e)) = &failed {
            let message = format!("Failed to fetch page {page}: {e}; retrying on next check");
            db::append_event(pool, tid, EventKind::Error, 0, Some(&message)).await?;
        }

        let notify_authors = sub.author_notification_set();
        let mut notified = 0;
        for (post, page) in &eligible {
            if !notify_authors.contains(&post.author_uid) {
                continue;
            }
            let notification = self.build_notification(&first.thread.title, post, *page);
            if self.dispatcher.send(&notification).await > 0 {
                notified += 1;
            }
        }

        info!(
            tid,
            saved,
            eligible = eligible.len(),
            notified,
            failed_page = failed.as_ref().map(|(page, _)| *page),
            "Thread check complete"
        );
        Ok(match failed {
            Some((failed_page, _)) => CheckOutcome::Incomplete {
                saved,
                eligible: eligible.len(),
                notified,
                failed_page,
            },
            None => CheckOutcome::NewPosts {
                saved,
                eligible: eligible.len(),
                notified,
            },
        })
    }

    fn build_notification(&self, title: &str, post: &NewPost, page: u32) -> Notification {
        let preview: String = post
            .content
            .replace("<br/>", " ")
            .replace("<br />", " ")
            .replace(['\r', '\n'], " ")
            .chars()
            .take(self.options.preview_chars)
            .collect();

        Notification {
            title: format!("📬 {title}"),
            body: format!("{}: {}", post.author_name, preview.trim()),
            url: format!(
                "{}/read.php?tid={}&page={}#pid{}Anchor",
                self.options.forum_url, post.tid, page, post.pid
            ),
        }
    }

    async fn record_error(&self, tid: i64, err: &anyhow::Error) {
        let message = format!("{err:#}");
        error!(tid, error = %message, "Thread sync failed");
        if let Err(e) =
            db::append_event(self.db.pool(), tid, EventKind::Error, 0, Some(&message)).await
        {
            warn!(tid, error = %e, "Failed to record error event");
        }
    }
}

fn page_count(page: &ThreadPage) -> u32 {
    u32::try_from(page.thread.total_pages.max(1)).unwrap_or(u32::MAX)
}

/// Writes each crawled page as one batch, dropping posts at or below `floor`.
struct PersistPages<'a> {
    db: &'a Database,
    tid: i64,
    floor: Option<i64>,
    /// Pages whose batch was written.
    stored: HashSet<u32>,
    saved: u64,
    max_timestamp: i64,
    write_failures: u32,
}

impl<'a> PersistPages<'a> {
    fn new(db: &'a Database, tid: i64, floor: Option<i64>) -> Self {
        Self {
            db,
            tid,
            floor,
            stored: HashSet::new(),
            saved: 0,
            max_timestamp: 0,
            write_failures: 0,
        }
    }

    async fn persist(&mut self, page_no: u32, page: &ThreadPage) -> Result<()> {
        let posts: Vec<NewPost> = page
            .posts
            .iter()
            .filter(|p| self.floor.map_or(true, |floor| p.post_number > floor))
            .cloned()
            .collect();

        self.saved += db::save_posts_batch(self.db.pool(), &posts).await?;
        self.max_timestamp = self.max_timestamp.max(page.max_timestamp());
        self.stored.insert(page_no);
        Ok(())
    }

    /// Pages of `range` that were not written.
    fn unstored(&self, range: impl IntoIterator<Item = u32>) -> Vec<u32> {
        range
            .into_iter()
            .filter(|page| !self.stored.contains(page))
            .collect()
    }
}

#[async_trait]
impl<'a> PageHandler for PersistPages<'a> {
    async fn on_page(&mut self, page: u32, result: Result<ThreadPage, FetchError>) {
        // Fetch failures are already logged by the crawler
        let Ok(data) = result else { return };
        if let Err(e) = self.persist(page, &data).await {
            error!(tid = self.tid, page, error = %e, "Failed to store page");
            self.write_failures += 1;
        }
    }
}
