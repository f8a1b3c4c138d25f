use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FetchError, PageSource, ThreadPage};

/// Receives crawled pages one at a time, in completion order.
#[async_trait]
pub trait PageHandler: Send {
    async fn on_page(&mut self, page: u32, result: Result<ThreadPage, FetchError>);
}

/// Outcome counters of a range crawl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    /// Pages in the requested range.
    pub requested: u32,
    /// Pages handed to the handler, failures included.
    pub delivered: u32,
    /// Delivered pages whose fetch failed.
    pub failed: u32,
    pub cancelled: bool,
}

/// Fetches page ranges through a bounded pool of concurrent workers.
#[derive(Clone)]
pub struct RangeCrawler {
    source: Arc<dyn PageSource>,
    max_workers: usize,
}

impl RangeCrawler {
    #[must_use]
    pub fn new(source: Arc<dyn PageSource>, max_workers: usize) -> Self {
        Self {
            source,
            max_workers: max_workers.max(1),
        }
    }

    #[must_use]
    pub fn source(&self) -> &Arc<dyn PageSource> {
        &self.source
    }

    /// Fetch pages `start_page..=end_page` of `tid`.
    ///
    /// Every page that completes before cancellation is passed to `handler`
    /// exactly once, failures included. Once `cancel` fires no further pages
    /// are delivered; fetches already on the wire are left to finish in the
    /// background and their results dropped.
    pub async fn fetch_range<H>(
        &self,
        tid: i64,
        start_page: u32,
        end_page: u32,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> CrawlSummary
    where
        H: PageHandler + ?Sized,
    {
        if start_page > end_page {
            return CrawlSummary::default();
        }
        let pages: Vec<u32> = (start_page..=end_page).collect();
        self.fetch_pages(tid, &pages, handler, cancel).await
    }

    /// Fetch an arbitrary set of pages with the same delivery rules as
    /// [`fetch_range`](Self::fetch_range).
    pub async fn fetch_pages<H>(
        &self,
        tid: i64,
        pages: &[u32],
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> CrawlSummary
    where
        H: PageHandler + ?Sized,
    {
        let mut summary = CrawlSummary::default();
        if pages.is_empty() {
            return summary;
        }
        summary.requested = pages.len() as u32;

        info!(
            tid,
            first_page = pages[0],
            last_page = pages[pages.len() - 1],
            count = pages.len(),
            workers = self.max_workers,
            "Starting page crawl"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut join_set = JoinSet::new();

        for &page in pages {
            let source = self.source.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                if cancel.is_cancelled() {
                    return None;
                }
                Some((page, source.fetch_page(tid, page).await))
            });
        }

        loop {
            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                joined = join_set.join_next() => joined,
            };

            let Some(joined) = joined else { break };

            match joined {
                Ok(Some((page, result))) => {
                    if let Err(e) = &result {
                        warn!(tid, page, error = %e, "Page fetch failed");
                        summary.failed += 1;
                    }
                    summary.delivered += 1;
                    handler.on_page(page, result).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(tid, error = %e, "Page worker panicked");
                }
            }
        }

        if summary.cancelled {
            debug!(
                tid,
                remaining = join_set.len(),
                "Crawl cancelled, detaching outstanding workers"
            );
            join_set.detach_all();
        }

        info!(
            tid,
            delivered = summary.delivered,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Page crawl finished"
        );
        summary
    }
}
