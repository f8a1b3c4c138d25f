//! Paginated thread fetching: request pacing, single-page decoding and
//! concurrent page-range crawls.

pub mod fetcher;
pub mod range;
pub mod rate_limiter;

pub use fetcher::{decode_page, PageFetcher};
pub use range::{CrawlSummary, PageHandler, RangeCrawler};
pub use rate_limiter::RateLimiter;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::db::{NewPost, NewThread};

/// Why a single page could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Connection, timeout or body read failure.
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    /// Malformed JSON or an error envelope from the API.
    #[error("invalid response: {0}")]
    Decode(String),
}

/// One decoded page of a thread listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPage {
    pub thread: NewThread,
    pub current_page: u32,
    pub per_page: u32,
    /// Posts in forum order.
    pub posts: Vec<NewPost>,
}

impl ThreadPage {
    /// Newest post timestamp on this page, 0 when empty.
    #[must_use]
    pub fn max_timestamp(&self) -> i64 {
        self.posts.iter().map(|p| p.post_timestamp).max().unwrap_or(0)
    }
}

/// Anything that can produce a thread page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, tid: i64, page: u32) -> Result<ThreadPage, FetchError>;
}

/// Forum login cookie values, shared so they can be rotated while running.
#[derive(Debug, Clone)]
pub struct Passport {
    inner: Arc<RwLock<Credentials>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Credentials {
    uid: String,
    cid: String,
}

impl Passport {
    #[must_use]
    pub fn new(uid: impl Into<String>, cid: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Credentials {
                uid: uid.into(),
                cid: cid.into(),
            })),
        }
    }

    /// `Cookie` header value for the current credentials.
    pub async fn cookie(&self) -> String {
        let creds = self.inner.read().await;
        format!("ngaPassportUid={}; ngaPassportCid={}", creds.uid, creds.cid)
    }

    pub async fn uid(&self) -> String {
        self.inner.read().await.uid.clone()
    }

    /// Replace the credentials used by subsequent requests.
    pub async fn rotate(&self, uid: impl Into<String>, cid: impl Into<String>) {
        let mut creds = self.inner.write().await;
        creds.uid = uid.into();
        creds.cid = cid.into();
    }
}
