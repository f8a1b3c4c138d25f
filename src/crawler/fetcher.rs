use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::COOKIE;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

use super::{FetchError, PageSource, Passport, RateLimiter, ThreadPage};
use crate::config::Config;
use crate::constants::DEFAULT_POSTS_PER_PAGE;
use crate::db::{NewPost, NewThread};

/// Authenticated client for the thread listing endpoint.
pub struct PageFetcher {
    client: Client,
    api_url: String,
    passport: Passport,
    limiter: Arc<RateLimiter>,
}

impl PageFetcher {
    /// Build a fetcher with its own rate limiter from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &Config, passport: Passport) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));
        Self::with_limiter(config, passport, limiter)
    }

    /// Build a fetcher that shares an existing rate limiter.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_limiter(
        config: &Config,
        passport: Passport,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            passport,
            limiter,
        })
    }

    #[must_use]
    pub fn passport(&self) -> &Passport {
        &self.passport
    }
}

#[async_trait]
impl PageSource for PageFetcher {
    async fn fetch_page(&self, tid: i64, page: u32) -> Result<ThreadPage, FetchError> {
        self.limiter.acquire().await;
        debug!(tid, page, "Fetching thread page");

        let response = self
            .client
            .post(&self.api_url)
            .form(&[("tid", tid.to_string()), ("page", page.to_string())])
            .header(COOKIE, self.passport.cookie().await)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(tid, page, status = %status, "Thread page request failed");
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        decode_page(tid, page, &body)
    }
}

/// Decode a listing response body.
///
/// `tid` and `requested_page` come from the request; the body's own `tid`
/// fields are ignored.
///
/// # Errors
///
/// Returns [`FetchError::Decode`] for malformed JSON or a non-zero `code`.
pub fn decode_page(tid: i64, requested_page: u32, body: &str) -> Result<ThreadPage, FetchError> {
    let raw: RawPage =
        serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;

    if let Some(code) = raw.code.filter(|c| *c != 0) {
        let msg = raw.msg.map_or_else(String::new, |m| match m {
            Value::String(s) => s,
            other => other.to_string(),
        });
        return Err(FetchError::Decode(format!("API error code {code}: {msg}")));
    }

    let posts = raw
        .result
        .into_iter()
        .map(|p| NewPost {
            pid: p.pid,
            tid,
            fid: p.fid,
            author_uid: p.author.uid,
            author_name: p.author.username,
            post_date: p.postdate,
            post_timestamp: p.postdatetimestamp,
            post_number: p.lou,
            content: p.content,
        })
        .collect();

    Ok(ThreadPage {
        thread: NewThread {
            tid,
            title: raw.tsubject,
            author_name: raw.tauthor,
            author_uid: raw.tauthorid,
            total_posts: raw.vrows,
            total_pages: raw.total_page,
        },
        current_page: raw
            .current_page
            .map_or(requested_page, |p| u32::try_from(p).unwrap_or(requested_page)),
        per_page: raw
            .per_page
            .and_then(|p| u32::try_from(p).ok())
            .filter(|p| *p > 0)
            .unwrap_or(DEFAULT_POSTS_PER_PAGE),
        posts,
    })
}

#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<Value>,
    #[serde(default)]
    tsubject: String,
    #[serde(default)]
    tauthor: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    tauthorid: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    vrows: i64,
    #[serde(rename = "totalPage", default, deserialize_with = "lenient_i64")]
    total_page: i64,
    #[serde(rename = "perPage", default, deserialize_with = "lenient_opt_i64")]
    per_page: Option<i64>,
    #[serde(rename = "currentPage", default, deserialize_with = "lenient_opt_i64")]
    current_page: Option<i64>,
    #[serde(default)]
    result: Vec<RawPost>,
}

#[derive(Debug, Deserialize)]
struct RawPost {
    #[serde(deserialize_with = "lenient_i64")]
    pid: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    fid: i64,
    #[serde(default)]
    content: String,
    #[serde(default)]
    postdate: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    postdatetimestamp: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    lou: i64,
    #[serde(default)]
    author: RawAuthor,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuthor {
    #[serde(default, deserialize_with = "lenient_i64")]
    uid: i64,
    #[serde(default)]
    username: String,
}

// The API is inconsistent about quoting numbers.
fn lenient_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("not an integer: {n}"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("not an integer: {s:?}"))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected integer, got {other}"
        ))),
    }
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_opt_i64(deserializer).map(Option::unwrap_or_default)
}
