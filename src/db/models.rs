use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::CheckWindow;

/// Format used for every datetime column (`SQLite`'s `datetime('now')` shape, UTC).
pub const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format a UTC timestamp the way the database stores it.
#[must_use]
pub fn format_db_time(at: DateTime<Utc>) -> String {
    at.format(DB_TIME_FORMAT).to_string()
}

/// Parse a database datetime string as UTC.
#[must_use]
pub fn parse_db_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, DB_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// A forum thread's metadata as last observed on page 1.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Thread {
    pub tid: i64,
    pub title: String,
    pub author_name: String,
    pub author_uid: i64,
    pub total_posts: i64,
    pub total_pages: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// A stored forum post.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub pid: i64,
    pub tid: i64,
    pub fid: i64,
    pub author_uid: i64,
    pub author_name: String,
    pub post_date: String,
    pub post_timestamp: i64,
    pub post_number: i64,
    pub content: String,
    pub created_at: String,
}

/// A thread subscription (one row of `monitored_threads`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub tid: i64,
    pub author_filter: Option<String>,
    pub author_notification: Option<String>,
    pub check_interval: i64,
    pub last_checked: Option<String>,
    pub last_post_timestamp: i64,
    pub is_active: bool,
    pub created_at: String,
    pub check_schedule: Option<String>,
}

impl Subscription {
    /// Authors whose new posts count as notification candidates.
    /// Empty means every author qualifies.
    #[must_use]
    pub fn author_filter_set(&self) -> HashSet<i64> {
        decode_uid_list(self.author_filter.as_deref())
    }

    /// Authors whose eligible posts trigger a push. Empty means nobody.
    #[must_use]
    pub fn author_notification_set(&self) -> HashSet<i64> {
        decode_uid_list(self.author_notification.as_deref())
    }

    #[must_use]
    pub fn check_windows(&self) -> Vec<CheckWindow> {
        self.check_schedule
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.last_checked.as_deref().and_then(parse_db_time)
    }
}

/// Active subscription joined with its thread, for listings.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MonitoredThread {
    #[sqlx(flatten)]
    pub subscription: Subscription,
    pub title: String,
    pub author_name: String,
    pub total_posts: i64,
}

/// Kind of monitoring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Check,
    NewPost,
    Error,
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::NewPost => "new_post",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "check" => Some(Self::Check),
            "new_post" => Some(Self::NewPost),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// An append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MonitoringEvent {
    pub id: i64,
    pub tid: i64,
    pub event_type: String,
    pub post_count: i64,
    pub message: Option<String>,
    pub created_at: String,
}

impl MonitoringEvent {
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_str(&self.event_type)
    }
}

/// Thread metadata for upserting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewThread {
    pub tid: i64,
    pub title: String,
    pub author_name: String,
    pub author_uid: i64,
    pub total_posts: i64,
    pub total_pages: i64,
}

/// Post data for upserting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub pid: i64,
    pub tid: i64,
    pub fid: i64,
    pub author_uid: i64,
    pub author_name: String,
    pub post_date: String,
    pub post_timestamp: i64,
    pub post_number: i64,
    pub content: String,
}

/// User-controlled subscription settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSettings {
    pub tid: i64,
    pub author_filter: Vec<i64>,
    pub author_notification: Vec<i64>,
    pub check_interval: u64,
    pub check_schedule: Vec<CheckWindow>,
}

pub(crate) fn encode_uid_list(uids: &[i64]) -> Option<String> {
    if uids.is_empty() {
        None
    } else {
        serde_json::to_string(uids).ok()
    }
}

fn decode_uid_list(raw: Option<&str>) -> HashSet<i64> {
    raw.and_then(|s| serde_json::from_str::<Vec<i64>>(s).ok())
        .map(|uids| uids.into_iter().collect())
        .unwrap_or_default()
}
