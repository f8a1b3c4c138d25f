//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nga_reminder::config::Config;
use nga_reminder::crawler::{FetchError, PageSource, ThreadPage};
use nga_reminder::db::{Database, NewPost, NewThread};
use nga_reminder::monitor::{SyncEngine, SyncOptions};
use nga_reminder::notify::{Notification, NotificationDispatcher, Notifier};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const PER_PAGE: u32 = 20;
pub const BASE_TIMESTAMP: i64 = 1_700_000_000;

pub async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

/// Post id of post number `n` in thread `tid`.
pub fn pid_for(tid: i64, n: i64) -> i64 {
    tid * 10_000 + n
}

#[derive(Default)]
struct FakeThread {
    title: String,
    authors: Vec<i64>,
}

/// In-memory forum serving pages the same way the real API does.
#[derive(Default)]
pub struct FakeForum {
    threads: Mutex<HashMap<i64, FakeThread>>,
    failing: Mutex<HashSet<(i64, u32)>>,
    hidden: Mutex<HashSet<(i64, i64)>>,
    cancel_at: Mutex<Option<(usize, CancellationToken)>>,
    requests: Mutex<Vec<(i64, u32)>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeForum {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a thread whose posts are all written by `author`.
    pub fn add_thread(&self, tid: i64, post_count: usize, author: i64) {
        self.add_thread_with_authors(tid, &vec![author; post_count]);
    }

    pub fn add_thread_with_authors(&self, tid: i64, authors: &[i64]) {
        self.threads.lock().unwrap().insert(
            tid,
            FakeThread {
                title: format!("Thread {tid}"),
                authors: authors.to_vec(),
            },
        );
    }

    /// Append replies by the given authors.
    pub fn reply(&self, tid: i64, authors: &[i64]) {
        self.threads
            .lock()
            .unwrap()
            .get_mut(&tid)
            .expect("unknown thread")
            .authors
            .extend_from_slice(authors);
    }

    pub fn fail_page(&self, tid: i64, page: u32) {
        self.failing.lock().unwrap().insert((tid, page));
    }

    pub fn heal_page(&self, tid: i64, page: u32) {
        self.failing.lock().unwrap().remove(&(tid, page));
    }

    /// Leave post `n` out of every page while still counting it in the totals.
    pub fn hide_post(&self, tid: i64, n: i64) {
        self.hidden.lock().unwrap().insert((tid, n));
    }

    /// Cancel `token` when the `count`-th request arrives.
    pub fn cancel_on_request(&self, count: usize, token: CancellationToken) {
        *self.cancel_at.lock().unwrap() = Some((count, token));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<(i64, u32)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    /// Pages requested for `tid`, in request order.
    pub fn requested_pages(&self, tid: i64) -> Vec<u32> {
        self.requests()
            .into_iter()
            .filter(|(t, _)| *t == tid)
            .map(|(_, p)| p)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn render(&self, tid: i64, page: u32) -> Result<ThreadPage, FetchError> {
        let threads = self.threads.lock().unwrap();
        let hidden = self.hidden.lock().unwrap();
        let thread = threads
            .get(&tid)
            .ok_or_else(|| FetchError::Decode("API error code 1: no such thread".to_string()))?;

        let total = thread.authors.len();
        let total_pages = total.div_ceil(PER_PAGE as usize).max(1);
        let start = (page as usize - 1) * PER_PAGE as usize;
        let end = (start + PER_PAGE as usize).min(total);

        let posts = (start..end.max(start))
            .filter(|n| !hidden.contains(&(tid, *n as i64)))
            .map(|n| NewPost {
                pid: pid_for(tid, n as i64),
                tid,
                fid: 7,
                author_uid: thread.authors[n],
                author_name: format!("user{}", thread.authors[n]),
                post_date: format!("2024-01-01 00:{:02}", n % 60),
                post_timestamp: BASE_TIMESTAMP + n as i64 * 60,
                post_number: n as i64,
                content: format!("post {n}<br/>second line"),
            })
            .collect();

        Ok(ThreadPage {
            thread: NewThread {
                tid,
                title: thread.title.clone(),
                author_name: "op".to_string(),
                author_uid: 1,
                total_posts: total as i64,
                total_pages: total_pages as i64,
            },
            current_page: page,
            per_page: PER_PAGE,
            posts,
        })
    }
}

#[async_trait]
impl PageSource for FakeForum {
    async fn fetch_page(&self, tid: i64, page: u32) -> Result<ThreadPage, FetchError> {
        let request_count = {
            let mut requests = self.requests.lock().unwrap();
            requests.push((tid, page));
            requests.len()
        };
        if let Some((count, token)) = &*self.cancel_at.lock().unwrap() {
            if request_count == *count {
                token.cancel();
            }
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = if self.failing.lock().unwrap().contains(&(tid, page)) {
            Err(FetchError::Status(500))
        } else {
            self.render(tid, page)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Notifier that keeps everything it is asked to send.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, notification: &Notification) -> bool {
        self.sent.lock().unwrap().push(notification.clone());
        true
    }
}

pub fn test_options() -> SyncOptions {
    SyncOptions {
        forum_url: "https://bbs.example.com".to_string(),
        ..SyncOptions::from_config(&Config::for_testing())
    }
}

/// Engine over a fake forum with a recording notifier.
pub fn engine(db: &Database, forum: &Arc<FakeForum>) -> (SyncEngine, RecordingNotifier) {
    let recorder = RecordingNotifier::default();
    let dispatcher = NotificationDispatcher::new(vec![Box::new(recorder.clone())]);
    let engine = SyncEngine::new(
        db.clone(),
        forum.clone(),
        4,
        Arc::new(dispatcher),
        test_options(),
    );
    (engine, recorder)
}
