use std::sync::atomic::Ordering;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::db::{self, MonitoredThread};

const DEFAULT_EVENT_LIMIT: i64 = 50;
const MAX_EVENT_LIMIT: i64 = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(health))
        .route("/api/v1/posts", get(list_posts))
        .route("/api/v1/threads", get(list_threads))
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/passport", post(update_passport))
}

fn database_error(context: &str, e: &anyhow::Error) -> Response {
    tracing::error!("{context}: {e:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Database error" })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /api/v1/posts?tid=&start_post_number=&author_uid=",
            "GET /api/v1/threads",
            "GET /api/v1/events?tid=&limit=",
            "POST /api/v1/passport",
            "GET /healthz",
        ],
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "monitor_running": state.monitor_running.load(Ordering::SeqCst),
    }))
}

#[derive(Debug, Deserialize)]
struct PostsParams {
    tid: i64,
    start_post_number: Option<i64>,
    author_uid: Option<i64>,
}

async fn list_posts(State(state): State<AppState>, Query(params): Query<PostsParams>) -> Response {
    if params.tid <= 0 {
        return bad_request("tid must be positive");
    }

    match db::get_posts_after(
        state.db.pool(),
        params.tid,
        params.start_post_number,
        params.author_uid,
    )
    .await
    {
        Ok(posts) => Json(json!({
            "tid": params.tid,
            "count": posts.len(),
            "posts": posts,
        }))
        .into_response(),
        Err(e) => database_error("Failed to fetch posts", &e),
    }
}

#[derive(Debug, Serialize)]
struct ThreadView {
    tid: i64,
    title: String,
    author_name: String,
    total_posts: i64,
    author_filter: Vec<i64>,
    author_notification: Vec<i64>,
    check_interval: i64,
    last_checked: Option<String>,
    last_post_timestamp: i64,
}

impl From<MonitoredThread> for ThreadView {
    fn from(thread: MonitoredThread) -> Self {
        let sub = &thread.subscription;
        let mut author_filter: Vec<i64> = sub.author_filter_set().into_iter().collect();
        author_filter.sort_unstable();
        let mut author_notification: Vec<i64> =
            sub.author_notification_set().into_iter().collect();
        author_notification.sort_unstable();

        Self {
            tid: sub.tid,
            author_filter,
            author_notification,
            check_interval: sub.check_interval,
            last_checked: sub.last_checked.clone(),
            last_post_timestamp: sub.last_post_timestamp,
            title: thread.title,
            author_name: thread.author_name,
            total_posts: thread.total_posts,
        }
    }
}

async fn list_threads(State(state): State<AppState>) -> Response {
    match db::list_monitored_threads(state.db.pool()).await {
        Ok(threads) => {
            let threads: Vec<ThreadView> = threads.into_iter().map(ThreadView::from).collect();
            Json(json!({ "threads": threads })).into_response()
        }
        Err(e) => database_error("Failed to list monitored threads", &e),
    }
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    tid: Option<i64>,
    limit: Option<i64>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);

    match db::get_events(state.db.pool(), params.tid, limit).await {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => database_error("Failed to fetch events", &e),
    }
}

#[derive(Debug, Deserialize)]
struct PassportBody {
    uid: String,
    cid: String,
}

async fn update_passport(State(state): State<AppState>, Json(body): Json<PassportBody>) -> Response {
    let uid = body.uid.trim();
    let cid = body.cid.trim();
    if uid.is_empty() || cid.is_empty() {
        return bad_request("uid and cid are required");
    }

    state.passport.rotate(uid, cid).await;
    tracing::info!(uid = %uid, "Forum passport updated");
    Json(json!({ "status": "ok" })).into_response()
}
