//! Integration tests for bootstrap, reconciliation and incremental checks.

mod common;

use chrono::Utc;
use common::{engine, pid_for, setup_db, FakeForum, BASE_TIMESTAMP, PER_PAGE};
use nga_reminder::config::ThreadEntry;
use nga_reminder::db::{
    count_posts_for_thread, get_events, get_max_post_number, get_subscription, get_thread,
    list_pending_pages, SubscriptionSettings,
};
use nga_reminder::monitor::{CheckOutcome, ReconcileOutcome};
use tokio_util::sync::CancellationToken;

const TID: i64 = 45_907_597;

fn settings(author_filter: &[i64], author_notification: &[i64]) -> SubscriptionSettings {
    SubscriptionSettings {
        tid: TID,
        author_filter: author_filter.to_vec(),
        author_notification: author_notification.to_vec(),
        check_interval: 300,
        check_schedule: Vec::new(),
    }
}

fn entry(tid: i64) -> ThreadEntry {
    ThreadEntry {
        tid,
        enabled: true,
        author_filter: None,
        author_notification: None,
        check_interval: Some(120),
        check_schedule: Vec::new(),
    }
}

#[tokio::test]
async fn test_bootstrap_stores_whole_thread() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 45, 300);
    let (engine, _) = engine(&db, &forum);

    let report = engine
        .subscribe(&settings(&[], &[]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.total_pages, 3);
    assert_eq!(report.posts_saved, 45);
    assert_eq!(report.pages_failed, 0);
    assert!(!report.cancelled);

    let pool = db.pool();
    assert_eq!(count_posts_for_thread(pool, TID).await.unwrap(), 45);
    assert_eq!(get_max_post_number(pool, TID).await.unwrap(), Some(44));

    let thread = get_thread(pool, TID).await.unwrap().unwrap();
    assert_eq!(thread.total_posts, 45);
    assert_eq!(thread.total_pages, 3);

    let sub = get_subscription(pool, TID).await.unwrap().unwrap();
    assert!(sub.is_active);
    assert!(sub.last_checked.is_some());
    assert_eq!(sub.last_post_timestamp, BASE_TIMESTAMP + 44 * 60);
}

#[tokio::test]
async fn test_reconcile_current_thread_only_updates_settings() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 45, 300);
    let (engine, _) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    engine.subscribe(&settings(&[], &[]), &cancel).await.unwrap();
    forum.clear_requests();

    let outcome = engine.reconcile(&entry(TID), &cancel).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Current);
    assert_eq!(forum.requested_pages(TID), vec![1]);

    let sub = get_subscription(db.pool(), TID).await.unwrap().unwrap();
    assert_eq!(sub.check_interval, 120);
}

#[tokio::test]
async fn test_reconcile_fetches_only_missing_pages() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 41, 300);
    let (engine, _) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    engine.subscribe(&settings(&[], &[]), &cancel).await.unwrap();
    forum.reply(TID, &[300, 300, 300, 300]);
    forum.clear_requests();

    let outcome = engine.reconcile(&entry(TID), &cancel).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::CaughtUp {
            from_page: 3,
            posts_saved: 4,
            cancelled: false,
        }
    );
    // Post 40 is on page 3 again but is dropped before writing
    assert_eq!(forum.requested_pages(TID), vec![1, 3]);
    assert_eq!(count_posts_for_thread(db.pool(), TID).await.unwrap(), 45);
}

#[tokio::test]
async fn test_reconcile_refills_failed_pages() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 3 * PER_PAGE as usize, 300);
    forum.fail_page(TID, 2);
    let (engine, _) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    let report = engine.subscribe(&settings(&[], &[]), &cancel).await.unwrap();
    assert_eq!(report.pages_failed, 1);
    assert_eq!(report.pages_pending, 1);

    let pool = db.pool();
    assert_eq!(count_posts_for_thread(pool, TID).await.unwrap(), 40);
    assert_eq!(get_max_post_number(pool, TID).await.unwrap(), Some(59));
    assert_eq!(list_pending_pages(pool, TID).await.unwrap(), vec![2]);

    // Still failing: the page stays queued
    engine.reconcile(&entry(TID), &cancel).await.unwrap();
    assert_eq!(list_pending_pages(pool, TID).await.unwrap(), vec![2]);

    forum.heal_page(TID, 2);
    forum.clear_requests();
    let outcome = engine.reconcile(&entry(TID), &cancel).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Current);
    assert_eq!(forum.requested_pages(TID), vec![1, 2]);
    assert_eq!(count_posts_for_thread(pool, TID).await.unwrap(), 60);
    assert!(list_pending_pages(pool, TID).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_post_number_does_not_trigger_refetch() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 10 * PER_PAGE as usize, 300);
    forum.hide_post(TID, 5);
    let (engine, _) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    let report = engine.subscribe(&settings(&[], &[]), &cancel).await.unwrap();
    assert_eq!(report.posts_saved, 199);
    assert_eq!(report.pages_pending, 0);

    forum.clear_requests();
    let outcome = engine.reconcile(&entry(TID), &cancel).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Current);
    assert_eq!(forum.requested_pages(TID), vec![1]);

    forum.reply(TID, &[300, 300, 300]);
    forum.clear_requests();
    let outcome = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert!(matches!(outcome, CheckOutcome::NewPosts { saved: 3, .. }));
    assert_eq!(forum.requested_pages(TID), vec![1, 11]);
}

#[tokio::test]
async fn test_cancelled_bootstrap_keeps_delivered_pages() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 50 * PER_PAGE as usize, 300);
    let (engine, _) = engine(&db, &forum);

    let cancel = CancellationToken::new();
    forum.cancel_on_request(11, cancel.clone());

    let report = engine.subscribe(&settings(&[], &[]), &cancel).await.unwrap();
    assert!(report.cancelled);

    let pool = db.pool();
    let stored = count_posts_for_thread(pool, TID).await.unwrap();
    assert_eq!(stored as u64, report.posts_saved);
    assert!(stored >= i64::from(PER_PAGE));
    assert!(stored < 50 * i64::from(PER_PAGE));
    // Delivered pages are stored whole; every other page is queued
    assert_eq!(stored % i64::from(PER_PAGE), 0);
    let pending = list_pending_pages(pool, TID).await.unwrap();
    assert_eq!(pending.len() as u32, report.pages_pending);
    assert_eq!(
        pending.len() as i64,
        50 - stored / i64::from(PER_PAGE)
    );
    assert!(!pending.contains(&1));

    let sub = get_subscription(pool, TID).await.unwrap().unwrap();
    assert!(sub.last_checked.is_none());

    let outcome = engine
        .reconcile(&entry(TID), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Current);
    assert_eq!(count_posts_for_thread(pool, TID).await.unwrap(), 1000);
    assert!(list_pending_pages(pool, TID).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reconcile_bootstraps_unknown_thread() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 5, 300);
    let (engine, _) = engine(&db, &forum);

    let outcome = engine
        .reconcile(&entry(TID), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Bootstrapped(r) if r.posts_saved == 5));
}

#[tokio::test]
async fn test_check_saves_new_posts_and_notifies_filtered_authors() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 41, 300);
    let (engine, recorder) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    engine
        .subscribe(&settings(&[100], &[100]), &cancel)
        .await
        .unwrap();
    forum.reply(TID, &[100, 200, 100]);
    forum.clear_requests();

    let outcome = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert_eq!(
        outcome,
        CheckOutcome::NewPosts {
            saved: 3,
            eligible: 2,
            notified: 2,
        }
    );
    assert_eq!(forum.requested_pages(TID), vec![1, 3]);

    let pool = db.pool();
    assert_eq!(count_posts_for_thread(pool, TID).await.unwrap(), 44);
    assert_eq!(get_thread(pool, TID).await.unwrap().unwrap().total_posts, 44);

    let sent = recorder.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].title, format!("📬 Thread {TID}"));
    assert_eq!(sent[0].body, "user100: post 41 second line");
    assert_eq!(
        sent[0].url,
        format!(
            "https://bbs.example.com/read.php?tid={TID}&page=3#pid{}Anchor",
            pid_for(TID, 41)
        )
    );
    assert!(sent[1].url.ends_with(&format!("#pid{}Anchor", pid_for(TID, 43))));

    let events = get_events(pool, Some(TID), 10).await.unwrap();
    assert_eq!(events[0].event_type, "new_post");
    assert_eq!(events[0].post_count, 2);
}

#[tokio::test]
async fn test_recheck_is_idempotent() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 41, 300);
    let (engine, recorder) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    engine
        .subscribe(&settings(&[], &[300]), &cancel)
        .await
        .unwrap();
    forum.reply(TID, &[300]);

    let first = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert!(matches!(first, CheckOutcome::NewPosts { saved: 1, .. }));

    let second = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert_eq!(second, CheckOutcome::NoNewPosts);

    assert_eq!(count_posts_for_thread(db.pool(), TID).await.unwrap(), 42);
    assert_eq!(recorder.sent().len(), 1);

    let events = get_events(db.pool(), Some(TID), 1).await.unwrap();
    assert_eq!(events[0].event_type, "check");
    assert_eq!(events[0].message.as_deref(), Some("No new posts"));
}

#[tokio::test]
async fn test_no_notification_without_notify_list() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 10, 300);
    let (engine, recorder) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    engine.subscribe(&settings(&[], &[]), &cancel).await.unwrap();
    forum.reply(TID, &[300, 400]);

    let outcome = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert_eq!(
        outcome,
        CheckOutcome::NewPosts {
            saved: 2,
            eligible: 2,
            notified: 0,
        }
    );
    assert!(recorder.sent().is_empty());
}

#[tokio::test]
async fn test_filtered_out_posts_are_still_stored() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 10, 300);
    let (engine, _) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    engine
        .subscribe(&settings(&[100], &[100]), &cancel)
        .await
        .unwrap();
    forum.reply(TID, &[200]);

    let outcome = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert_eq!(
        outcome,
        CheckOutcome::NewPosts {
            saved: 1,
            eligible: 0,
            notified: 0,
        }
    );
    assert_eq!(count_posts_for_thread(db.pool(), TID).await.unwrap(), 11);

    let events = get_events(db.pool(), Some(TID), 1).await.unwrap();
    assert_eq!(events[0].event_type, "check");
    assert_eq!(
        events[0].message.as_deref(),
        Some("New posts found but none match filter")
    );
    assert_eq!(events[0].post_count, 1);
}

#[tokio::test]
async fn test_failed_page_is_retried_on_next_check() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 41, 300);
    let (engine, recorder) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    engine
        .subscribe(&settings(&[], &[100]), &cancel)
        .await
        .unwrap();
    forum.reply(TID, &[100, 100, 100]);
    forum.fail_page(TID, 3);

    let outcome = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert_eq!(
        outcome,
        CheckOutcome::Incomplete {
            saved: 0,
            eligible: 0,
            notified: 0,
            failed_page: 3,
        }
    );

    let pool = db.pool();
    assert_eq!(get_thread(pool, TID).await.unwrap().unwrap().total_posts, 41);
    let events = get_events(pool, Some(TID), 1).await.unwrap();
    assert_eq!(events[0].event_type, "error");
    assert!(events[0].message.as_deref().unwrap().contains("page 3"));

    forum.heal_page(TID, 3);
    let outcome = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert_eq!(
        outcome,
        CheckOutcome::NewPosts {
            saved: 3,
            eligible: 3,
            notified: 3,
        }
    );
    assert_eq!(count_posts_for_thread(pool, TID).await.unwrap(), 44);
    assert_eq!(get_thread(pool, TID).await.unwrap().unwrap().total_posts, 44);
    assert_eq!(recorder.sent().len(), 3);
}

#[tokio::test]
async fn test_failed_page_keeps_posts_before_it() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 30, 300);
    let (engine, recorder) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    engine
        .subscribe(&settings(&[], &[100]), &cancel)
        .await
        .unwrap();
    // Ten replies fill page 2, five more land on page 3
    forum.reply(TID, &[100; 15]);
    forum.fail_page(TID, 3);

    let outcome = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert!(matches!(
        outcome,
        CheckOutcome::Incomplete {
            saved: 10,
            failed_page: 3,
            ..
        }
    ));
    assert_eq!(get_thread(db.pool(), TID).await.unwrap().unwrap().total_posts, 40);

    forum.heal_page(TID, 3);
    forum.clear_requests();
    let outcome = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert!(matches!(outcome, CheckOutcome::NewPosts { saved: 5, .. }));
    assert_eq!(forum.requested_pages(TID), vec![1, 3]);
    assert_eq!(recorder.sent().len(), 15);
}

#[tokio::test]
async fn test_check_failure_records_error_event() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 10, 300);
    let (engine, _) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    engine.subscribe(&settings(&[], &[]), &cancel).await.unwrap();
    forum.fail_page(TID, 1);

    let outcome = engine.check_thread(TID, Utc::now(), &cancel).await;
    assert!(matches!(outcome, CheckOutcome::Failed(_)));

    let events = get_events(db.pool(), Some(TID), 1).await.unwrap();
    assert_eq!(events[0].event_type, "error");
    assert!(events[0].message.as_deref().unwrap().contains("500"));
}

#[tokio::test]
async fn test_check_unmonitored_thread_fails() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    let (engine, _) = engine(&db, &forum);

    let outcome = engine
        .check_thread(42, Utc::now(), &CancellationToken::new())
        .await;
    assert!(matches!(outcome, CheckOutcome::Failed(ref m) if m.contains("not monitored")));
    assert!(forum.requests().is_empty());
}

#[tokio::test]
async fn test_check_thread_without_stored_thread_fails() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 5, 300);
    let (engine, _) = engine(&db, &forum);

    // A subscription row whose thread row is missing
    let mut conn = db.pool().acquire().await.unwrap();
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&mut *conn)
        .await
        .unwrap();
    sqlx::query("INSERT INTO monitored_threads (tid) VALUES (?)")
        .bind(TID)
        .execute(&mut *conn)
        .await
        .unwrap();
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await
        .unwrap();
    drop(conn);

    let outcome = engine
        .check_thread(TID, Utc::now(), &CancellationToken::new())
        .await;
    assert!(matches!(outcome, CheckOutcome::Failed(ref m) if m.contains("not found in database")));
    assert!(forum.requests().is_empty());
}

#[tokio::test]
async fn test_stored_state_is_monotonic() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(TID, 19, 300);
    let (engine, _) = engine(&db, &forum);
    let cancel = CancellationToken::new();
    let pool = db.pool();

    engine.subscribe(&settings(&[], &[]), &cancel).await.unwrap();

    let mut last_max = get_max_post_number(pool, TID).await.unwrap();
    let mut last_checked = get_subscription(pool, TID).await.unwrap().unwrap().last_checked;

    for round in 0..3 {
        forum.reply(TID, &[300; 7]);
        engine
            .check_thread(TID, Utc::now() + chrono::Duration::seconds(round + 1), &cancel)
            .await;

        let max = get_max_post_number(pool, TID).await.unwrap();
        let checked = get_subscription(pool, TID).await.unwrap().unwrap().last_checked;
        assert!(max > last_max);
        assert!(checked >= last_checked);
        last_max = max;
        last_checked = checked;
    }

    assert_eq!(last_max, Some(19 + 21 - 1));
}

#[tokio::test]
async fn test_sync_subscriptions_summary() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(1, 5, 300);
    forum.add_thread(2, 5, 300);
    forum.add_thread(3, 5, 300);
    let (engine, _) = engine(&db, &forum);
    let cancel = CancellationToken::new();

    let first = engine
        .sync_subscriptions(&[entry(1), entry(2)], &cancel)
        .await;
    assert_eq!(first.added, 2);
    assert_eq!(first.errors, 0);

    let disabled = ThreadEntry {
        enabled: false,
        ..entry(2)
    };
    let second = engine
        .sync_subscriptions(&[entry(1), disabled, entry(3), entry(404)], &cancel)
        .await;
    assert_eq!(second.updated, 1);
    assert_eq!(second.removed, 1);
    assert_eq!(second.added, 1);
    assert_eq!(second.errors, 1);

    let pool = db.pool();
    assert!(!get_subscription(pool, 2).await.unwrap().unwrap().is_active);
    assert!(get_subscription(pool, 3).await.unwrap().unwrap().is_active);
    // Posts of a deactivated thread are kept
    assert_eq!(count_posts_for_thread(pool, 2).await.unwrap(), 5);

    let events = get_events(pool, Some(404), 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "error");
}

#[tokio::test]
async fn test_sync_stops_when_cancelled() {
    let (db, _temp_dir) = setup_db().await;
    let forum = FakeForum::new();
    forum.add_thread(1, 5, 300);
    let (engine, _) = engine(&db, &forum);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = engine.sync_subscriptions(&[entry(1)], &cancel).await;

    assert_eq!(summary.added, 0);
    assert!(forum.requests().is_empty());
}
