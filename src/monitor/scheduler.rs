//! Periodic driver that checks due subscriptions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::schedule::is_due;
use super::sync::{CheckOutcome, SyncEngine};
use crate::config::Config;
use crate::db;

/// Counters for one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub active: usize,
    pub due: usize,
    pub checked: usize,
    pub failed: usize,
}

pub struct PollScheduler {
    engine: Arc<SyncEngine>,
    evaluate_interval: Duration,
    inter_check_delay: Duration,
    running: Arc<AtomicBool>,
}

impl PollScheduler {
    #[must_use]
    pub fn new(
        engine: Arc<SyncEngine>,
        evaluate_interval: Duration,
        inter_check_delay: Duration,
    ) -> Self {
        Self {
            engine,
            evaluate_interval,
            inter_check_delay,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn from_config(engine: Arc<SyncEngine>, config: &Config) -> Self {
        Self::new(engine, config.check_all_interval, config.inter_check_delay)
    }

    /// Shared flag that is true while [`run`](Self::run) is looping.
    #[must_use]
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Evaluate subscriptions every `evaluate_interval` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            evaluate_secs = self.evaluate_interval.as_secs(),
            inter_check_ms = self.inter_check_delay.as_millis() as u64,
            "Starting poll scheduler"
        );
        self.running.store(true, Ordering::SeqCst);

        let mut interval = tokio::time::interval(self.evaluate_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_cycle(&cancel).await {
                        Ok(report) if report.due > 0 => {
                            info!(
                                due = report.due,
                                checked = report.checked,
                                failed = report.failed,
                                "Check cycle finished"
                            );
                        }
                        Ok(_) => debug!("No threads due"),
                        Err(e) => error!("Check cycle failed: {e:#}"),
                    }
                }
                () = cancel.cancelled() => {
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Poll scheduler stopped");
    }

    /// Check every subscription that is due now, one at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if the active subscriptions cannot be listed.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let subs = db::list_active_subscriptions(self.engine.db().pool()).await?;
        let default_interval = self.engine.options().default_check_interval;
        let now = Utc::now();

        let due: Vec<i64> = subs
            .iter()
            .filter(|s| is_due(s, now, default_interval))
            .map(|s| s.tid)
            .collect();

        let mut report = self.check_sequentially(&due, cancel).await;
        report.active = subs.len();
        Ok(report)
    }

    /// Check every active subscription once, ignoring intervals.
    ///
    /// # Errors
    ///
    /// Returns an error if the active subscriptions cannot be listed.
    pub async fn check_all(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let subs = db::list_active_subscriptions(self.engine.db().pool()).await?;
        let tids: Vec<i64> = subs.iter().map(|s| s.tid).collect();

        let mut report = self.check_sequentially(&tids, cancel).await;
        report.active = subs.len();
        Ok(report)
    }

    async fn check_sequentially(&self, tids: &[i64], cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport {
            due: tids.len(),
            ..CycleReport::default()
        };

        for (i, &tid) in tids.iter().enumerate() {
            if i > 0 && !self.inter_check_delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(self.inter_check_delay) => {}
                    () = cancel.cancelled() => break,
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let outcome = self.engine.check_thread(tid, Utc::now(), cancel).await;
            report.checked += 1;
            if matches!(
                outcome,
                CheckOutcome::Failed(_) | CheckOutcome::Incomplete { .. }
            ) {
                report.failed += 1;
            }
        }

        report
    }
}
