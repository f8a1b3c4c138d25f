//! Subscription sync and the polling loop that drives it.

pub mod schedule;
pub mod scheduler;
pub mod sync;

pub use schedule::{effective_interval, is_due, CheckWindow};
pub use scheduler::{CycleReport, PollScheduler};
pub use sync::{
    first_unseen_page, settings_from_entry, BootstrapReport, CheckOutcome, ReconcileOutcome,
    SyncEngine, SyncOptions, SyncSummary,
};
