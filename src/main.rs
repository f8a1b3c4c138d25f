use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nga_reminder::config::{load_thread_entries, Config, ThreadEntry};
use nga_reminder::crawler::{PageFetcher, Passport};
use nga_reminder::db::{self, Database, SubscriptionSettings};
use nga_reminder::monitor::{PollScheduler, SyncEngine, SyncOptions};
use nga_reminder::notify::NotificationDispatcher;
use nga_reminder::web::{self, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "nga-reminder",
    version,
    about = "Watch NGA threads for new posts and push notifications"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync the threads file, then poll and serve the API until stopped (default)
    Serve,
    /// Reconcile the threads file against the database once
    Sync,
    /// Check monitored threads for new posts once
    Check {
        /// Only check this thread
        #[arg(long)]
        tid: Option<i64>,
    },
    /// Crawl a thread and start monitoring it
    Add {
        #[arg(long)]
        tid: i64,
        /// Only count posts by these author uids (comma separated)
        #[arg(long, value_delimiter = ',')]
        authors: Vec<i64>,
        /// Push notifications for posts by these author uids (comma separated)
        #[arg(long, value_delimiter = ',')]
        notify: Vec<i64>,
        /// Check interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Stop monitoring a thread (stored posts are kept)
    Remove {
        #[arg(long)]
        tid: i64,
    },
    /// List monitored threads
    List,
    /// Show recent monitoring events
    Events {
        #[arg(long)]
        tid: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, db).await,
        Command::Sync => {
            let app = App::new(&config, db)?;
            let entries = read_entries(&config.threads_file)?;
            let cancel = cancel_on_signal();
            let summary = app.engine.sync_subscriptions(&entries, &cancel).await;
            println!(
                "added {}, updated {}, removed {}, skipped {}, errors {}",
                summary.added, summary.updated, summary.removed, summary.skipped, summary.errors
            );
            Ok(())
        }
        Command::Check { tid } => {
            let app = App::new(&config, db)?;
            let cancel = cancel_on_signal();
            if let Some(tid) = tid {
                let outcome = app.engine.check_thread(tid, Utc::now(), &cancel).await;
                println!("{tid}: {outcome:?}");
            } else {
                let scheduler = PollScheduler::from_config(app.engine.clone(), &config);
                let report = scheduler.check_all(&cancel).await?;
                println!(
                    "checked {} of {} threads, {} failed",
                    report.checked, report.active, report.failed
                );
            }
            Ok(())
        }
        Command::Add {
            tid,
            authors,
            notify,
            interval,
        } => {
            let app = App::new(&config, db)?;
            let settings = SubscriptionSettings {
                tid,
                author_filter: authors,
                author_notification: notify,
                check_interval: interval
                    .filter(|i| *i > 0)
                    .unwrap_or(config.default_check_interval),
                check_schedule: Vec::new(),
            };
            let cancel = cancel_on_signal();
            let report = app.engine.subscribe(&settings, &cancel).await?;
            println!(
                "thread {tid}: {} posts over {} pages ({} failed, {} pending{})",
                report.posts_saved,
                report.total_pages,
                report.pages_failed,
                report.pages_pending,
                if report.cancelled { ", cancelled" } else { "" }
            );
            Ok(())
        }
        Command::Remove { tid } => {
            if db::deactivate_subscription(db.pool(), tid).await? {
                println!("thread {tid} is no longer monitored");
            } else {
                println!("thread {tid} was not monitored");
            }
            Ok(())
        }
        Command::List => {
            for thread in db::list_monitored_threads(db.pool()).await? {
                let sub = &thread.subscription;
                println!(
                    "{}\t{}\t{} posts\tevery {}s\tlast checked {}",
                    sub.tid,
                    thread.title,
                    thread.total_posts,
                    sub.check_interval,
                    sub.last_checked.as_deref().unwrap_or("never")
                );
            }
            Ok(())
        }
        Command::Events { tid, limit } => {
            for event in db::get_events(db.pool(), tid, limit.max(1)).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    event.created_at,
                    event.tid,
                    event.event_type,
                    event.post_count,
                    event.message.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
    }
}

/// Wiring shared by the commands that talk to the forum.
struct App {
    passport: Passport,
    engine: Arc<SyncEngine>,
}

impl App {
    fn new(config: &Config, db: Database) -> Result<Self> {
        let passport = Passport::new(&config.passport_uid, &config.passport_cid);
        let fetcher = PageFetcher::new(config, passport.clone())?;
        let dispatcher = NotificationDispatcher::from_config(config)
            .context("Failed to set up notifications")?;

        let engine = SyncEngine::new(
            db,
            Arc::new(fetcher),
            config.max_workers,
            Arc::new(dispatcher),
            SyncOptions::from_config(config),
        );

        Ok(Self {
            passport,
            engine: Arc::new(engine),
        })
    }
}

async fn serve(config: Config, db: Database) -> Result<()> {
    info!(
        api_url = %config.api_url,
        rate_limit = config.rate_limit_per_minute,
        workers = config.max_workers,
        "Starting nga-reminder"
    );

    let app = App::new(&config, db.clone())?;
    let entries = read_entries(&config.threads_file)?;
    let scheduler = PollScheduler::from_config(app.engine.clone(), &config);
    let shutdown = CancellationToken::new();

    let state = AppState {
        db: db.clone(),
        config: Arc::new(config.clone()),
        passport: app.passport.clone(),
        monitor_running: scheduler.running_flag(),
    };

    let monitor_token = shutdown.clone();
    let engine = app.engine.clone();
    let monitor_handle = tokio::spawn(async move {
        engine.sync_subscriptions(&entries, &monitor_token).await;
        if !monitor_token.is_cancelled() {
            scheduler.run(monitor_token).await;
        }
    });

    let mut web_handle = tokio::spawn(web::serve(state, shutdown.clone()));

    tokio::select! {
        () = shutdown_signal() => info!("Shutting down..."),
        result = &mut web_handle => {
            match result {
                Ok(Ok(())) => warn!("Web server exited"),
                Ok(Err(e)) => error!("Web server error: {e:#}"),
                Err(e) => error!("Web server task failed: {e}"),
            }
        }
    }

    shutdown.cancel();

    let abort = monitor_handle.abort_handle();
    if tokio::time::timeout(config.shutdown_grace, monitor_handle)
        .await
        .is_err()
    {
        warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            "Monitor did not stop in time, aborting"
        );
        abort.abort();
    }

    if !web_handle.is_finished() {
        let _ = web_handle.await;
    }

    db.close().await;
    info!("Shutdown complete");
    Ok(())
}

fn read_entries(path: &Path) -> Result<Vec<ThreadEntry>> {
    if !path.exists() {
        warn!(path = %path.display(), "Threads file not found, nothing to sync");
        return Ok(Vec::new());
    }
    let entries = load_thread_entries(path)?;
    info!(path = %path.display(), threads = entries.len(), "Loaded threads file");
    Ok(entries)
}

/// Token that is cancelled on Ctrl+C or SIGTERM.
fn cancel_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Stopping after the current page...");
        child.cancel();
    });
    token
}

fn init_tracing() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,nga_reminder=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
