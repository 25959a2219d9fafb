//! cellgroup - command-line front-end for the offline sync queue.
//!
//! Inspects and drives the same on-device queue the app uses: list what is
//! waiting to sync, force a drain, retry or discard failed changes, and run
//! the connectivity monitor with the sync loop until interrupted.

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cellgroup_core::cache::format_last_sync;
use cellgroup_core::models::AttendanceRecord;
use cellgroup_core::operation::{EVENTS, MEMBERS};
use cellgroup_core::utils::truncate_string;
use cellgroup_core::{
    cache_key, Config, ConnectivityMonitor, DrainOutcome, FileStore, HttpProbe, KeyValueStore,
    Operation, OperationQueue, QueuedOperation, ReachabilityProbe, ReadThroughCache, RestRemote,
    SubmitOutcome, SyncEngine, SyncStatus,
};

// ============================================================================
// Constants
// ============================================================================

/// Log file name prefix inside the data directory
const LOG_FILE_PREFIX: &str = "cellgroup.log";

/// Width of the error column in listings
const ERROR_COLUMN_WIDTH: usize = 48;

const USAGE: &str = "\
Usage: cellgroup <command> [--json]

Commands:
  status                          Show sync state and queue counts
  pending                         List changes waiting to sync
  failed                          List changes that gave up
  sync                            Send waiting changes now
  clear-failed                    Discard every failed change
  retry-failed                    Give failed changes another set of attempts
  members                         List members (cached when offline)
  events                          List events (cached when offline)
  attend <event> <date> [ids..]   Record attendance for an event
  watch                           Sync whenever the network returns, until Ctrl-C
  help                            Show this message";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr (filtered by RUST_LOG, default `warn`) and to a daily
/// rolling file in the data directory. The returned guard flushes the file
/// writer on drop.
fn init_tracing(log_dir: &Path) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer().with_writer(io::stderr);

    if std::fs::create_dir_all(log_dir).is_err() {
        tracing_subscriber::registry().with(stderr).with(filter).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(stderr)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
    Some(guard)
}

/// Everything a command needs, wired from the configuration.
struct App {
    config: Config,
    monitor: Arc<ConnectivityMonitor>,
    probe: Arc<dyn ReachabilityProbe>,
    remote: RestRemote,
    cache: Arc<ReadThroughCache>,
    engine: Arc<SyncEngine<RestRemote>>,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let data_dir = config.data_dir()?;
        let store: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::open(&data_dir)
                .with_context(|| format!("Failed to open data directory: {}", data_dir.display()))?,
        );

        let settings = &config.sync;
        let remote =
            RestRemote::with_timeout(config.backend_url()?, config.api_key()?, settings.request_timeout())?;
        let probe: Arc<dyn ReachabilityProbe> =
            Arc::new(HttpProbe::new(&config.health_url()?, settings.request_timeout())?);

        let monitor = Arc::new(ConnectivityMonitor::default());
        let cache = Arc::new(
            ReadThroughCache::new(Arc::clone(&store), Arc::clone(&monitor))
                .with_stale_after_minutes(settings.cache_stale_minutes),
        );
        let queue = OperationQueue::open(store).context("Failed to load the sync queue")?;
        let engine = Arc::new(
            SyncEngine::new(remote.clone(), queue, Arc::clone(&monitor), settings.to_options())
                .with_cache(Arc::clone(&cache)),
        );

        Ok(Self {
            config,
            monitor,
            probe,
            remote,
            cache,
            engine,
        })
    }

    /// Probe once so commands start from the real network state.
    async fn check_connectivity(&self) {
        let result = self.probe.check().await;
        self.monitor.observe(result);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let json = args.iter().any(|a| a == "--json");
    let args: Vec<&str> = args.iter().map(String::as_str).filter(|a| *a != "--json").collect();

    let command = args.first().copied().unwrap_or("status");
    if matches!(command, "help" | "-h" | "--help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let _log_guard = init_tracing(&config.data_dir()?);
    info!(command, "cellgroup starting");

    let app = App::open(config)?;

    match command {
        "status" => cmd_status(&app, json),
        "pending" => {
            print_entries(&app.engine.list_pending(), json, "Nothing waiting to sync.")
        }
        "failed" => print_entries(&app.engine.list_failed(), json, "No failed changes."),
        "sync" => cmd_sync(&app).await,
        "clear-failed" => {
            let cleared = app.engine.clear_failed_operations()?;
            println!("Discarded {} failed change(s).", cleared);
            Ok(())
        }
        "retry-failed" => {
            let requeued = app.engine.requeue_failed_operations()?;
            println!("{} change(s) will be retried on the next sync.", requeued);
            Ok(())
        }
        "members" => cmd_members(&app, json).await,
        "events" => cmd_events(&app, json).await,
        "attend" => cmd_attend(&app, &args[1..]).await,
        "watch" => cmd_watch(&app).await,
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn cmd_status(app: &App, json: bool) -> Result<()> {
    let status = app.engine.status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_status(status: &SyncStatus) {
    println!("State:      {}", status.state);
    if let Some(message) = &status.message {
        println!("Message:    {}", message);
    }
    println!("Pending:    {}", status.pending_count);
    println!("Failed:     {}", status.failed_count);
    println!("Last sync:  {}", format_last_sync(status.last_sync));
}

fn print_entries(entries: &[QueuedOperation], json: bool, empty: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("{}", empty);
        return Ok(());
    }

    println!("{:<6} {:<20} {:<9} {:<12} {}", "ID", "CHANGE", "ATTEMPTS", "QUEUED", "LAST ERROR");
    for entry in entries {
        let queued = format_last_sync(Some(entry.created_at));
        let error = entry
            .last_error
            .as_deref()
            .map(|e| truncate_string(e, ERROR_COLUMN_WIDTH))
            .unwrap_or_default();
        println!(
            "{:<6} {:<20} {:<9} {:<12} {}",
            entry.id,
            entry.kind().to_string(),
            entry.attempts,
            queued,
            error
        );
    }
    Ok(())
}

async fn cmd_sync(app: &App) -> Result<()> {
    app.check_connectivity().await;

    match app.engine.force_sync().await? {
        DrainOutcome::Offline => println!("Offline; changes will sync when the connection returns."),
        DrainOutcome::Empty => println!("Nothing to sync."),
        DrainOutcome::AlreadyRunning => println!("A sync is already running."),
        DrainOutcome::Completed(_) => print_status(&app.engine.status()),
    }
    Ok(())
}

async fn cmd_members(app: &App, json: bool) -> Result<()> {
    let cell_id = app.config.cell_id()?;
    app.check_connectivity().await;

    let key = cache_key(MEMBERS, cell_id);
    let read = app
        .cache
        .write_through(&key, || app.remote.fetch_members(cell_id))
        .await?;

    let Some(read) = read else {
        println!("No members cached yet; connect once to download them.");
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&read.data)?);
        return Ok(());
    }

    let age = read.age_display();
    let mut members = read.data;
    members.sort_by_key(|m| m.display_name().to_lowercase());
    for member in &members {
        println!("{:<32} {}", member.display_name(), member.role);
    }
    let freshness = if read.stale { " (may be out of date)" } else { "" };
    println!("\n{} member(s), updated {}{}", members.len(), age, freshness);
    Ok(())
}

async fn cmd_events(app: &App, json: bool) -> Result<()> {
    let cell_id = app.config.cell_id()?;
    app.check_connectivity().await;

    let key = cache_key(EVENTS, cell_id);
    let read = app
        .cache
        .write_through(&key, || app.remote.fetch_events(cell_id))
        .await?;

    let Some(read) = read else {
        println!("No events cached yet; connect once to download them.");
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&read.data)?);
        return Ok(());
    }

    let age = read.age_display();
    let mut events = read.data;
    events.sort_by(|a, b| a.starts_at.cmp(&b.starts_at));
    for event in &events {
        println!(
            "{:<14} {:<32} {}",
            event.formatted_date(),
            truncate_string(&event.title, 32),
            event.location.as_deref().unwrap_or("")
        );
    }
    let freshness = if read.stale { " (may be out of date)" } else { "" };
    println!("\n{} event(s), updated {}{}", events.len(), age, freshness);
    Ok(())
}

async fn cmd_attend(app: &App, args: &[&str]) -> Result<()> {
    let (event_id, date, present) = match args {
        [event_id, date, present @ ..] => (*event_id, *date, present),
        _ => anyhow::bail!("Usage: cellgroup attend <event> <date> [member ids..]"),
    };
    app.check_connectivity().await;

    let record = AttendanceRecord {
        event_id: event_id.to_string(),
        cell_id: app.config.cell_id()?.to_string(),
        date: date.to_string(),
        present_member_ids: present.iter().map(|id| id.to_string()).collect(),
        visitor_count: 0,
        notes: None,
    };
    let headcount = record.headcount();

    match app.engine.submit(Operation::SaveAttendance(record)).await? {
        SubmitOutcome::Applied => println!("Attendance saved ({} present).", headcount),
        SubmitOutcome::Queued(entry) => println!(
            "Attendance saved on this device ({} present); it will sync later (#{}).",
            headcount, entry.id
        ),
    }
    Ok(())
}

async fn cmd_watch(app: &App) -> Result<()> {
    let _status = app.engine.subscribe(|status| {
        let message = status.message.as_deref().unwrap_or("");
        println!("[{}] pending {} failed {} {}", status.state, status.pending_count, status.failed_count, message);
    });
    let _connectivity = app.monitor.subscribe(|state| {
        println!("{}", if state.online { "Online" } else { "Offline" });
    });

    let drain_loop = app.engine.start();
    let polling = app
        .monitor
        .spawn_polling(Arc::clone(&app.probe), app.config.sync.poll_interval());

    println!("Watching for connectivity changes; press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;

    polling.abort();
    drain_loop.abort();
    info!("cellgroup watch stopped");
    Ok(())
}
