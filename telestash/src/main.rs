//! telestash - CLI for inspecting and driving a telemetry buffer
//!
//! This tool provides commands for:
//! - Checking the queue, identity and health counters
//! - Recording events, flushing them and draining the queue
//! - Changing the device ID
//! - Running the background flush timer and dispatcher until Ctrl+C
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/telestash/store.db (~/.local/share/telestash/store.db)
//! - Config: $XDG_CONFIG_HOME/telestash/config.toml (~/.config/telestash/config.toml)
//! - Logs: $XDG_STATE_HOME/telestash/telestash.log

mod process_lock;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use telestash_core::health::HealthCounter;
use telestash_core::identity::{TYPE_KEY, VALUE_KEY};
use telestash_core::{
    Blocked, Config, CrashReport, Database, DeviceIdType, DrainReport, Event, IdentityChange,
    KeyValueStore, QueueStore, SegmentValue, Telemetry,
};

use crate::process_lock::{acquire_store_lock, StoreLock};

const SESSION_UPDATE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "telestash")]
#[command(about = "Inspect and drive an offline-first telemetry buffer")]
#[command(version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/telestash/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show identity, queue sizes and health counters
    Status,

    /// List queued requests, oldest first
    Requests {
        /// Show at most this many requests
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Buffer one event
    Record {
        /// Event key
        key: String,

        /// Occurrence count
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Summed value
        #[arg(long, default_value_t = 0.0)]
        sum: f64,

        /// Duration in seconds
        #[arg(long, default_value_t = 0.0)]
        dur: f64,

        /// Segmentation as key=value (repeatable)
        #[arg(short, long = "seg", value_parser = parse_segment)]
        segments: Vec<(String, SegmentValue)>,
    },

    /// Move buffered events onto the request queue
    Flush,

    /// Send queued requests until the queue is empty or the head fails
    Drain,

    /// Change the device ID
    ChangeId {
        /// New developer supplied device ID
        #[arg(required_unless_present = "generate")]
        id: Option<String>,

        /// Ask the server to merge the old ID's data into the new one
        #[arg(long)]
        merge: bool,

        /// Generate a fresh device ID instead
        #[arg(long, conflicts_with_all = ["id", "merge"])]
        generate: bool,
    },

    /// Switch to the temporary device ID
    TempMode,

    /// Queue a health check request if any counter is set
    Health,

    /// Queue a crash report
    Crash {
        /// Error description or stack trace
        error: String,

        /// The application recovered from the error
        #[arg(long)]
        nonfatal: bool,

        /// Log line leading up to the crash (repeatable)
        #[arg(short, long = "log")]
        logs: Vec<String>,
    },

    /// Drop every queued request and buffered event
    Clear,

    /// Run a session with the flush timer and dispatcher until Ctrl+C
    Run,
}

fn parse_segment(raw: &str) -> std::result::Result<(String, SegmentValue), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => {
            Ok((key.to_string(), SegmentValue::parse_literal(value)))
        }
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    let _log_guard =
        telestash_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("telestash starting up");

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Requests { limit } => cmd_requests(&config, limit),
        Command::Clear => cmd_clear(&config),
        Command::Record {
            key,
            count,
            sum,
            dur,
            segments,
        } => {
            let (_lock, telemetry) = open_telemetry(config)?;
            cmd_record(&telemetry, key, count, sum, dur, segments)
        }
        Command::Flush => {
            let (_lock, telemetry) = open_telemetry(config)?;
            match telemetry.flush() {
                Some(_) => println!("Flushed events into 1 request"),
                None => println!("No buffered events"),
            }
            Ok(())
        }
        Command::Drain => {
            let (_lock, telemetry) = open_telemetry(config)?;
            print_drain_report(&telemetry.drain().await);
            Ok(())
        }
        Command::ChangeId {
            id,
            merge,
            generate,
        } => {
            let (_lock, telemetry) = open_telemetry(config)?;
            cmd_change_id(&telemetry, id, merge, generate)
        }
        Command::TempMode => {
            let (_lock, telemetry) = open_telemetry(config)?;
            print_identity_change(&telemetry.enter_temporary_id_mode());
            Ok(())
        }
        Command::Health => {
            let (_lock, telemetry) = open_telemetry(config)?;
            match telemetry.queue_health_check() {
                Some(_) => println!("Queued health check"),
                None => println!("Nothing to report"),
            }
            Ok(())
        }
        Command::Crash {
            error,
            nonfatal,
            logs,
        } => {
            let (_lock, telemetry) = open_telemetry(config)?;
            let mut report = if nonfatal {
                CrashReport::nonfatal(error)
            } else {
                CrashReport::new(error)
            };
            for line in logs {
                report = report.breadcrumb(line);
            }
            telemetry.record_crash(&report)?;
            println!(
                "Queued crash report ({} queued)",
                telemetry.queue().request_count()
            );
            Ok(())
        }
        Command::Run => {
            let (_lock, telemetry) = open_telemetry(config)?;
            cmd_run(&telemetry).await
        }
    }
}

/// Lock the store for this process and open it for delivery
fn open_telemetry(config: Config) -> Result<(StoreLock, Telemetry)> {
    let lock = acquire_store_lock(&Config::store_path())?;
    let telemetry = Telemetry::open(config).context("failed to open telemetry store")?;
    Ok((lock, telemetry))
}

fn cmd_record(
    telemetry: &Telemetry,
    key: String,
    count: u32,
    sum: f64,
    dur: f64,
    segments: Vec<(String, SegmentValue)>,
) -> Result<()> {
    let mut builder = Event::builder(&key).count(count).sum(sum).duration(dur);
    for (name, value) in segments {
        builder = builder.segment(name, value);
    }
    let event = builder.build().context("invalid event")?;
    telemetry.record_event(event);
    println!(
        "Recorded '{}' ({} buffered, {} queued)",
        key,
        telemetry.queue().event_count(),
        telemetry.queue().request_count()
    );
    Ok(())
}

fn cmd_change_id(
    telemetry: &Telemetry,
    id: Option<String>,
    merge: bool,
    generate: bool,
) -> Result<()> {
    let change = if generate {
        telemetry.change_device_id_without_merge(DeviceIdType::SdkGenerated, None)?
    } else {
        let id = id.context("a device ID is required")?;
        if merge {
            telemetry.change_device_id_with_merge(&id)?
        } else {
            telemetry.change_device_id_without_merge(DeviceIdType::DeveloperSupplied, Some(&id))?
        }
    };
    print_identity_change(&change);
    println!("Device ID:       {}", telemetry.device_id());
    Ok(())
}

fn open_store(config: &Config) -> Result<(Arc<Database>, QueueStore)> {
    let path = Config::store_path();
    let db = Database::open(&path)
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    db.migrate().context("failed to run store migrations")?;
    let db = Arc::new(db);
    let queue = QueueStore::open(db.clone(), &config.queue).context("failed to load queue")?;
    Ok((db, queue))
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("telestash status");
    println!("================");
    println!();

    let server = &config.server;
    println!(
        "Server URL:      {}",
        server.url.as_deref().unwrap_or("<not set>")
    );
    println!(
        "App Key:         {}",
        if server.app_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!(
        "Checksum:        {}",
        if server.salt.is_some() { "on" } else { "off" }
    );

    let (db, queue) = open_store(config)?;

    println!();
    let device_id = db.get(VALUE_KEY)?;
    let device_id_type = db.get(TYPE_KEY)?;
    println!(
        "Device ID:       {}",
        device_id.as_deref().unwrap_or("<not assigned>")
    );
    println!(
        "Device ID Type:  {}",
        device_id_type.as_deref().unwrap_or("-")
    );

    println!();
    println!(
        "Queued:          {} / {}",
        queue.request_count(),
        queue.max_request_queue_size()
    );
    println!("Buffered:        {}", queue.event_count());
    println!("Cleanup:         {:?}", queue.cleanup_policy());
    println!("Tracking:        {}", queue.tracking_enabled());

    let keys = db.keys()?;
    if !keys.is_empty() {
        println!();
        println!("Stored keys:");
        for info in keys {
            let updated = info
                .updated_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("  {:<16} {:>8} bytes  {}", info.key, info.size_bytes, updated);
        }
    }

    let health = HealthCounter::open(db)?.snapshot();
    println!();
    println!("Warnings:        {}", health.warnings);
    println!("Errors:          {}", health.errors);
    if health.status_code >= 0 || !health.error_message.is_empty() {
        println!("Last Failure:    {} {}", health.status_code, health.error_message);
    }

    println!();
    if server.is_ready() {
        println!("Status: Ready to deliver");
    } else {
        println!("Status: Not ready (missing server configuration)");
    }
    Ok(())
}

fn cmd_requests(config: &Config, limit: Option<usize>) -> Result<()> {
    let (_db, queue) = open_store(config)?;
    let requests = queue.requests();
    if requests.is_empty() {
        println!("No queued requests");
        return Ok(());
    }

    let shown = limit.unwrap_or(requests.len()).min(requests.len());
    for (i, request) in requests.iter().take(shown).enumerate() {
        println!("{:>4}  {}", i, request);
    }
    if shown < requests.len() {
        println!("... {} more", requests.len() - shown);
    }
    Ok(())
}

fn cmd_clear(config: &Config) -> Result<()> {
    let _store_lock = acquire_store_lock(&Config::store_path())?;
    let (_db, queue) = open_store(config)?;
    let requests = queue.request_count();
    let events = queue.event_count();
    queue.clear().context("failed to clear queue")?;
    println!("Cleared {} requests and {} events", requests, events);
    Ok(())
}

async fn cmd_run(telemetry: &Telemetry) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        let _ = tx.send(());
    })
    .context("failed to set Ctrl+C handler")?;

    telemetry.start().context("failed to start background workers")?;
    telemetry.begin_session();
    println!(
        "Running (device ID {}, {} queued). Press Ctrl+C to stop.",
        telemetry.device_id(),
        telemetry.queue().request_count()
    );

    let mut ticker = tokio::time::interval(SESSION_UPDATE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                telemetry.update_session();
            }
            _ = rx.recv() => break,
        }
    }

    if let Some(secs) = telemetry.end_session() {
        println!("Session ended after {secs}s");
    }
    telemetry.stop().await;

    println!("Stopped ({} queued)", telemetry.queue().request_count());
    Ok(())
}

fn print_drain_report(report: &DrainReport) {
    println!("Delivered:       {}", report.delivered);
    println!("Dropped:         {}", report.dropped);
    println!("Remaining:       {}", report.remaining);
    match &report.blocked {
        None => {}
        Some(Blocked::TemporaryId) => {
            println!("Blocked:         head request uses the temporary device ID")
        }
        Some(Blocked::Retry {
            status,
            retry_after,
        }) => println!(
            "Blocked:         delivery failed (status {}), retry in {:?}",
            status.map_or_else(|| "none".to_string(), |s| s.to_string()),
            retry_after
        ),
        Some(Blocked::Stopped) => println!("Blocked:         stopped"),
    }
}

fn print_identity_change(change: &IdentityChange) {
    match change {
        IdentityChange::Unchanged => println!("Device ID unchanged"),
        IdentityChange::Switched => println!("Device ID changed"),
        IdentityChange::EnteredTemporary => println!("Entered temporary ID mode"),
        IdentityChange::ExitedTemporary { rewritten } => println!(
            "Left temporary ID mode ({} queued requests rewritten)",
            rewritten
        ),
        IdentityChange::Merged => println!("Device ID changed, merge request queued"),
    }
}
