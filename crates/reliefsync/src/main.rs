//! `reliefsync` - CLI for the offline sync layer
//!
//! This binary inspects and drives the local queue and record cache, and can
//! stay running to sync whenever connectivity returns.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::Value;
use tokio::time::Instant;

use reliefsync::cli::{CacheCommand, Cli, Command, ConfigCommand, QueueCommand};
use reliefsync::worker::UpdateHandler;
use reliefsync::{
    init_logging, Config, HttpApi, Indicator, LocalStore, SyncOutcome, SyncQueue, SyncSession,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    match cli.command {
        Command::Status(status_cmd) => handle_status(&config, status_cmd.json).await,
        Command::Sync => handle_sync(&config).await,
        Command::Watch(watch_cmd) => handle_watch(&config, watch_cmd.accept_updates).await,
        Command::Queue(queue_cmd) => handle_queue(&config, queue_cmd).await,
        Command::Cache(cache_cmd) => handle_cache(&config, cache_cmd).await,
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
    }
}

/// Open the queue without probing the network or starting a worker.
fn open_queue(config: &Config) -> anyhow::Result<SyncQueue> {
    let store = LocalStore::open(config.database_path())?;
    let api = HttpApi::from_config(&config.api)?;
    Ok(SyncQueue::new(Arc::new(store), Arc::new(api)))
}

async fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let session = SyncSession::start(config).await?;
    let state = session.orchestrator().state();
    let stats = session.orchestrator().queue().store().stats()?;
    let worker = session.worker().is_some();

    if json {
        let status = serde_json::json!({
            "state": state,
            "database_path": config.database_path(),
            "cached_records": stats.records,
            "cached_secondary": stats.secondary,
            "db_size_bytes": stats.db_size_bytes,
            "read_failures": stats.read_failures,
            "worker_registered": worker,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("reliefsync status");
        println!("-----------------");
        println!("API:           {}", config.api.base_url);
        println!(
            "Network:       {}",
            if state.is_online { "online" } else { "offline" }
        );
        println!("Sync:          {}", state.sync_status);
        println!("Pending:       {}", state.pending_count);
        println!("Cached:        {} records, {} secondary", stats.records, stats.secondary);
        println!("Database:      {}", config.database_path().display());
        println!("Read failures: {}", stats.read_failures);
        println!(
            "Worker:        {}",
            if worker { "registered" } else { "not registered" }
        );
        if let Some(indicator) = Indicator::from_state(&state) {
            println!();
            println!("{}", notice(&indicator));
        }
    }

    session.shutdown().await?;
    Ok(())
}

fn print_outcome(outcome: &SyncOutcome) -> anyhow::Result<()> {
    match outcome {
        SyncOutcome::Skipped(reason) => {
            println!("Sync skipped ({reason:?}).");
        }
        SyncOutcome::Completed(report) if report.coalesced => {
            println!(
                "Joined a sync already in progress; {} pending.",
                report.remaining
            );
        }
        SyncOutcome::Completed(report) => {
            println!(
                "Synced {} of {} mutations; {} pending.",
                report.replayed, report.attempted, report.remaining
            );
        }
        SyncOutcome::Failed(message) => bail!("sync failed: {message}"),
    }
    Ok(())
}

async fn handle_sync(config: &Config) -> anyhow::Result<()> {
    let session = SyncSession::start(config).await?;
    let outcome = session.sync_now().await;
    session.shutdown().await?;
    print_outcome(&outcome)
}

/// Applies worker updates from the terminal.
#[derive(Debug)]
struct ConsoleUpdateHandler {
    accept: bool,
}

impl UpdateHandler for ConsoleUpdateHandler {
    fn confirm_update(&self, version: &str) -> bool {
        if self.accept {
            println!("New version {version} available; activating.");
        } else {
            println!("New version {version} available; restart with --accept-updates to apply.");
        }
        self.accept
    }

    fn reload(&self) {
        println!("Now running the new worker version.");
    }
}

async fn handle_watch(config: &Config, accept_updates: bool) -> anyhow::Result<()> {
    let mut session = SyncSession::start(config).await?;
    let updates = session.worker().map(|worker| {
        worker.watch_updates(Arc::new(ConsoleUpdateHandler {
            accept: accept_updates,
        }))
    });
    session.spawn_background();

    let mut rx = session.orchestrator().subscribe();
    let mut shown = Indicator::from_state(&rx.borrow_and_update());
    let mut dismiss_at = show(shown)?;

    loop {
        let deadline = dismiss_at.unwrap_or_else(Instant::now);
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = Indicator::from_state(&rx.borrow_and_update());
                if current != shown {
                    dismiss_at = show(current)?;
                    shown = current;
                }
            }
            _ = tokio::time::sleep_until(deadline), if dismiss_at.is_some() => {
                dismiss_at = show(None)?;
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Stopping.");
                break;
            }
        }
    }

    if let Some(updates) = updates {
        updates.abort();
    }
    session.shutdown().await?;
    Ok(())
}

/// Replace the status line with `indicator`, returning when it should be
/// cleared.
fn show(indicator: Option<Indicator>) -> anyhow::Result<Option<Instant>> {
    let mut out = std::io::stdout().lock();
    write!(out, "\r\x1b[2K")?;
    if let Some(indicator) = &indicator {
        write!(out, "{}", notice(indicator))?;
    }
    out.flush()?;
    Ok(indicator
        .and_then(|i| i.auto_dismiss())
        .map(|after| Instant::now() + after))
}

fn notice(indicator: &Indicator) -> String {
    match indicator.action() {
        Some(action) => format!("{indicator} [{}]", action.label()),
        None => indicator.to_string(),
    }
}

async fn handle_queue(config: &Config, cmd: QueueCommand) -> anyhow::Result<()> {
    match cmd {
        QueueCommand::Add { url, method, data } => {
            let data: Value =
                serde_json::from_str(&data).context("--data must be valid JSON")?;
            let session = SyncSession::start(config).await?;
            let id = session
                .orchestrator()
                .queue_for_sync(url, method.into(), data)
                .await?;
            println!("Queued mutation #{id}.");

            if session.connectivity().is_online() {
                let outcome = session.sync_now().await;
                print_outcome(&outcome)?;
            } else {
                println!("Offline; it will be sent when the API is reachable.");
            }
            session.shutdown().await?;
        }
        QueueCommand::List { json } => {
            let pending = open_queue(config)?.pending()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else if pending.is_empty() {
                println!("No pending mutations.");
            } else {
                for mutation in &pending {
                    let queued_at = chrono::DateTime::from_timestamp_millis(mutation.timestamp)
                        .map_or_else(|| mutation.timestamp.to_string(), |t| t.to_rfc3339());
                    println!(
                        "#{:<5} {:<6} {}  ({})",
                        mutation.id.unwrap_or_default(),
                        mutation.method,
                        mutation.url,
                        queued_at
                    );
                }
            }
        }
        QueueCommand::Clear { yes } => {
            let queue = open_queue(config)?;
            let count = queue.count_pending();
            if !yes {
                println!("This will discard {count} pending mutations without sending them.");
                println!("Use --yes to confirm.");
                return Ok(());
            }
            let removed = queue.clear()?;
            println!("Discarded {removed} pending mutations.");
        }
    }
    Ok(())
}

async fn handle_cache(config: &Config, cmd: CacheCommand) -> anyhow::Result<()> {
    match cmd {
        CacheCommand::List { secondary, json } => {
            let store = LocalStore::open(config.database_path())?;
            let records = store.get_all(CacheCommand::partition(secondary));
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No cached records.");
            } else {
                for record in &records {
                    println!("{record}");
                }
            }
        }
        CacheCommand::Refresh { endpoint } => {
            let session = SyncSession::start(config).await?;
            if !session.connectivity().is_online() {
                session.shutdown().await?;
                bail!("the API is unreachable; cached records were left unchanged");
            }
            let stored = session.orchestrator().refresh_records(&endpoint).await;
            session.shutdown().await?;
            println!("Cached {} records from {endpoint}.", stored?);
        }
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!();
                println!("[API]");
                println!("  Base URL:           {}", config.api.base_url);
                println!("  Timeout (s):        {}", config.api.timeout_secs);
                println!("  Health URL:         {}", config.api.health_url());
                println!();
                println!("[Sync]");
                println!("  Synced decay (ms):  {}", config.sync.synced_decay_ms);
                println!("  Error decay (ms):   {}", config.sync.error_decay_ms);
                println!("  Probe every (ms):   {}", config.sync.probe_interval_ms);
                println!();
                println!("[Worker]");
                println!("  Environment:        {}", config.worker.environment);
                println!("  Version:            {}", config.worker.version);
                println!("  Background sync:    {}", config.worker.background_sync);
                println!("  Sync tag:           {}", config.worker.sync_tag);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
