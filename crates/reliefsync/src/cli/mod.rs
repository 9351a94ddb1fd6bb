//! Command-line interface for reliefsync.
//!
//! This module provides the CLI structure for the `reliefsync` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    CacheCommand, ConfigCommand, MethodArg, QueueCommand, StatusCommand, WatchCommand,
};

use crate::logging::Verbosity;

/// reliefsync - Keep relief registries usable offline
///
/// Queues registry writes made without a network and replays them, in
/// order, once the registry API is reachable again.
#[derive(Debug, Parser)]
#[command(name = "reliefsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show connectivity, sync status and queue length
    Status(StatusCommand),

    /// Replay queued mutations now
    Sync,

    /// Stay running and sync whenever connectivity returns
    Watch(WatchCommand),

    /// Inspect or modify the sync queue
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Inspect or refresh the record cache
    #[command(subcommand)]
    Cache(CacheCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}
