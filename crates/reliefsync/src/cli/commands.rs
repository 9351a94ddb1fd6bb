//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::mutation::{HttpMethod, Partition};

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Watch command arguments.
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Activate new worker versions without asking
    #[arg(long)]
    pub accept_updates: bool,
}

/// Sync queue commands.
#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Queue a mutation and sync it if online
    Add {
        /// Target endpoint, absolute or relative to the API base URL
        url: String,

        /// HTTP method of the mutation
        #[arg(short, long, value_enum, default_value = "post")]
        method: MethodArg,

        /// JSON request body
        #[arg(short, long, default_value = "{}")]
        data: String,
    },

    /// List queued mutations, oldest first
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Discard every queued mutation without sending it
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Record cache commands.
#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// List cached records
    List {
        /// List secondary records instead of domain records
        #[arg(long)]
        secondary: bool,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Refetch a collection endpoint into the cache
    Refresh {
        /// Collection endpoint, e.g. /api/donors
        endpoint: String,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// HTTP method argument for queued mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MethodArg {
    /// Create a record
    #[default]
    Post,
    /// Replace a record
    Put,
    /// Partially update a record
    Patch,
    /// Remove a record
    Delete,
}

impl From<MethodArg> for HttpMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Post => Self::Post,
            MethodArg::Put => Self::Put,
            MethodArg::Patch => Self::Patch,
            MethodArg::Delete => Self::Delete,
        }
    }
}

impl CacheCommand {
    /// Partition a `list` command reads.
    #[must_use]
    pub fn partition(secondary: bool) -> Partition {
        if secondary {
            Partition::Secondary
        } else {
            Partition::Records
        }
    }
}
