//! Error types for reliefsync.
//!
//! This module defines the error types shared by the local store, the sync
//! queue, the orchestrator and the background worker channel.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for reliefsync operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// The local store could not be opened or created.
    #[error("local storage unavailable at {path}: {source}")]
    StorageUnavailable {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// A record written to a keyed partition has no usable `id`.
    #[error("record for partition '{partition}' has no usable id")]
    MissingKey {
        /// Name of the partition.
        partition: &'static str,
    },

    /// A stored row could not be turned back into its typed form.
    #[error("corrupt record in partition '{partition}': {message}")]
    CorruptRecord {
        /// Name of the partition.
        partition: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === API Errors ===
    /// The HTTP client could not be built or a request could not be sent.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A request to the remote API failed or was rejected.
    #[error("remote API request failed: {0}")]
    Remote(#[from] crate::api::ReplayError),

    /// An HTTP method that cannot be queued as a mutation.
    #[error("unsupported mutation method: {0}")]
    UnsupportedMethod(String),

    // === Worker Errors ===
    /// The background worker is not running or stopped answering.
    #[error("background worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The platform has no background-sync capability.
    #[error("background sync is not supported on this platform")]
    BackgroundSyncUnavailable,

    // === I/O Errors ===
    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for reliefsync operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a new worker-unavailable error.
    #[must_use]
    pub fn worker_unavailable(message: impl Into<String>) -> Self {
        Self::WorkerUnavailable(message.into())
    }

    /// Create a corrupt-record error.
    #[must_use]
    pub fn corrupt_record(partition: &'static str, message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            partition,
            message: message.into(),
        }
    }

    /// Check if this error means local storage cannot be used at all.
    #[must_use]
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable { .. } | Self::DirectoryCreate { .. }
        )
    }

    /// Check if this error is the expected absence of background sync.
    #[must_use]
    pub fn is_background_sync_unavailable(&self) -> bool {
        matches!(self, Self::BackgroundSyncUnavailable)
    }
}
