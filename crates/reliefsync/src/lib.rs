//! `reliefsync` - Offline-first sync for disaster-relief registries
//!
//! This library keeps relief records (blood and skin donors, missing-person
//! reports) usable without a network. Writes made while offline are queued in
//! a durable local store and replayed against the registry API, in order,
//! once connectivity returns. A background worker mirrors cached records and
//! wakes the queue through background sync.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod api;
pub mod cli;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod indicator;
pub mod logging;
pub mod mutation;
pub mod orchestrator;
pub mod queue;
pub mod session;
pub mod storage;
pub mod worker;

pub use api::{HttpApi, RemoteApi, ReplayError};
pub use config::Config;
pub use connectivity::{ConnectivityMonitor, NetworkStatus};
pub use error::{Error, Result};
pub use indicator::Indicator;
pub use logging::init_logging;
pub use mutation::{HttpMethod, Partition, PendingMutation, RecordKey};
pub use orchestrator::{SyncOrchestrator, SyncOutcome, SyncState, SyncStatus};
pub use queue::{DrainReport, SyncQueue};
pub use session::SyncSession;
pub use storage::{LocalStore, StoreStats};
pub use worker::{UpdateHandler, WorkerRegistration};
