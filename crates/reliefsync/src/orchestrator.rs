//! Sync orchestration.
//!
//! The [`SyncOrchestrator`] owns the user-visible [`SyncState`]: whether the
//! network is usable, what the sync machinery is doing, and how many
//! mutations are waiting. It drains the queue whenever connectivity returns
//! or the background worker fires a sync, and lets transient statuses decay
//! back to idle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::mutation::{HttpMethod, Partition};
use crate::queue::{DrainReport, SyncQueue};
use crate::worker::{WorkerEvent, WorkerRegistration};

/// What the sync machinery is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Nothing in progress.
    #[default]
    Idle,
    /// A drain is running.
    Syncing,
    /// The last drain finished; shown briefly.
    Synced,
    /// The last drain could not run; shown briefly.
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Synced => write!(f, "synced"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of the sync state shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncState {
    /// Mirror of the platform connectivity signal.
    pub is_online: bool,
    /// Current sync status.
    pub sync_status: SyncStatus,
    /// Queued mutations as of the last refresh.
    pub pending_count: usize,
}

/// Why a sync request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The network is unusable.
    Offline,
    /// Another sync is already running.
    AlreadySyncing,
}

/// Result of [`SyncOrchestrator::sync_pending_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No drain was started.
    Skipped(SkipReason),
    /// A drain ran; individual mutations may still have failed.
    Completed(DrainReport),
    /// The drain could not run.
    Failed(String),
}

/// How long transient statuses stay visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecayTimings {
    /// Time spent in [`SyncStatus::Synced`] before returning to idle.
    pub synced: Duration,
    /// Time spent in [`SyncStatus::Error`] before returning to idle.
    pub error: Duration,
}

impl Default for DecayTimings {
    fn default() -> Self {
        Self {
            synced: Duration::from_secs(3),
            error: Duration::from_secs(5),
        }
    }
}

impl From<&SyncConfig> for DecayTimings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            synced: Duration::from_millis(config.synced_decay_ms),
            error: Duration::from_millis(config.error_decay_ms),
        }
    }
}

/// Coordinates the queue, connectivity and the background worker.
///
/// Cloning yields another handle on the same state.
#[derive(Debug, Clone)]
pub struct SyncOrchestrator {
    queue: SyncQueue,
    connectivity: ConnectivityMonitor,
    worker: Option<Arc<WorkerRegistration>>,
    timings: DecayTimings,
    state: Arc<watch::Sender<SyncState>>,
    /// Bumped by every sync pass; a decay timer only fires for its own pass.
    generation: Arc<AtomicU64>,
}

impl SyncOrchestrator {
    /// Create an orchestrator.
    ///
    /// The initial state mirrors the current connectivity signal and the
    /// current queue length, with an idle status.
    #[must_use]
    pub fn new(queue: SyncQueue, connectivity: ConnectivityMonitor, timings: DecayTimings) -> Self {
        let initial = SyncState {
            is_online: connectivity.is_online(),
            sync_status: SyncStatus::Idle,
            pending_count: queue.count_pending(),
        };
        let (state, _) = watch::channel(initial);

        Self {
            queue,
            connectivity,
            worker: None,
            timings,
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Request background sync from this worker whenever a mutation is queued.
    #[must_use]
    pub fn with_worker(mut self, worker: Option<Arc<WorkerRegistration>>) -> Self {
        self.worker = worker;
        self
    }

    /// The queue being drained.
    #[must_use]
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Re-read the queue length into the state.
    pub fn refresh_pending(&self) -> usize {
        let count = self.queue.count_pending();
        self.state.send_if_modified(|state| {
            if state.pending_count == count {
                false
            } else {
                state.pending_count = count;
                true
            }
        });
        count
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, status: SyncStatus) {
        self.state.send_modify(|state| state.sync_status = status);
    }

    fn mirror_online(&self, online: bool) {
        self.state.send_if_modified(|state| {
            if state.is_online == online {
                false
            } else {
                state.is_online = online;
                true
            }
        });
    }

    /// Drain the queue if the network is usable and no drain is running.
    ///
    /// Never fails the caller. The status moves to `syncing`, then to
    /// `synced` (even if some mutations failed and stay queued) or to `error`
    /// if the queue could not be read, and finally decays back to `idle`.
    pub async fn sync_pending_data(&self) -> SyncOutcome {
        if !self.connectivity.is_online() {
            debug!("Offline; sync skipped");
            return SyncOutcome::Skipped(SkipReason::Offline);
        }

        let started = self.state.send_if_modified(|state| {
            if state.sync_status == SyncStatus::Syncing {
                false
            } else {
                state.sync_status = SyncStatus::Syncing;
                true
            }
        });
        if !started {
            debug!("Sync already in progress");
            return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match self.queue.drain().await {
            Ok(report) => {
                self.finish(SyncStatus::Synced, generation);
                SyncOutcome::Completed(report)
            }
            Err(e) => {
                error!("Sync failed: {}", e);
                self.finish(SyncStatus::Error, generation);
                SyncOutcome::Failed(e.to_string())
            }
        }
    }

    fn finish(&self, status: SyncStatus, generation: u64) {
        let count = self.queue.count_pending();
        self.state.send_modify(|state| {
            state.sync_status = status;
            state.pending_count = count;
        });

        let delay = match status {
            SyncStatus::Error => self.timings.error,
            _ => self.timings.synced,
        };
        let state = Arc::clone(&self.state);
        let current = Arc::clone(&self.generation);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            state.send_if_modified(|s| {
                if s.sync_status == status {
                    s.sync_status = SyncStatus::Idle;
                    true
                } else {
                    false
                }
            });
        });
    }

    /// Queue a mutation for later replay.
    ///
    /// Refreshes the pending count, asks the background worker for a sync,
    /// and starts a sync right away when online (without waiting for it).
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation could not be persisted.
    pub async fn queue_for_sync(
        &self,
        url: impl Into<String>,
        method: HttpMethod,
        data: Value,
    ) -> Result<i64> {
        let id = self.queue.enqueue(url, method, data).map_err(|e| {
            error!("Error queuing for sync: {}", e);
            e
        })?;
        self.refresh_pending();

        if let Some(worker) = &self.worker {
            worker.request_background_sync().await;
        }

        if self.connectivity.is_online() {
            let this = self.clone();
            tokio::spawn(async move {
                this.sync_pending_data().await;
            });
        }
        Ok(id)
    }

    /// Refetch a collection endpoint and upsert every record into the cache.
    ///
    /// Fetched records replace cached ones with the same key. Records
    /// without an `id` are skipped. Returns the number of records stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch fails.
    pub async fn refresh_records(&self, url: &str) -> Result<usize> {
        let records = self.queue.api().fetch_all(url).await?;
        let store = self.queue.store();

        let mut stored = 0;
        for record in &records {
            match store.put(Partition::Records, record) {
                Ok(_) => stored += 1,
                Err(e) => warn!("Skipping record from {}: {}", url, e),
            }
        }
        info!("Refreshed {} of {} records from {}", stored, records.len(), url);
        Ok(stored)
    }

    /// Keep the state in step with connectivity and worker wake-ups.
    ///
    /// Every transition to online and every background-sync wake-up starts a
    /// sync. The task runs until aborted.
    pub fn spawn_auto_sync(
        &self,
        worker_events: Option<broadcast::Receiver<WorkerEvent>>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let mut network = self.connectivity.subscribe();
        let mut events = worker_events;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = network.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = network.borrow_and_update().is_online();
                        this.mirror_online(online);
                        if online {
                            info!("Connection restored; syncing pending mutations");
                            this.spawn_sync();
                        }
                    }
                    event = next_event(&mut events) => match event {
                        Some(WorkerEvent::SyncWake { tag }) => {
                            info!("Background sync '{}' woke the sync queue", tag);
                            this.spawn_sync();
                        }
                        Some(_) => {}
                        None => events = None,
                    }
                }
            }
        })
    }

    fn spawn_sync(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            this.sync_pending_data().await;
        });
    }
}

/// Next worker event; pends forever once the worker is gone.
async fn next_event(events: &mut Option<broadcast::Receiver<WorkerEvent>>) -> Option<WorkerEvent> {
    let Some(rx) = events else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} worker events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
