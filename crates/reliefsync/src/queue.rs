//! Durable queue of pending mutations.
//!
//! Mutations are written to the local store's sync-queue partition and
//! replayed against the API in FIFO order. An entry leaves the queue only
//! after the API accepted it; a failed replay leaves it in place for the next
//! drain.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api::RemoteApi;
use crate::error::{Error, Result};
use crate::mutation::{HttpMethod, Partition, PendingMutation, RecordKey};
use crate::storage::LocalStore;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Mutations replayed during this pass.
    pub attempted: usize,
    /// Mutations the API accepted and that left the queue.
    pub replayed: usize,
    /// Mutations that stay queued.
    pub failed: usize,
    /// Queue length after the pass.
    pub remaining: usize,
    /// Whether this call waited on another caller's drain instead of running
    /// its own.
    pub coalesced: bool,
}

impl DrainReport {
    fn coalesced(remaining: usize) -> Self {
        Self {
            remaining,
            coalesced: true,
            ..Self::default()
        }
    }

    /// Whether every attempted mutation was accepted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// The pending-mutation queue.
///
/// Cloning yields another handle on the same queue. At most one drain runs at
/// a time across all clones.
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<LocalStore>,
    api: Arc<dyn RemoteApi>,
    drain_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("store", &self.store.path())
            .finish_non_exhaustive()
    }
}

impl SyncQueue {
    /// Create a queue over a store, replaying through `api`.
    #[must_use]
    pub fn new(store: Arc<LocalStore>, api: Arc<dyn RemoteApi>) -> Self {
        Self {
            store,
            api,
            drain_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// The API mutations are replayed against.
    #[must_use]
    pub fn api(&self) -> &Arc<dyn RemoteApi> {
        &self.api
    }

    /// Persist a new mutation and return its queue key.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation cannot be written.
    pub fn enqueue(&self, url: impl Into<String>, method: HttpMethod, data: Value) -> Result<i64> {
        let mutation = PendingMutation::new(url, method, data);
        let record = serde_json::to_value(&mutation)?;

        match self.store.put(Partition::SyncQueue, &record)? {
            RecordKey::Sequence(id) => {
                info!("Queued {} {} (#{})", mutation.method, mutation.url, id);
                Ok(id)
            }
            RecordKey::Named(key) => Err(Error::internal(format!(
                "sync queue returned a named key '{key}'"
            ))),
            RecordKey::Number(key) => Err(Error::internal(format!(
                "sync queue returned a numeric key '{key}'"
            ))),
        }
    }

    /// Every queued mutation, oldest first.
    ///
    /// Entries that no longer decode are logged and skipped; they stay in the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub fn pending(&self) -> Result<Vec<PendingMutation>> {
        let mut pending: Vec<PendingMutation> = self
            .store
            .try_get_all(Partition::SyncQueue)?
            .into_iter()
            .filter_map(|record| match serde_json::from_value(record) {
                Ok(mutation) => Some(mutation),
                Err(e) => {
                    error!("Skipping undecodable queued mutation: {}", e);
                    None
                }
            })
            .collect();
        pending.sort_by_key(PendingMutation::fifo_key);
        Ok(pending)
    }

    /// Number of queued mutations; 0 if the queue cannot be read.
    #[must_use]
    pub fn count_pending(&self) -> usize {
        self.store
            .count(Partition::SyncQueue)
            .unwrap_or_else(|e| {
                error!("Failed to count pending mutations: {}", e);
                0
            })
    }

    /// Replay every queued mutation once, oldest first.
    ///
    /// Accepted mutations are removed; failed ones stay queued and the pass
    /// continues. A call made while another drain is running waits for it to
    /// finish and returns a coalesced report without replaying anything.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue cannot be read.
    pub async fn drain(&self) -> Result<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already running; waiting for it");
            let _done = self.drain_lock.lock().await;
            return Ok(DrainReport::coalesced(self.count_pending()));
        };

        let pending = self.pending()?;
        let mut report = DrainReport::default();

        for mutation in &pending {
            report.attempted += 1;
            match self.api.replay(mutation).await {
                Ok(status) => {
                    debug!("Replayed {} {} ({})", mutation.method, mutation.url, status);
                    if self.remove(mutation) {
                        report.replayed += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    warn!("Failed to sync {} {}: {}", mutation.method, mutation.url, e);
                    report.failed += 1;
                }
            }
        }

        report.remaining = self.count_pending();
        if report.attempted > 0 {
            info!(
                "Drained sync queue: {} replayed, {} failed, {} remaining",
                report.replayed, report.failed, report.remaining
            );
        }
        Ok(report)
    }

    fn remove(&self, mutation: &PendingMutation) -> bool {
        let Some(id) = mutation.id else {
            error!("Replayed mutation {} has no queue key", mutation.url);
            return false;
        };
        match self.store.delete(Partition::SyncQueue, &RecordKey::Sequence(id)) {
            Ok(_) => true,
            Err(e) => {
                error!("Replayed mutation #{} could not be removed: {}", id, e);
                false
            }
        }
    }

    /// Remove every queued mutation without replaying it.
    ///
    /// Returns the number of mutations discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be cleared.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.store.clear(Partition::SyncQueue)?;
        if removed > 0 {
            warn!("Discarded {} pending mutations", removed);
        }
        Ok(removed)
    }
}
