//! Application session.
//!
//! A session wires one local store, one queue, one connectivity monitor,
//! one orchestrator and at most one background worker together. Everything
//! is created here and passed down explicitly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{HttpApi, RemoteApi};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivityProbe, HttpProbe, ProbeHandle};
use crate::error::{Error, Result};
use crate::orchestrator::{DecayTimings, SkipReason, SyncOrchestrator, SyncOutcome, SyncStatus};
use crate::queue::{DrainReport, SyncQueue};
use crate::storage::LocalStore;
use crate::worker::{WorkerEvent, WorkerMessage, WorkerRegistration};

/// Metadata key holding the last active worker version.
pub const WORKER_VERSION_KEY: &str = "worker_version";

/// A running offline-sync session.
pub struct SyncSession {
    connectivity: ConnectivityMonitor,
    orchestrator: SyncOrchestrator,
    worker: Option<Arc<WorkerRegistration>>,
    probe: Arc<dyn ConnectivityProbe>,
    probe_interval: Duration,
    background: Option<(ProbeHandle, JoinHandle<()>)>,
    version_recorder: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("orchestrator", &self.orchestrator)
            .field("worker", &self.worker.is_some())
            .field("probe_interval", &self.probe_interval)
            .finish_non_exhaustive()
    }
}

impl SyncSession {
    /// Start a session against the configured API.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be opened or the HTTP
    /// clients cannot be built.
    pub async fn start(config: &Config) -> Result<Self> {
        let probe = HttpProbe::new(config.api.health_url(), config.api.timeout())?;
        let api = HttpApi::from_config(&config.api)?;
        Self::with_parts(config, Arc::new(probe), Arc::new(api)).await
    }

    /// Start a session with an explicit probe and API.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be opened.
    pub async fn with_parts(
        config: &Config,
        probe: Arc<dyn ConnectivityProbe>,
        api: Arc<dyn RemoteApi>,
    ) -> Result<Self> {
        let connectivity = ConnectivityMonitor::new(probe.check().await);
        info!("Session starting {}", connectivity.current_status());

        let mut store = LocalStore::open(config.database_path())?;
        let previous_version = store.metadata(WORKER_VERSION_KEY)?;

        let worker = WorkerRegistration::register_over(
            &config.worker,
            &connectivity,
            previous_version.as_deref(),
        )
        .await
        .map(Arc::new);

        if let Some(worker) = &worker {
            if previous_version.is_none() {
                if let Err(e) = store.set_metadata(WORKER_VERSION_KEY, &config.worker.version) {
                    warn!("Could not record worker version: {}", e);
                }
            }
            store = store.with_worker_channel(worker.channel());
        }
        let store = Arc::new(store);

        let version_recorder = worker
            .as_ref()
            .map(|w| spawn_version_recorder(Arc::clone(&store), w.subscribe()));

        let queue = SyncQueue::new(store, api);
        let orchestrator = SyncOrchestrator::new(
            queue,
            connectivity.clone(),
            DecayTimings::from(&config.sync),
        )
        .with_worker(worker.clone());

        Ok(Self {
            connectivity,
            orchestrator,
            worker,
            probe,
            probe_interval: config.probe_interval(),
            background: None,
            version_recorder,
        })
    }

    /// The session's orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    /// The session's connectivity monitor.
    #[must_use]
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// The registered background worker, if any.
    #[must_use]
    pub fn worker(&self) -> Option<&Arc<WorkerRegistration>> {
        self.worker.as_ref()
    }

    /// Start probing connectivity and syncing automatically.
    ///
    /// When the session is online, one sync pass starts right away so
    /// mutations left over from an earlier run do not wait for the next
    /// reconnect. Calling this again while the tasks run does nothing.
    pub fn spawn_background(&mut self) {
        if self.background.is_some() {
            return;
        }
        if self.connectivity.is_online() {
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                let outcome = orchestrator.sync_pending_data().await;
                debug!("Initial sync: {:?}", outcome);
            });
        }
        let probe = self
            .connectivity
            .spawn_probe(Arc::clone(&self.probe), self.probe_interval);
        let auto_sync = self
            .orchestrator
            .spawn_auto_sync(self.worker.as_ref().map(|w| w.subscribe()));
        self.background = Some((probe, auto_sync));
    }

    /// Sync now and wait for the pass to finish.
    ///
    /// If another pass is already running, waits for that one instead. Its
    /// result is reported as a coalesced completion, or as a failure when it
    /// ended in an error.
    pub async fn sync_now(&self) -> SyncOutcome {
        let outcome = self.orchestrator.sync_pending_data().await;
        if outcome != SyncOutcome::Skipped(SkipReason::AlreadySyncing) {
            return outcome;
        }

        let mut rx = self.orchestrator.subscribe();
        let Ok(state) = rx
            .wait_for(|state| state.sync_status != SyncStatus::Syncing)
            .await
            .map(|state| state.clone())
        else {
            return outcome;
        };

        if state.sync_status == SyncStatus::Error {
            return SyncOutcome::Failed("the sync already in progress failed".to_string());
        }
        SyncOutcome::Completed(DrainReport {
            remaining: state.pending_count,
            coalesced: true,
            ..DrainReport::default()
        })
    }

    /// Stop background tasks and the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker task failed.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            orchestrator,
            worker,
            background,
            version_recorder,
            ..
        } = self;

        if let Some((probe, auto_sync)) = background {
            probe.stop();
            auto_sync.abort();
            // The aborted task releases its orchestrator clone once it is
            // dropped by the runtime.
            let _ = auto_sync.await;
        }
        drop(orchestrator);
        if let Some(recorder) = version_recorder {
            recorder.abort();
            let _ = recorder.await;
        }

        match worker.map(Arc::try_unwrap) {
            Some(Ok(worker)) => worker.unregister().await?,
            Some(Err(shared)) => {
                debug!("Worker still shared; stopping it by message");
                if !shared.channel().post(WorkerMessage::Shutdown) {
                    return Err(Error::worker_unavailable("worker already stopped"));
                }
            }
            None => {}
        }

        info!("Session stopped");
        Ok(())
    }
}

/// Persist each newly activated worker version so the next session starts
/// the worker at that version.
fn spawn_version_recorder(
    store: Arc<LocalStore>,
    mut events: broadcast::Receiver<WorkerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::Activated { version }) => {
                    if let Err(e) = store.set_metadata(WORKER_VERSION_KEY, &version) {
                        warn!("Could not record worker version {}: {}", version, e);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Version recorder missed {} worker events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
