//! Background worker.
//!
//! The worker runs beside the application as its own task and is reached only
//! through messages. It mirrors cached records, holds background-sync
//! registrations until the network is usable, and manages worker version
//! updates (a new version waits until told to skip waiting).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Environment, WorkerConfig};
use crate::connectivity::{ConnectivityMonitor, NetworkStatus};
use crate::error::{Error, Result};
use crate::mutation::RecordKey;

/// Capacity of the worker event broadcast.
const EVENT_CAPACITY: usize = 32;

/// Message sent from the application to the worker.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Mirror a cached domain record.
    CacheRecord {
        /// Record key.
        key: RecordKey,
        /// Record payload.
        record: Value,
    },
    /// Look up a mirrored record.
    CachedRecord {
        /// Record key.
        key: RecordKey,
        /// Where to send the record, if mirrored.
        reply: oneshot::Sender<Option<Value>>,
    },
    /// Ask for the version waiting to activate.
    WaitingVersion {
        /// Where to send the waiting version, if any.
        reply: oneshot::Sender<Option<String>>,
    },
    /// A new worker version was discovered and installed.
    InstallUpdate {
        /// Version of the new worker.
        version: String,
    },
    /// Activate the waiting worker version.
    SkipWaiting,
    /// Register a background-sync tag.
    RegisterSync {
        /// Sync tag.
        tag: String,
        /// Outcome of the registration.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Stop the worker.
    Shutdown,
}

/// Event broadcast by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A new version finished installing and is waiting to activate.
    UpdateFound {
        /// The waiting version.
        version: String,
    },
    /// A version became the active worker.
    Activated {
        /// The active version.
        version: String,
    },
    /// A registered background sync fired.
    SyncWake {
        /// The tag that fired.
        tag: String,
    },
}

/// Sending half of the worker message channel.
///
/// Posting never blocks and never fails the caller; a message for a stopped
/// worker is logged and dropped.
#[derive(Debug, Clone)]
pub struct WorkerChannel {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerChannel {
    /// Wrap the sending half of a worker channel.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { tx }
    }

    /// Post a message to the worker.
    ///
    /// Returns `false` if the worker is gone.
    pub fn post(&self, message: WorkerMessage) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Background worker gone; dropped {:?}", e.0);
                false
            }
        }
    }

    /// Check whether the worker has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Post a request and wait for its reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerMessage,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| Error::worker_unavailable("worker channel closed"))?;
        rx.await
            .map_err(|_| Error::worker_unavailable("worker dropped the request"))
    }
}

/// State owned by the worker task.
#[derive(Debug)]
pub struct BackgroundWorker {
    active_version: String,
    waiting_version: Option<String>,
    background_sync: bool,
    sync_tags: BTreeSet<String>,
    cache: HashMap<RecordKey, Value>,
    connectivity: ConnectivityMonitor,
    events: broadcast::Sender<WorkerEvent>,
}

impl BackgroundWorker {
    /// Start a worker task at the given version.
    ///
    /// `background_sync` says whether the platform offers background sync.
    pub fn spawn(
        version: impl Into<String>,
        background_sync: bool,
        connectivity: ConnectivityMonitor,
    ) -> (WorkerChannel, broadcast::Sender<WorkerEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let worker = Self {
            active_version: version.into(),
            waiting_version: None,
            background_sync,
            sync_tags: BTreeSet::new(),
            cache: HashMap::new(),
            connectivity,
            events: events.clone(),
        };
        info!("Background worker {} started", worker.active_version);

        let task = tokio::spawn(worker.run(rx));
        (WorkerChannel::new(tx), events, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
        let mut network = self.connectivity.subscribe();

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(WorkerMessage::Shutdown) | None => break,
                    Some(message) => self.handle(message),
                },
                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *network.borrow_and_update();
                    if status == NetworkStatus::Online {
                        self.fire_sync_tags();
                    }
                }
            }
        }

        info!("Background worker {} stopped", self.active_version);
    }

    fn handle(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::CacheRecord { key, record } => {
                debug!("Worker cached record {}", key);
                self.cache.insert(key, record);
            }
            WorkerMessage::CachedRecord { key, reply } => {
                let _ = reply.send(self.cache.get(&key).cloned());
            }
            WorkerMessage::WaitingVersion { reply } => {
                let _ = reply.send(self.waiting_version.clone());
            }
            WorkerMessage::InstallUpdate { version } => self.install(version),
            WorkerMessage::SkipWaiting => self.activate_waiting(),
            WorkerMessage::RegisterSync { tag, reply } => {
                let _ = reply.send(self.register_sync(tag));
            }
            WorkerMessage::Shutdown => {}
        }
    }

    fn install(&mut self, version: String) {
        if version == self.active_version {
            debug!("Worker {} already active", version);
            return;
        }
        info!("Worker {} installed; waiting to activate", version);
        self.waiting_version = Some(version.clone());
        self.emit(WorkerEvent::UpdateFound { version });
    }

    fn activate_waiting(&mut self) {
        let Some(version) = self.waiting_version.take() else {
            debug!("Skip waiting with no waiting worker");
            return;
        };
        info!("Worker {} activated (was {})", version, self.active_version);
        self.active_version = version.clone();
        self.emit(WorkerEvent::Activated { version });
    }

    fn register_sync(&mut self, tag: String) -> Result<()> {
        if !self.background_sync {
            return Err(Error::BackgroundSyncUnavailable);
        }
        debug!("Background sync '{}' registered", tag);
        self.sync_tags.insert(tag);

        if self.connectivity.is_online() {
            self.fire_sync_tags();
        }
        Ok(())
    }

    /// Each registration fires once.
    fn fire_sync_tags(&mut self) {
        for tag in std::mem::take(&mut self.sync_tags) {
            info!("Background sync '{}' fired", tag);
            self.emit(WorkerEvent::SyncWake { tag });
        }
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!("No listeners for worker event");
        }
    }
}

/// Application-side policy for worker updates.
pub trait UpdateHandler: Send + Sync {
    /// Ask whether the waiting version should be activated now.
    fn confirm_update(&self, version: &str) -> bool;

    /// Reload the application after the new version took over.
    fn reload(&self);
}

/// A registered background worker.
#[derive(Debug)]
pub struct WorkerRegistration {
    channel: WorkerChannel,
    events: broadcast::Sender<WorkerEvent>,
    task: JoinHandle<()>,
    sync_tag: String,
}

impl WorkerRegistration {
    /// Register the background worker described by `config` as a fresh
    /// install.
    ///
    /// Returns `None` in development builds. Background sync for the
    /// configured tag is requested right away; its absence is logged and
    /// otherwise ignored.
    pub async fn register(
        config: &WorkerConfig,
        connectivity: &ConnectivityMonitor,
    ) -> Option<Self> {
        Self::register_over(config, connectivity, None).await
    }

    /// Register the worker described by `config` over a previously active
    /// version.
    ///
    /// The worker starts at `active_version`. When `config.version` differs,
    /// it is installed as the waiting version and [`WorkerEvent::UpdateFound`]
    /// is emitted; it activates only after [`WorkerMessage::SkipWaiting`].
    pub async fn register_over(
        config: &WorkerConfig,
        connectivity: &ConnectivityMonitor,
        active_version: Option<&str>,
    ) -> Option<Self> {
        if config.environment == Environment::Development {
            info!("Development build; background worker not registered");
            return None;
        }

        let active = active_version.unwrap_or(config.version.as_str());
        let (channel, events, task) =
            BackgroundWorker::spawn(active, config.background_sync, connectivity.clone());
        let registration = Self {
            channel,
            events,
            task,
            sync_tag: config.sync_tag.clone(),
        };
        info!("Background worker registered");

        if active != config.version {
            info!("Worker {} found; {} still active", config.version, active);
            registration.install_update(config.version.clone());
        }

        registration.request_background_sync().await;
        Some(registration)
    }

    /// Message channel to the worker.
    #[must_use]
    pub fn channel(&self) -> WorkerChannel {
        self.channel.clone()
    }

    /// Subscribe to worker events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Register a background-sync tag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackgroundSyncUnavailable`] if the platform has no
    /// background sync, or [`Error::WorkerUnavailable`] if the worker stopped.
    pub async fn register_background_sync(&self, tag: impl Into<String>) -> Result<()> {
        let tag = tag.into();
        self.channel
            .request(|reply| WorkerMessage::RegisterSync { tag, reply })
            .await?
    }

    /// Request background sync for the configured tag.
    ///
    /// Returns whether the registration succeeded. Failures are logged.
    pub async fn request_background_sync(&self) -> bool {
        match self.register_background_sync(self.sync_tag.clone()).await {
            Ok(()) => true,
            Err(e) if e.is_background_sync_unavailable() => {
                debug!("Background sync unavailable; relying on in-app sync");
                false
            }
            Err(e) => {
                warn!("Background sync registration failed: {}", e);
                false
            }
        }
    }

    /// Look up a record mirrored by the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerUnavailable`] if the worker stopped.
    pub async fn cached_record(&self, key: impl Into<RecordKey>) -> Result<Option<Value>> {
        let key = key.into();
        self.channel
            .request(|reply| WorkerMessage::CachedRecord { key, reply })
            .await
    }

    /// The version waiting to activate, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerUnavailable`] if the worker stopped.
    pub async fn waiting_version(&self) -> Result<Option<String>> {
        self.channel
            .request(|reply| WorkerMessage::WaitingVersion { reply })
            .await
    }

    /// Hand a newly discovered worker version to the worker.
    pub fn install_update(&self, version: impl Into<String>) -> bool {
        self.channel.post(WorkerMessage::InstallUpdate {
            version: version.into(),
        })
    }

    /// Watch for waiting worker versions and apply them when `handler` agrees.
    ///
    /// A version already waiting when the watch starts is offered first.
    /// Each waiting version is offered once; a declined update stays waiting.
    pub fn watch_updates(&self, handler: Arc<dyn UpdateHandler>) -> JoinHandle<()> {
        let mut events = self.subscribe();
        let channel = self.channel();

        tokio::spawn(async move {
            let mut offered: Option<String> = None;
            let offer = |version: String, offered: &mut Option<String>| {
                if offered.as_deref() == Some(version.as_str()) {
                    return;
                }
                if handler.confirm_update(&version) {
                    channel.post(WorkerMessage::SkipWaiting);
                } else {
                    info!("Update to worker {} deferred", version);
                }
                *offered = Some(version);
            };

            match channel
                .request(|reply| WorkerMessage::WaitingVersion { reply })
                .await
            {
                Ok(Some(version)) => offer(version, &mut offered),
                Ok(None) => {}
                Err(e) => {
                    warn!("Update watcher could not reach the worker: {}", e);
                    return;
                }
            }

            loop {
                match events.recv().await {
                    Ok(WorkerEvent::UpdateFound { version }) => offer(version, &mut offered),
                    Ok(WorkerEvent::Activated { version }) => {
                        info!("Worker {} took over; reloading", version);
                        offered = None;
                        handler.reload();
                    }
                    Ok(WorkerEvent::SyncWake { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Update watcher missed {} worker events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker task panicked.
    pub async fn unregister(self) -> Result<()> {
        self.channel.post(WorkerMessage::Shutdown);
        self.task
            .await
            .map_err(|e| Error::internal(format!("background worker task failed: {e}")))?;
        info!("Background worker unregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn production_config() -> WorkerConfig {
        WorkerConfig {
            version: "1.0.0".to_string(),
            ..WorkerConfig::default()
        }
    }

    #[derive(Debug)]
    struct RecordingHandler {
        accept: AtomicBool,
        confirmations: AtomicUsize,
        reloads: AtomicUsize,
    }

    impl RecordingHandler {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept: AtomicBool::new(accept),
                confirmations: AtomicUsize::new(0),
                reloads: AtomicUsize::new(0),
            })
        }
    }

    impl UpdateHandler for RecordingHandler {
        fn confirm_update(&self, _version: &str) -> bool {
            self.confirmations.fetch_add(1, Ordering::SeqCst);
            self.accept.load(Ordering::SeqCst)
        }

        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_post_to_stopped_worker_returns_false() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let channel = WorkerChannel::new(tx);

        assert!(channel.is_closed());
        assert!(!channel.post(WorkerMessage::SkipWaiting));
    }

    #[tokio::test]
    async fn test_register_skipped_in_development() {
        let config = WorkerConfig {
            environment: Environment::Development,
            ..production_config()
        };
        let registration =
            WorkerRegistration::register(&config, &ConnectivityMonitor::new(true)).await;
        assert!(registration.is_none());
    }

    #[tokio::test]
    async fn test_cache_record_round_trip() {
        let registration =
            WorkerRegistration::register(&production_config(), &ConnectivityMonitor::new(false))
                .await
                .unwrap();

        registration.channel().post(WorkerMessage::CacheRecord {
            key: RecordKey::from("d1"),
            record: json!({"id": "d1", "name": "A"}),
        });

        let cached = registration.cached_record("d1").await.unwrap();
        assert_eq!(cached, Some(json!({"id": "d1", "name": "A"})));
        assert_eq!(registration.cached_record("d2").await.unwrap(), None);

        registration.unregister().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_sync_unavailable() {
        let config = WorkerConfig {
            background_sync: false,
            ..production_config()
        };
        let registration = WorkerRegistration::register(&config, &ConnectivityMonitor::new(true))
            .await
            .unwrap();

        let err = registration
            .register_background_sync("milestone-sync")
            .await
            .unwrap_err();
        assert!(err.is_background_sync_unavailable());
        assert!(!registration.request_background_sync().await);
    }

    #[tokio::test]
    async fn test_sync_fires_immediately_when_online() {
        let connectivity = ConnectivityMonitor::new(true);
        let (channel, events, _task) = BackgroundWorker::spawn("1", true, connectivity);
        let mut rx = events.subscribe();

        let (reply, done) = oneshot::channel();
        channel.post(WorkerMessage::RegisterSync {
            tag: "milestone-sync".to_string(),
            reply,
        });
        done.await.unwrap().unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerEvent::SyncWake {
                tag: "milestone-sync".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_sync_waits_for_connectivity_and_fires_once() {
        let connectivity = ConnectivityMonitor::new(false);
        let registration = WorkerRegistration::register(&production_config(), &connectivity)
            .await
            .unwrap();
        let mut rx = registration.subscribe();

        assert!(registration.request_background_sync().await);
        assert!(rx.try_recv().is_err());

        connectivity.set_online(true);
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerEvent::SyncWake {
                tag: "milestone-sync".to_string()
            }
        );

        // The registration was consumed; a second transition fires nothing.
        connectivity.set_online(false);
        connectivity.set_online(true);
        registration.install_update("marker");
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerEvent::UpdateFound {
                version: "marker".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_update_waits_until_skip_waiting() {
        let connectivity = ConnectivityMonitor::new(true);
        let (channel, events, _task) = BackgroundWorker::spawn("1.0.0", true, connectivity);
        let mut rx = events.subscribe();

        // Reinstalling the active version is a no-op.
        channel.post(WorkerMessage::InstallUpdate {
            version: "1.0.0".to_string(),
        });
        channel.post(WorkerMessage::InstallUpdate {
            version: "1.1.0".to_string(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerEvent::UpdateFound {
                version: "1.1.0".to_string()
            }
        );

        channel.post(WorkerMessage::SkipWaiting);
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerEvent::Activated {
                version: "1.1.0".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_watch_updates_accepting_handler_reloads() {
        let registration =
            WorkerRegistration::register(&production_config(), &ConnectivityMonitor::new(false))
                .await
                .unwrap();
        let handler = RecordingHandler::new(true);
        let mut rx = registration.subscribe();
        let _watcher = registration.watch_updates(handler.clone());

        registration.install_update("2.0.0");
        loop {
            if let WorkerEvent::Activated { version } = rx.recv().await.unwrap() {
                assert_eq!(version, "2.0.0");
                break;
            }
        }
        // Let the watcher observe the activation.
        while handler.reloads.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handler.confirmations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_updates_declined_update_stays_waiting() {
        let registration =
            WorkerRegistration::register(&production_config(), &ConnectivityMonitor::new(false))
                .await
                .unwrap();
        let handler = RecordingHandler::new(false);
        let _watcher = registration.watch_updates(handler.clone());

        registration.install_update("2.0.0");
        while handler.confirmations.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handler.reloads.load(Ordering::SeqCst), 0);

        // A later skip-waiting still activates the waiting version.
        let mut rx = registration.subscribe();
        registration.channel().post(WorkerMessage::SkipWaiting);
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerEvent::Activated {
                version: "2.0.0".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_register_over_older_version_waits_with_update() {
        let registration = WorkerRegistration::register_over(
            &production_config(),
            &ConnectivityMonitor::new(false),
            Some("0.9.0"),
        )
        .await
        .unwrap();

        assert_eq!(
            registration.waiting_version().await.unwrap().as_deref(),
            Some("1.0.0")
        );
    }

    #[tokio::test]
    async fn test_register_over_same_version_has_no_update() {
        let registration = WorkerRegistration::register_over(
            &production_config(),
            &ConnectivityMonitor::new(false),
            Some("1.0.0"),
        )
        .await
        .unwrap();

        assert_eq!(registration.waiting_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_watch_updates_offers_version_waiting_before_watch() {
        let registration = WorkerRegistration::register_over(
            &production_config(),
            &ConnectivityMonitor::new(false),
            Some("0.9.0"),
        )
        .await
        .unwrap();
        let handler = RecordingHandler::new(true);
        let _watcher = registration.watch_updates(handler.clone());

        while handler.reloads.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handler.confirmations.load(Ordering::SeqCst), 1);
        assert_eq!(registration.waiting_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unregister_stops_worker() {
        let registration =
            WorkerRegistration::register(&production_config(), &ConnectivityMonitor::new(true))
                .await
                .unwrap();
        let channel = registration.channel();

        registration.unregister().await.unwrap();
        assert!(channel.is_closed());
        assert!(!channel.post(WorkerMessage::SkipWaiting));
    }
}
