//! Connectivity monitoring.
//!
//! This module tracks whether the relief API is reachable and republishes
//! online/offline transitions to the sync orchestrator and the background
//! worker. The platform signal comes from a [`ConnectivityProbe`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Network reachability as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkStatus {
    /// The API can be reached.
    Online,
    /// The API cannot be reached.
    Offline,
}

impl NetworkStatus {
    /// Map a boolean connectivity signal to a status.
    #[must_use]
    pub fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    /// Whether this status is [`NetworkStatus::Online`].
    #[must_use]
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A source of the platform connectivity signal.
#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Check whether the network is currently usable.
    async fn check(&self) -> bool;
}

/// Probe that considers the network usable when the API answers at all.
///
/// Any HTTP response counts as online, whatever its status; only a transport
/// failure (refused, timed out, DNS) counts as offline.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// Create a probe for the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, url))
    }

    /// Create a probe reusing an existing HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// The URL being probed.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(response) => {
                debug!("Probe {} answered {}", self.url, response.status());
                true
            }
            Err(e) => {
                debug!("Probe {} failed: {}", self.url, e);
                false
            }
        }
    }
}

/// Shared view of the current connectivity status.
///
/// Cloning the monitor yields another handle on the same status. The status
/// is republished through a watch channel, so subscribers see every
/// transition but never a repeated value.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    status: Arc<watch::Sender<NetworkStatus>>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the given initial signal.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(NetworkStatus::from_online(online));
        Self {
            status: Arc::new(tx),
        }
    }

    /// Get the current status.
    #[must_use]
    pub fn current_status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    /// The platform signal, verbatim.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.current_status().is_online()
    }

    /// Feed a new platform signal.
    ///
    /// Returns `true` if this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let next = NetworkStatus::from_online(online);
        let changed = self.status.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                *status = next;
                true
            }
        });

        if changed {
            match next {
                NetworkStatus::Online => info!("Network: ONLINE"),
                NetworkStatus::Offline => warn!("Network: OFFLINE"),
            }
        }
        changed
    }

    /// Subscribe to status transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Poll a probe at a fixed interval and feed its answers into this monitor.
    ///
    /// The first check runs immediately.
    pub fn spawn_probe(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) -> ProbeHandle {
        let handle = ProbeHandle::new();
        let stop = handle.clone();
        let monitor = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if stop.should_stop() {
                    break;
                }
                let online = probe.check().await;
                monitor.set_online(online);
            }
            debug!("Connectivity probe stopped");
        });

        handle.attach(task)
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// A handle to stop a running connectivity probe.
///
/// Cheap to clone; all clones share the same stop signal.
#[derive(Debug, Clone)]
pub struct ProbeHandle {
    stop_signal: Arc<AtomicBool>,
    task: Option<Arc<JoinHandle<()>>>,
}

impl ProbeHandle {
    fn new() -> Self {
        Self {
            stop_signal: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    fn attach(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(Arc::new(task));
        self
    }

    /// Signal the probe to stop and cancel any check in flight.
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Check if the stop signal has been sent.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }
}
