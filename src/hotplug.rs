//! Device arrival/removal detection by polling the port list.
//!
//! Each change nudges every engine with [`ComLogger::request_reconnect`]. An engine honours
//! one nudge per cooldown window and keeps its open-failure backoff, so a burst of USB
//! events does not turn into a reconnect storm.
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::ComLogger;
use crate::serial::{same_port, SerialBackend};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl PortChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Difference between two port listings.
pub fn port_changes(previous: &[String], current: &[String]) -> PortChanges {
    let missing_from =
        |list: &[String], name: &String| !list.iter().any(|other| same_port(other, name));
    PortChanges {
        added: current
            .iter()
            .filter(|p| missing_from(previous, *p))
            .cloned()
            .collect(),
        removed: previous
            .iter()
            .filter(|p| missing_from(current, *p))
            .cloned()
            .collect(),
    }
}

pub struct DeviceWatcher {
    backend: Arc<dyn SerialBackend>,
    engines: Vec<Arc<ComLogger>>,
    interval: Duration,
}

pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl DeviceWatcher {
    pub fn new(
        backend: Arc<dyn SerialBackend>,
        engines: Vec<Arc<ComLogger>>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            engines,
            interval,
        }
    }

    pub fn spawn(self) -> WatcherHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        WatcherHandle { shutdown, task }
    }

    async fn list(&self) -> Option<Vec<String>> {
        let backend = Arc::clone(&self.backend);
        match tokio::task::spawn_blocking(move || backend.available_ports()).await {
            Ok(Ok(ports)) => Some(ports),
            Ok(Err(e)) => {
                warn!("Port scan failed: {}", e);
                None
            }
            Err(e) => {
                warn!("Port scan task failed: {}", e);
                None
            }
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut known = self.list().await.unwrap_or_default();
        debug!("Device watcher started with {} port(s)", known.len());
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let Some(current) = self.list().await else {
                continue;
            };
            let changes = port_changes(&known, &current);
            if changes.is_empty() {
                continue;
            }
            for port in &changes.added {
                info!("Serial device arrived: {}", port);
            }
            for port in &changes.removed {
                info!("Serial device removed: {}", port);
            }
            let reason = if changes.added.is_empty() {
                "device removed"
            } else {
                "device arrived"
            };
            for engine in &self.engines {
                engine.request_reconnect(reason);
            }
            known = current;
        }
        debug!("Device watcher stopped");
    }
}
