//! Notifications from engines to whatever shell hosts them.
//!
//! Engines push [`EngineEvent`]s into an unbounded channel. The CLI logs them; a GUI
//! would drive its status label and live table from the same stream.
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::frame::codec::{DISTANCE_COUNT, TEMPERATURE_COUNT};
use crate::sync::lock;

pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_WAITING: &str = "waiting for device…";
pub const STATUS_RECONNECTING: &str = "disconnected — reconnecting…";
pub const STATUS_STALE: &str = "no data — reconnecting…";
pub const STATUS_WRITE_ERROR: &str = "write error";
pub const STATUS_PAUSED: &str = "paused — low disk space";

pub fn status_opening(port: &str) -> String {
    format!("opening {port}…")
}

pub fn status_running(port: &str) -> String {
    format!("running ({port})")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl ErrorRecord {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            message: message.into(),
        }
    }
}

/// Most recent decoded frame, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveRow {
    pub id: String,
    pub port: String,
    pub timestamp: DateTime<Utc>,
    pub temperatures: [f64; TEMPERATURE_COUNT],
    pub distances: [f64; DISTANCE_COUNT],
    pub line: String,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StatusChanged {
        id: String,
        text: String,
        last_error: Option<ErrorRecord>,
    },
    LiveRow(LiveRow),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub text: String,
    pub last_error: Option<ErrorRecord>,
}

/// Shared, de-duplicating status line of one engine.
///
/// Both the link supervisor and the frame pump write through the same reporter; only
/// actual changes are forwarded as [`EngineEvent::StatusChanged`].
#[derive(Clone)]
pub struct StatusReporter {
    id: Arc<str>,
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
    current: Arc<Mutex<StatusSnapshot>>,
}

impl StatusReporter {
    pub fn new(id: &str, tx: Option<mpsc::UnboundedSender<EngineEvent>>) -> Self {
        Self {
            id: Arc::from(id),
            tx,
            current: Arc::new(Mutex::new(StatusSnapshot {
                text: STATUS_STOPPED.to_string(),
                last_error: None,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set(&self, text: impl Into<String>) {
        let text = text.into();
        let mut cur = lock(&self.current);
        if cur.text == text {
            return;
        }
        cur.text = text;
        self.emit(&cur);
    }

    /// Record an error and switch the status text in one notification.
    pub fn fail(&self, text: impl Into<String>, error: ErrorRecord) {
        let mut cur = lock(&self.current);
        cur.text = text.into();
        cur.last_error = Some(error);
        self.emit(&cur);
    }

    pub fn current(&self) -> StatusSnapshot {
        lock(&self.current).clone()
    }

    fn emit(&self, cur: &StatusSnapshot) {
        log::info!("[{}] status: {}", self.id, cur.text);
        if let Some(tx) = &self.tx {
            let _ = tx.send(EngineEvent::StatusChanged {
                id: self.id.to_string(),
                text: cur.text.clone(),
                last_error: cur.last_error.clone(),
            });
        }
    }

    pub(crate) fn publish_row(&self, row: LiveRow) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(EngineEvent::LiveRow(row));
        }
    }
}
