//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use comlogger::engine::{ComLogger, EngineSettings};
use comlogger::events::EngineEvent;
use comlogger::link::LinkTimings;
use comlogger::serial::mock::MockSerial;
use comlogger::store::StorePolicy;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

/// Reference frame and the line it must produce.
pub const FRAME: &str = "089+20.80+20.84+21.09+00.05+00.05+00.0000000+000.0000+000.0000980";
pub const FRAME_LINE: &str = "+20.8000,+20.8400,+21.0900,+00.0500,+00.0500,+00.0000";

/// Timings small enough for tests but with idle detection effectively off.
pub fn fast_timings() -> LinkTimings {
    LinkTimings {
        poll_interval: Duration::from_millis(20),
        idle_threshold: Duration::from_secs(30),
        grace_period: Duration::from_millis(50),
        reconnect_cooldown: Duration::from_millis(50),
        open_backoff_max: Duration::from_millis(200),
        read_timeout: Duration::from_millis(10),
    }
}

pub fn settings(id: &str, port: &str, dir: &Path, timings: LinkTimings) -> EngineSettings {
    EngineSettings {
        timings,
        store: StorePolicy {
            min_free_bytes: 0,
            ..StorePolicy::default()
        },
        ..EngineSettings::new(id, port, dir)
    }
}

/// Engine on a mock backend with an attached event receiver.
pub fn mock_engine(
    mock: &MockSerial,
    settings: EngineSettings,
) -> (ComLogger, mpsc::UnboundedReceiver<EngineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = ComLogger::new(settings, Arc::new(mock.clone()), Some(tx));
    (engine, rx)
}

/// Poll `cond` every 10 ms until it holds or `timeout` passes.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
