//! # Engine
//!
//! [`ComLogger`] is one logging pipeline for one configured port:
//!
//! ```text
//! serial reader thread --LinkChunk--> FramePump --line--> LastValueStore (lastvalue.txt)
//!         ^                              |
//!   LinkSupervisor <----mark_frame-------+----LiveRow / status----> EngineEvent channel
//! ```
//!
//! The supervisor owns the port handle; the pump owns the assembler. They share nothing but
//! the chunk channel, so decoding and file writes never hold up closing the port.
//!
//! All public calls return promptly. Faults are never raised to the caller; they show up in
//! [`ComLogger::status`], the event stream and the log.
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::events::{
    EngineEvent, LiveRow, StatusReporter, StatusSnapshot, STATUS_PAUSED, STATUS_STOPPED,
    STATUS_WRITE_ERROR,
};
use crate::frame::{format_line, AssembledFrame, FrameAssembler};
use crate::link::{LinkChunk, LinkSnapshot, LinkSupervisor, LinkTimings};
use crate::serial::SerialBackend;
use crate::store::{LastValueStore, StorePolicy, WriteOutcome};
use crate::sync::lock;

/// Capacity of the chunk channel between a reader thread and the pump.
const CHUNK_QUEUE: usize = 64;

/// Everything one engine needs to know about its link.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub id: String,
    /// Port the user asked for; may be empty when auto-rebind picks one.
    pub port: String,
    pub output_dir: PathBuf,
    pub auto_rebind: bool,
    pub timings: LinkTimings,
    pub store: StorePolicy,
}

impl EngineSettings {
    pub fn new(id: &str, port: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            port: port.to_string(),
            output_dir: output_dir.into(),
            auto_rebind: true,
            timings: LinkTimings::default(),
            store: StorePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreFault {
    Paused,
    Failed,
}

/// Consumer side of the chunk channel. Lives across start/stop cycles.
struct FramePump {
    rx: mpsc::Receiver<LinkChunk>,
    assembler: FrameAssembler,
    generation: u64,
    store_fault: Option<StoreFault>,
}

impl FramePump {
    async fn run(
        &mut self,
        ctx: &PumpContext,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!("[{}] frame pump started", ctx.id);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                chunk = self.rx.recv() => match chunk {
                    Some(chunk) => self.handle_chunk(ctx, chunk).await,
                    None => break,
                },
            }
        }
        // Bytes still queued belong to a connection that is gone
        let mut dropped = 0usize;
        while let Ok(chunk) = self.rx.try_recv() {
            dropped += chunk.bytes.len();
        }
        self.assembler.clear();
        debug!(
            "[{}] frame pump stopped ({} frames accepted, {} rejected, {} overflows, {} bytes dropped)",
            ctx.id,
            self.assembler.accepted(),
            self.assembler.rejected(),
            self.assembler.overflows(),
            dropped
        );
    }

    async fn handle_chunk(&mut self, ctx: &PumpContext, chunk: LinkChunk) {
        if chunk.generation < self.generation {
            return;
        }
        if chunk.generation > self.generation {
            if self.assembler.buffered_len() > 0 {
                debug!(
                    "[{}] discarding {} buffered bytes from connection #{}",
                    ctx.id,
                    self.assembler.buffered_len(),
                    self.generation
                );
            }
            self.assembler.clear();
            self.generation = chunk.generation;
        }

        for frame in self.assembler.feed(&chunk.bytes) {
            self.emit(ctx, &chunk.port, frame).await;
        }
    }

    async fn emit(&mut self, ctx: &PumpContext, port: &str, frame: AssembledFrame) {
        ctx.supervisor.mark_frame();
        let line = format_line(&frame.fields);
        ctx.status.publish_row(LiveRow {
            id: ctx.id.clone(),
            port: port.to_string(),
            timestamp: Utc::now(),
            temperatures: frame.fields.temperatures_f64(),
            distances: frame.fields.distances_f64(),
            line: line.clone(),
            raw: frame.raw,
        });

        let store = Arc::clone(&ctx.store);
        let result = tokio::task::spawn_blocking(move || store.write(&line)).await;
        // A write that finishes after stop() must not overwrite the "stopped" status
        let report = ctx.supervisor.wants_running();
        match result {
            Ok(Ok(WriteOutcome::Written)) => {
                if self.store_fault.take().is_some() {
                    info!("[{}] writing {} again", ctx.id, ctx.store.path().display());
                    ctx.supervisor.refresh_status();
                }
            }
            Ok(Ok(WriteOutcome::Paused {
                available,
                required,
            })) => {
                if self.store_fault != Some(StoreFault::Paused) {
                    warn!(
                        "[{}] only {} bytes free, need {}; not writing {}",
                        ctx.id,
                        available,
                        required,
                        ctx.store.path().display()
                    );
                    if report {
                        ctx.status.set(STATUS_PAUSED);
                    }
                }
                self.store_fault = Some(StoreFault::Paused);
            }
            Ok(Err(e)) => {
                error!("[{}] {}", ctx.id, e);
                if report {
                    ctx.supervisor.report_fault(STATUS_WRITE_ERROR, e.to_string());
                }
                self.store_fault = Some(StoreFault::Failed);
            }
            Err(e) => {
                error!("[{}] write task failed: {}", ctx.id, e);
                if report {
                    ctx.supervisor
                        .report_fault(STATUS_WRITE_ERROR, format!("write task failed: {e}"));
                }
                self.store_fault = Some(StoreFault::Failed);
            }
        }
    }
}

struct PumpContext {
    id: String,
    supervisor: Arc<LinkSupervisor>,
    status: StatusReporter,
    store: Arc<LastValueStore>,
}

struct PumpRunner {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// One self-healing serial-to-file logging pipeline.
pub struct ComLogger {
    ctx: Arc<PumpContext>,
    pump: Arc<tokio::sync::Mutex<FramePump>>,
    runner: Mutex<Option<PumpRunner>>,
}

impl ComLogger {
    pub fn new(
        settings: EngineSettings,
        backend: Arc<dyn SerialBackend>,
        events: Option<mpsc::UnboundedSender<EngineEvent>>,
    ) -> Self {
        let status = StatusReporter::new(&settings.id, events);
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let supervisor = LinkSupervisor::new(
            &settings.id,
            &settings.port,
            settings.auto_rebind,
            backend,
            settings.timings,
            tx,
            status.clone(),
        );
        let store = Arc::new(LastValueStore::new(&settings.output_dir, settings.store));
        Self {
            ctx: Arc::new(PumpContext {
                id: settings.id,
                supervisor,
                status,
                store,
            }),
            pump: Arc::new(tokio::sync::Mutex::new(FramePump {
                rx,
                assembler: FrameAssembler::new(),
                generation: 0,
                store_fault: None,
            })),
            runner: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    /// Begin logging. Returns immediately; a missing device only shows up as status.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        {
            let mut runner = lock(&self.runner);
            if runner.is_none() {
                let (shutdown, shutdown_rx) = watch::channel(false);
                let ctx = Arc::clone(&self.ctx);
                let pump = Arc::clone(&self.pump);
                let task = tokio::spawn(async move {
                    let mut pump = pump.lock_owned().await;
                    pump.run(&ctx, shutdown_rx).await;
                });
                *runner = Some(PumpRunner { shutdown, task });
            }
        }
        info!(
            "[{}] starting, last value goes to {}",
            self.ctx.id,
            self.ctx.store.path().display()
        );
        self.ctx.supervisor.start();
    }

    /// Stop logging. When this returns the port is closed and the status is "stopped".
    pub async fn stop(&self) {
        // Port first: the reader may be blocked on a full chunk queue the pump drains
        self.ctx.supervisor.stop().await;
        let runner = lock(&self.runner).take();
        if let Some(runner) = runner {
            let _ = runner.shutdown.send(true);
            if let Err(e) = runner.task.await {
                error!("[{}] frame pump ended abnormally: {}", self.ctx.id, e);
            }
        }
        self.ctx.status.set(STATUS_STOPPED);
    }

    /// Ask for a reconnect attempt as soon as possible (device arrived, user click).
    pub fn request_reconnect(&self, reason: &str) {
        self.ctx.supervisor.request_reconnect(reason);
    }

    /// Whether a port is physically open right now.
    pub fn is_running(&self) -> bool {
        self.ctx.supervisor.is_open()
    }

    /// Whether the user wants this engine running. Stays true through reconnect windows.
    pub fn wants_running(&self) -> bool {
        self.ctx.supervisor.wants_running()
    }

    pub fn last_frame_timestamp_utc(&self) -> Option<DateTime<Utc>> {
        self.ctx.supervisor.last_frame_utc()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.ctx.status.current()
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        self.ctx.supervisor.snapshot()
    }

    pub fn store(&self) -> &LastValueStore {
        &self.ctx.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::mock::MockSerial;

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ComLogger::new(
            EngineSettings::new("idle", "COM1", dir.path()),
            Arc::new(MockSerial::new()),
            None,
        );
        assert!(!engine.wants_running());
        engine.stop().await;
        assert_eq!(engine.status().text, STATUS_STOPPED);
        assert!(!engine.is_running());
        assert_eq!(engine.last_frame_timestamp_utc(), None);
    }
}
