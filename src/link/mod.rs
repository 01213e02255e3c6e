//! # Link Supervisor
//!
//! Owns the physical serial connection of one logger and keeps it alive forever:
//! device unplugged and replugged, re-enumerated under another name, driver errors,
//! a device that opens but never sends a valid frame.
//!
//! ## Moving parts
//!
//! - **Ensure-loop**: one tokio task per link. Wakes on a fixed poll interval, or early
//!   when a reader reports a fault or someone calls [`LinkSupervisor::request_reconnect`],
//!   and drives the [`LinkPhase`] machine below.
//! - **Reader thread**: one OS thread per open connection doing blocking reads with a
//!   short timeout and forwarding bytes as [`LinkChunk`]s over a bounded channel. On a
//!   read error it raises a fault and exits; it never touches the connection handle.
//! - **Handle lock**: the single `Mutex<Option<ActiveConnection>>`. Open, close and the
//!   reader join all happen under it, so at most one connection exists per link.
//!
//! ## Phases
//!
//! ```text
//! Closed --desired, port present--> Opening --ok--> OpenGrace --grace over--> OpenActive
//!   ^                                  |                                         |
//!   |<-------- no port / open error ---+                      no frame for idle threshold
//!   |                                                                            v
//!   +<------------------- close, reopen after cooldown -------------------- OpenStale
//! ```
//!
//! Any read fault forces `Closed`. Idle time is measured from the last decoded frame
//! (or from `start()` if none arrived since), never from the last open, so a device that
//! connects but only sends noise is still treated as stalled.
//!
//! Reconnect attempts are throttled by a per-link cooldown. An external nudge clears the
//! cooldown and wakes the loop, at most once per cooldown window. Failed opens back off
//! exponentially with jitter, and nudges never shorten that backoff.
pub mod policy;

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle as ThreadHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::events::{
    status_opening, status_running, ErrorRecord, StatusReporter, STATUS_RECONNECTING,
    STATUS_STALE, STATUS_STOPPED, STATUS_WAITING,
};
use crate::logutil::hex_preview;
use crate::serial::{LinkError, SerialBackend, SerialStream, BAUD_RATE, DEFAULT_READ_TIMEOUT};
use crate::sync::lock;

pub use policy::{open_backoff, select_port, PortChoice};

const READ_BUF_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Closed,
    Opening,
    /// Freshly opened; idle detection suppressed while the device boots.
    OpenGrace,
    OpenActive,
    /// Open, but no valid frame for at least the idle threshold.
    OpenStale,
}

impl LinkPhase {
    pub fn is_open(self) -> bool {
        matches!(
            self,
            LinkPhase::OpenGrace | LinkPhase::OpenActive | LinkPhase::OpenStale
        )
    }
}

#[derive(Debug, Clone)]
pub struct LinkTimings {
    pub poll_interval: Duration,
    pub idle_threshold: Duration,
    pub grace_period: Duration,
    pub reconnect_cooldown: Duration,
    pub open_backoff_max: Duration,
    pub read_timeout: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            idle_threshold: Duration::from_secs(30),
            grace_period: Duration::from_secs(10),
            reconnect_cooldown: Duration::from_secs(5),
            open_backoff_max: Duration::from_secs(60),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Bytes read from one connection. `generation` changes with every successful open so the
/// consumer can drop partial data left over from a previous connection.
#[derive(Debug, Clone)]
pub struct LinkChunk {
    pub generation: u64,
    pub port: Arc<str>,
    pub bytes: Vec<u8>,
}

/// Point-in-time view of a link for status displays and tests.
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub id: String,
    pub phase: LinkPhase,
    pub desired: bool,
    pub requested_port: String,
    pub bound_port: Option<String>,
    pub last_frame_utc: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorRecord>,
    pub open_failures: u32,
    pub generation: u64,
}

struct LinkState {
    desired: bool,
    phase: LinkPhase,
    requested_port: String,
    bound_port: Option<String>,
    last_frame_at: Option<Instant>,
    last_frame_utc: Option<DateTime<Utc>>,
    idle_baseline: Option<Instant>,
    /// End of the reconnect cooldown; cleared by nudges and faults.
    next_attempt_at: Option<Instant>,
    /// End of the open-failure backoff; only a successful open clears it.
    backoff_until: Option<Instant>,
    last_nudge_at: Option<Instant>,
    grace_until: Option<Instant>,
    last_error: Option<ErrorRecord>,
    open_failures: u32,
    generation: u64,
}

impl LinkState {
    fn idle_reference(&self) -> Option<Instant> {
        match (self.last_frame_at, self.idle_baseline) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.next_attempt_at.map_or(true, |t| now >= t)
    }

    fn attempt_due(&self, now: Instant) -> bool {
        self.cooldown_elapsed(now) && self.backoff_until.map_or(true, |t| now >= t)
    }
}

struct ActiveConnection {
    port: String,
    generation: u64,
    stop: Arc<AtomicBool>,
    reader: Option<ThreadHandle<()>>,
}

/// Fault raised by a reader thread, picked up by the ensure-loop.
#[derive(Default)]
struct FaultLatch {
    pending: Mutex<Option<(u64, String)>>,
    wake: Notify,
}

impl FaultLatch {
    fn raise(&self, generation: u64, reason: String) {
        *lock(&self.pending) = Some((generation, reason));
        self.wake.notify_one();
    }

    fn take(&self) -> Option<(u64, String)> {
        lock(&self.pending).take()
    }
}

struct Runner {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Connected {
    port: String,
    rebound: bool,
    generation: u64,
}

pub struct LinkSupervisor {
    id: String,
    auto_rebind: bool,
    backend: Arc<dyn SerialBackend>,
    timings: LinkTimings,
    state: Mutex<LinkState>,
    handle: Mutex<Option<ActiveConnection>>,
    signals: Arc<FaultLatch>,
    chunks: mpsc::Sender<LinkChunk>,
    status: StatusReporter,
    runner: Mutex<Option<Runner>>,
}

impl LinkSupervisor {
    pub fn new(
        id: &str,
        requested_port: &str,
        auto_rebind: bool,
        backend: Arc<dyn SerialBackend>,
        timings: LinkTimings,
        chunks: mpsc::Sender<LinkChunk>,
        status: StatusReporter,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            auto_rebind,
            backend,
            timings,
            state: Mutex::new(LinkState {
                desired: false,
                phase: LinkPhase::Closed,
                requested_port: requested_port.to_string(),
                bound_port: None,
                last_frame_at: None,
                last_frame_utc: None,
                idle_baseline: None,
                next_attempt_at: None,
                backoff_until: None,
                last_nudge_at: None,
                grace_until: None,
                last_error: None,
                open_failures: 0,
                generation: 0,
            }),
            handle: Mutex::new(None),
            signals: Arc::new(FaultLatch::default()),
            chunks,
            status,
            runner: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mark the link as wanted and spawn the ensure-loop. Returns immediately; must be
    /// called from within a tokio runtime. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut runner = lock(&self.runner);
        if runner.is_some() {
            debug!("[{}] start ignored, supervisor already running", self.id);
            return;
        }
        {
            let mut st = lock(&self.state);
            st.desired = true;
            st.idle_baseline = Some(Instant::now());
            st.next_attempt_at = None;
            st.backoff_until = None;
            st.open_failures = 0;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.ensure_loop(shutdown_rx).await });
        *runner = Some(Runner { shutdown, task });
    }

    /// Cancel the ensure-loop (including any pending wait) and close the connection.
    /// When this returns no handle is open.
    pub async fn stop(self: &Arc<Self>) {
        lock(&self.state).desired = false;
        let runner = lock(&self.runner).take();
        if let Some(runner) = runner {
            let _ = runner.shutdown.send(true);
            if let Err(e) = runner.task.await {
                error!("[{}] ensure-loop ended abnormally: {}", self.id, e);
            }
        }
        self.close_async("stopped").await;
        self.signals.take();
        {
            let mut st = lock(&self.state);
            st.phase = LinkPhase::Closed;
            st.grace_until = None;
        }
        self.status.set(STATUS_STOPPED);
        info!("[{}] link stopped", self.id);
    }

    /// Nudge: clear the reconnect cooldown and wake the ensure-loop. Never opens or
    /// closes anything on the caller's thread. Further nudges within one cooldown window
    /// are coalesced, and an open-failure backoff is left alone.
    pub fn request_reconnect(&self, reason: &str) {
        {
            let mut st = lock(&self.state);
            if !st.desired {
                return;
            }
            let now = Instant::now();
            let recent = st
                .last_nudge_at
                .map_or(false, |t| now < t + self.timings.reconnect_cooldown);
            if recent {
                debug!("[{}] reconnect request coalesced: {}", self.id, reason);
                return;
            }
            st.last_nudge_at = Some(now);
            st.next_attempt_at = None;
        }
        debug!("[{}] reconnect requested: {}", self.id, reason);
        self.signals.wake.notify_one();
    }

    /// Called by the consumer for every successfully decoded frame.
    pub fn mark_frame(&self) {
        let recovered_port = {
            let mut st = lock(&self.state);
            st.last_frame_at = Some(Instant::now());
            st.last_frame_utc = Some(Utc::now());
            if st.phase == LinkPhase::OpenStale {
                st.phase = LinkPhase::OpenActive;
                st.bound_port.clone()
            } else {
                None
            }
        };
        if let Some(port) = recovered_port {
            info!("[{}] frames flowing again on {}", self.id, port);
            self.status.set(status_running(&port));
        }
    }

    /// Record a fault that did not come from the transport (e.g. persistence) and show
    /// `text` as the status.
    pub fn report_fault(&self, text: &str, message: impl Into<String>) {
        let record = ErrorRecord::now(message);
        lock(&self.state).last_error = Some(record.clone());
        self.status.fail(text, record);
    }

    /// Re-emit the status that matches the current phase (after an overlay such as
    /// "write error" is cleared).
    pub fn refresh_status(&self) {
        let (phase, port, desired) = {
            let st = lock(&self.state);
            (st.phase, st.bound_port.clone(), st.desired)
        };
        self.status.set(phase_status(phase, port.as_deref(), desired));
    }

    /// True when the user wants this link running, regardless of the physical state.
    pub fn wants_running(&self) -> bool {
        lock(&self.state).desired
    }

    /// True when a connection is physically open right now. Never waits on an open or
    /// close in progress.
    pub fn is_open(&self) -> bool {
        lock(&self.state).phase.is_open()
    }

    fn has_connection(&self) -> bool {
        lock(&self.handle).is_some()
    }

    pub fn last_frame_utc(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).last_frame_utc
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        let st = lock(&self.state);
        LinkSnapshot {
            id: self.id.clone(),
            phase: st.phase,
            desired: st.desired,
            requested_port: st.requested_port.clone(),
            bound_port: st.bound_port.clone(),
            last_frame_utc: st.last_frame_utc,
            last_error: st.last_error.clone(),
            open_failures: st.open_failures,
            generation: st.generation,
        }
    }

    async fn ensure_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "[{}] supervising link (port {:?}, auto-rebind {})",
            self.id,
            lock(&self.state).requested_port,
            self.auto_rebind
        );
        loop {
            self.ensure_once().await;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.signals.wake.notified() => {}
                _ = sleep(self.timings.poll_interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        debug!("[{}] ensure-loop terminated", self.id);
    }

    /// One supervision step.
    async fn ensure_once(self: &Arc<Self>) {
        if let Some((generation, reason)) = self.signals.take() {
            self.handle_fault(generation, reason).await;
        }
        if let Some(generation) = self.dead_reader() {
            self.handle_fault(generation, "reader thread exited".to_string())
                .await;
        }

        let now = Instant::now();
        if self.has_connection() {
            self.check_health(now).await;
        } else {
            self.try_connect(now).await;
        }
    }

    async fn handle_fault(self: &Arc<Self>, generation: u64, reason: String) {
        let current = lock(&self.handle).as_ref().map(|c| c.generation);
        if current != Some(generation) {
            debug!(
                "[{}] ignoring fault from connection #{}: {}",
                self.id, generation, reason
            );
            return;
        }
        warn!("[{}] transport fault: {}", self.id, reason);
        self.close_async(&reason).await;
        let record = ErrorRecord::now(reason);
        {
            let mut st = lock(&self.state);
            st.phase = LinkPhase::Closed;
            st.grace_until = None;
            // A fault accelerates the next attempt
            st.next_attempt_at = None;
            st.last_error = Some(record.clone());
        }
        self.status.fail(STATUS_RECONNECTING, record);
    }

    /// Generation of an open connection whose reader already exited.
    fn dead_reader(&self) -> Option<u64> {
        lock(&self.handle).as_ref().and_then(|c| {
            c.reader
                .as_ref()
                .filter(|r| r.is_finished())
                .map(|_| c.generation)
        })
    }

    async fn check_health(self: &Arc<Self>, now: Instant) {
        let reopen = {
            let mut st = lock(&self.state);
            if st.grace_until.map_or(false, |g| now < g) {
                st.phase = LinkPhase::OpenGrace;
                return;
            }
            st.grace_until = None;
            let idle = st
                .idle_reference()
                .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
            if idle < self.timings.idle_threshold {
                if st.phase != LinkPhase::OpenActive {
                    st.phase = LinkPhase::OpenActive;
                    debug!("[{}] link active", self.id);
                }
                return;
            }
            if st.phase != LinkPhase::OpenStale {
                st.phase = LinkPhase::OpenStale;
                warn!(
                    "[{}] no valid frame for {}s, link considered stale",
                    self.id,
                    idle.as_secs()
                );
                self.status.set(STATUS_STALE);
            }
            st.cooldown_elapsed(now)
        };

        if reopen {
            info!("[{}] recycling stale connection", self.id);
            self.close_async("idle").await;
            lock(&self.state).phase = LinkPhase::Closed;
            self.try_connect(now).await;
        }
    }

    async fn try_connect(self: &Arc<Self>, now: Instant) {
        let requested = {
            let mut st = lock(&self.state);
            if !st.desired || !st.attempt_due(now) {
                return;
            }
            st.phase = LinkPhase::Opening;
            st.requested_port.clone()
        };

        let this = Arc::clone(self);
        let result = match tokio::task::spawn_blocking(move || this.connect_blocking()).await {
            Ok(r) => r,
            Err(e) => Err(LinkError::Open {
                port: requested.clone(),
                reason: format!("open task failed: {e}"),
            }),
        };

        let now = Instant::now();
        match result {
            Ok(conn) => {
                {
                    let mut st = lock(&self.state);
                    st.phase = LinkPhase::OpenGrace;
                    st.grace_until = Some(now + self.timings.grace_period);
                    st.next_attempt_at = Some(now + self.timings.reconnect_cooldown);
                    st.backoff_until = None;
                    st.open_failures = 0;
                    st.bound_port = Some(conn.port.clone());
                }
                if conn.rebound {
                    warn!(
                        "[{}] configured port {:?} not present, rebound to {}",
                        self.id, requested, conn.port
                    );
                }
                info!(
                    "[{}] opened {} at {} baud (connection #{})",
                    self.id, conn.port, BAUD_RATE, conn.generation
                );
                self.status.set(status_running(&conn.port));
            }
            Err(LinkError::NoPort { .. }) => {
                {
                    let mut st = lock(&self.state);
                    st.phase = LinkPhase::Closed;
                    st.next_attempt_at = Some(now + self.timings.reconnect_cooldown);
                }
                debug!("[{}] no suitable port for {:?}", self.id, requested);
                self.status.set(STATUS_WAITING);
            }
            Err(e) => {
                let failures;
                {
                    let mut st = lock(&self.state);
                    st.open_failures = st.open_failures.saturating_add(1);
                    failures = st.open_failures;
                    let delay = open_backoff(
                        failures,
                        self.timings.reconnect_cooldown,
                        self.timings.open_backoff_max,
                    )
                    .max(self.timings.reconnect_cooldown);
                    st.phase = LinkPhase::Closed;
                    st.next_attempt_at = Some(now + self.timings.reconnect_cooldown);
                    st.backoff_until = Some(now + delay);
                }
                warn!("[{}] {} (failure #{})", self.id, e, failures);
                let record = ErrorRecord::now(e.to_string());
                lock(&self.state).last_error = Some(record.clone());
                self.status.fail(STATUS_RECONNECTING, record);
            }
        }
    }

    /// Enumerate, choose and open a port, then start its reader. Runs on the blocking pool.
    fn connect_blocking(self: Arc<Self>) -> Result<Connected, LinkError> {
        let available = self.backend.available_ports()?;
        let (requested, bound, retrying) = {
            let st = lock(&self.state);
            (
                st.requested_port.clone(),
                st.bound_port.clone(),
                st.open_failures > 0,
            )
        };
        let choice = select_port(&requested, bound.as_deref(), &available, self.auto_rebind)
            .ok_or_else(|| LinkError::NoPort {
                requested: requested.clone(),
            })?;

        let mut handle = lock(&self.handle);
        if let Some(active) = handle.as_ref() {
            warn!(
                "[{}] connect while connection #{} is open, keeping it",
                self.id, active.generation
            );
            return Ok(Connected {
                port: active.port.clone(),
                rebound: false,
                generation: active.generation,
            });
        }

        if !retrying {
            self.status.set(status_opening(&choice.port));
        }
        let stream = self
            .backend
            .open(&choice.port, BAUD_RATE, self.timings.read_timeout)?;
        let generation = {
            let mut st = lock(&self.state);
            st.generation += 1;
            st.generation
        };

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = ReaderContext {
            id: self.id.clone(),
            port: Arc::from(choice.port.as_str()),
            generation,
            stop: Arc::clone(&stop),
            chunks: self.chunks.clone(),
            signals: Arc::clone(&self.signals),
        };
        let reader = std::thread::Builder::new()
            .name(format!("rx-{}", self.id))
            .spawn(move || read_loop(stream, ctx))
            .map_err(|source| LinkError::Io {
                port: choice.port.clone(),
                source,
            })?;

        *handle = Some(ActiveConnection {
            port: choice.port.clone(),
            generation,
            stop,
            reader: Some(reader),
        });
        Ok(Connected {
            port: choice.port,
            rebound: choice.rebound,
            generation,
        })
    }

    /// Close the current connection (if any) and wait for its reader to finish.
    fn close_blocking(&self, reason: &str) -> bool {
        let mut handle = lock(&self.handle);
        let Some(mut conn) = handle.take() else {
            return false;
        };
        conn.stop.store(true, Ordering::Release);
        if let Some(reader) = conn.reader.take() {
            if reader.join().is_err() {
                error!("[{}] reader thread for {} panicked", self.id, conn.port);
            }
        }
        info!(
            "[{}] closed {} (connection #{}): {}",
            self.id, conn.port, conn.generation, reason
        );
        true
    }

    async fn close_async(self: &Arc<Self>, reason: &str) {
        let this = Arc::clone(self);
        let reason = reason.to_string();
        if let Err(e) = tokio::task::spawn_blocking(move || this.close_blocking(&reason)).await {
            error!("[{}] close task failed: {}", self.id, e);
        }
    }
}

fn phase_status(phase: LinkPhase, port: Option<&str>, desired: bool) -> String {
    match (phase, port) {
        _ if !desired => STATUS_STOPPED.to_string(),
        (LinkPhase::OpenGrace | LinkPhase::OpenActive, Some(p)) => status_running(p),
        (LinkPhase::OpenStale, _) => STATUS_STALE.to_string(),
        (LinkPhase::Opening, Some(p)) => status_opening(p),
        _ => STATUS_WAITING.to_string(),
    }
}

struct ReaderContext {
    id: String,
    port: Arc<str>,
    generation: u64,
    stop: Arc<AtomicBool>,
    chunks: mpsc::Sender<LinkChunk>,
    signals: Arc<FaultLatch>,
}

/// Blocking read loop of one connection. Owns the stream; dropping it closes the port.
fn read_loop(mut stream: Box<dyn SerialStream>, ctx: ReaderContext) {
    debug!("[{}] reader started on {}", ctx.id, ctx.port);
    let mut buf = [0u8; READ_BUF_SIZE];
    while !ctx.stop.load(Ordering::Acquire) {
        match stream.read(&mut buf) {
            Ok(0) => std::thread::sleep(Duration::from_millis(10)),
            Ok(n) => {
                trace!("[{}] rx {} bytes: {}", ctx.id, n, hex_preview(&buf[..n], 48));
                let chunk = LinkChunk {
                    generation: ctx.generation,
                    port: Arc::clone(&ctx.port),
                    bytes: buf[..n].to_vec(),
                };
                if ctx.chunks.blocking_send(chunk).is_err() {
                    debug!("[{}] chunk consumer gone, reader exiting", ctx.id);
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if !ctx.stop.load(Ordering::Acquire) {
                    ctx.signals
                        .raise(ctx.generation, format!("read error on {}: {}", ctx.port, e));
                }
                break;
            }
        }
    }
    debug!("[{}] reader on {} finished", ctx.id, ctx.port);
}
