//! # comlogger - self-healing serial measurement logger
//!
//! A measurement device streams ASCII frames over a serial line at 9600 baud. This crate
//! keeps that link alive unattended (unplug/replug, port renumbering, silent devices),
//! decodes every frame and keeps only the most recent reading on disk, atomically, in
//! `lastvalue.txt` inside a configured folder.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use comlogger::engine::{ComLogger, EngineSettings};
//! use comlogger::serial::SystemSerial;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = ComLogger::new(
//!         EngineSettings::new("probe-1", "/dev/ttyUSB0", "./data"),
//!         Arc::new(SystemSerial),
//!         None,
//!     );
//!     engine.start();
//!     tokio::signal::ctrl_c().await.ok();
//!     engine.stop().await;
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`frame`] - frame grammar, canonical output line and stream reassembly
//! - [`store`] - crash-safe single-value file
//! - [`link`] - connection state machine (open, grace, idle, rebind, backoff)
//! - [`serial`] - transport seam with the real and the in-memory backend
//! - [`engine`] - one complete pipeline per configured port
//! - [`events`] - status and live-row notifications
//! - [`hotplug`] - device arrival/removal polling
//! - [`config`] - TOML configuration
//! - [`logutil`] - safe previews of raw device bytes for log lines
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   chunks   ┌─────────────────┐   line   ┌─────────────────┐
//! │ LinkSupervisor  │ ─────────> │   FramePump     │ ───────> │ LastValueStore  │
//! │ (port handle)   │ <───────── │  (assembler)    │          │ (lastvalue.txt) │
//! └─────────────────┘ mark_frame └─────────────────┘          └─────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod events;
pub mod frame;
pub mod hotplug;
pub mod link;
pub mod logutil;
pub mod serial;
pub mod store;
mod sync;
