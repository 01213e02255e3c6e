//! # Serial Transport
//!
//! The link supervisor never talks to `serialport` directly; it goes through
//! [`SerialBackend`], which has two implementations:
//!
//! - [`SystemSerial`] (feature `serial`): real ports via the `serialport` crate,
//!   8N1, no flow control, short read timeout so reader threads stay responsive to stop.
//! - [`mock::MockSerial`]: an in-memory port table for tests and dry runs, with
//!   scriptable plug/unplug, open failures and byte feeds.
//!
//! Port listings are always returned in deterministic order (see [`sort_port_names`]),
//! which is what auto-rebind relies on to pick "the lowest" port.
use std::io::{self, Read};
use std::time::Duration;

use thiserror::Error;

pub mod mock;

/// Fixed line speed of the measurement device.
pub const BAUD_RATE: u32 = 9600;

/// Default blocking-read timeout; bounds how long closing a connection can take.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Transport faults. None of these escape the engine; they end up in status and logs.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no serial port available (configured {requested:?})")]
    NoPort { requested: String },
    #[error("cannot enumerate serial ports: {0}")]
    Enumerate(String),
    #[error("cannot open serial port {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("serial I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: io::Error,
    },
}

/// Byte source produced by an opened port. Reads block for at most the read timeout and
/// report `TimedOut`/`WouldBlock` when no data arrived.
pub trait SerialStream: Read + Send {}

impl<T: Read + Send + ?Sized> SerialStream for T {}

pub trait SerialBackend: Send + Sync {
    /// Names of the ports present right now, sorted with [`sort_port_names`].
    fn available_ports(&self) -> Result<Vec<String>, LinkError>;

    /// Open `port` with the fixed 8N1 settings.
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialStream>, LinkError>;
}

/// Port names compare by their non-numeric stem, then by the trailing number, so that
/// `COM3 < COM10` and `/dev/ttyUSB2 < /dev/ttyUSB10`.
fn port_sort_key(name: &str) -> (String, Option<u64>, String) {
    let stem_len = name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (stem, digits) = name.split_at(stem_len);
    (stem.to_ascii_lowercase(), digits.parse().ok(), name.to_string())
}

pub fn sort_port_names(names: &mut Vec<String>) {
    names.sort_by_cached_key(|n| port_sort_key(n));
    names.dedup();
}

/// Port identity comparison; Windows device names are case-insensitive.
pub fn same_port(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// Real serial ports through the `serialport` crate.
#[cfg(feature = "serial")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerial;

#[cfg(feature = "serial")]
impl SerialBackend for SystemSerial {
    fn available_ports(&self) -> Result<Vec<String>, LinkError> {
        let ports =
            serialport::available_ports().map_err(|e| LinkError::Enumerate(e.to_string()))?;
        let mut names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
        sort_port_names(&mut names);
        Ok(names)
    }

    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialStream>, LinkError> {
        log::debug!("Opening serial port {} at {} baud", port, baud_rate);
        let mut serial = serialport::new(port, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(read_timeout)
            .open()
            .map_err(|e| LinkError::Open {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        // Some USB bridges only start forwarding once DTR is asserted
        let _ = serial.write_data_terminal_ready(true);
        // Drop whatever the driver buffered before we attached
        let _ = serial.clear(serialport::ClearBuffer::Input);
        Ok(Box::new(serial))
    }
}
