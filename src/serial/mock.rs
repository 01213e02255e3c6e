//! In-memory serial backend.
//!
//! Behaves like a small USB hub: ports can be plugged and unplugged, opens can be made to
//! fail, and bytes pushed to a port are delivered to whichever stream has it open. An
//! unplug invalidates open streams, whose next read fails like a yanked USB adapter.
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{sort_port_names, LinkError, SerialBackend, SerialStream};
use crate::sync::lock;

#[derive(Default)]
struct MockPort {
    // Bumped on every plug so streams from a previous plug-in can tell they are stale
    plug_id: u64,
    fail_open: bool,
    open_delay: Duration,
    pending: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct MockState {
    ports: BTreeMap<String, MockPort>,
    next_plug_id: u64,
    opens: u64,
    active: usize,
    open_history: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockSerial {
    state: Arc<Mutex<MockState>>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ports<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for name in names {
            mock.plug(name);
        }
        mock
    }

    /// Make a port appear (again). Any stream left over from an earlier plug-in stays dead.
    pub fn plug(&self, name: impl Into<String>) {
        let mut st = lock(&self.state);
        st.next_plug_id += 1;
        let plug_id = st.next_plug_id;
        st.ports.insert(
            name.into(),
            MockPort {
                plug_id,
                ..MockPort::default()
            },
        );
    }

    pub fn unplug(&self, name: &str) {
        lock(&self.state).ports.remove(name);
    }

    pub fn set_open_failure(&self, name: &str, fail: bool) {
        if let Some(port) = lock(&self.state).ports.get_mut(name) {
            port.fail_open = fail;
        }
    }

    /// Make opens of a port take `delay`, like a slow driver.
    pub fn set_open_delay(&self, name: &str, delay: Duration) {
        if let Some(port) = lock(&self.state).ports.get_mut(name) {
            port.open_delay = delay;
        }
    }

    /// Queue bytes on a present port. Returns false if the port is not plugged in.
    pub fn push(&self, name: &str, bytes: impl AsRef<[u8]>) -> bool {
        match lock(&self.state).ports.get_mut(name) {
            Some(port) => {
                port.pending.push_back(bytes.as_ref().to_vec());
                true
            }
            None => false,
        }
    }

    /// Successful opens since creation.
    pub fn open_count(&self) -> u64 {
        lock(&self.state).opens
    }

    /// Streams currently alive (opened and not yet dropped).
    pub fn active_streams(&self) -> usize {
        lock(&self.state).active
    }

    /// Port names in the order they were successfully opened.
    pub fn open_history(&self) -> Vec<String> {
        lock(&self.state).open_history.clone()
    }
}

impl SerialBackend for MockSerial {
    fn available_ports(&self) -> Result<Vec<String>, LinkError> {
        let mut names: Vec<String> = lock(&self.state).ports.keys().cloned().collect();
        sort_port_names(&mut names);
        Ok(names)
    }

    fn open(
        &self,
        port: &str,
        _baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialStream>, LinkError> {
        let delay = lock(&self.state)
            .ports
            .get(port)
            .map_or(Duration::ZERO, |p| p.open_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut st = lock(&self.state);
        let plug_id = match st.ports.get_mut(port) {
            None => {
                return Err(LinkError::Open {
                    port: port.to_string(),
                    reason: "No such file or directory".to_string(),
                })
            }
            Some(p) if p.fail_open => {
                return Err(LinkError::Open {
                    port: port.to_string(),
                    reason: "Device or resource busy".to_string(),
                })
            }
            Some(p) => {
                p.pending.clear();
                p.plug_id
            }
        };
        st.opens += 1;
        st.active += 1;
        st.open_history.push(port.to_string());
        Ok(Box::new(MockStream {
            state: Arc::clone(&self.state),
            port: port.to_string(),
            plug_id,
            poll: read_timeout.min(Duration::from_millis(20)),
            carry: Vec::new(),
        }))
    }
}

struct MockStream {
    state: Arc<Mutex<MockState>>,
    port: String,
    plug_id: u64,
    poll: Duration,
    carry: Vec<u8>,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.carry.is_empty() {
            let next = {
                let mut st = lock(&self.state);
                match st.ports.get_mut(&self.port) {
                    Some(p) if p.plug_id == self.plug_id => p.pending.pop_front(),
                    _ => {
                        return Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "device disconnected",
                        ))
                    }
                }
            };
            match next {
                Some(chunk) => self.carry = chunk,
                None => {
                    std::thread::sleep(self.poll);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
                }
            }
        }
        let n = self.carry.len().min(buf.len());
        buf[..n].copy_from_slice(&self.carry[..n]);
        self.carry.drain(..n);
        Ok(n)
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        let mut st = lock(&self.state);
        st.active = st.active.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unplug_breaks_open_stream() {
        let mock = MockSerial::with_ports(["COM1"]);
        let mut stream = mock.open("COM1", 9600, Duration::from_millis(5)).unwrap();
        assert!(mock.push("COM1", b"abc"));
        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(stream.read(&mut buf).unwrap(), 1);
        assert_eq!(
            stream.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );

        mock.unplug("COM1");
        assert_eq!(
            stream.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        // Re-plugging does not revive the old stream
        mock.plug("COM1");
        assert!(stream.read(&mut buf).is_err());
        drop(stream);
        assert_eq!(mock.active_streams(), 0);
        assert_eq!(mock.open_count(), 1);
    }

    #[test]
    fn open_failures_are_reported() {
        let mock = MockSerial::with_ports(["COM1"]);
        mock.set_open_failure("COM1", true);
        assert!(matches!(
            mock.open("COM1", 9600, Duration::from_millis(5)),
            Err(LinkError::Open { .. })
        ));
        assert!(mock.open("COM9", 9600, Duration::from_millis(5)).is_err());
        assert_eq!(mock.open_count(), 0);
    }
}
