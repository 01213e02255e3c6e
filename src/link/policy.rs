//! Pure decisions of the link supervisor: which port to open and how long to back off.
use std::time::Duration;

use rand::Rng;

use crate::serial::{same_port, sort_port_names};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortChoice {
    pub port: String,
    /// True when the chosen port is not the one the user asked for.
    pub rebound: bool,
}

/// Pick the port to open from the ports present right now.
///
/// Preference order: the requested port; with auto-rebind, the port we were last rebound
/// to, then the lowest available port.
pub fn select_port(
    requested: &str,
    bound: Option<&str>,
    available: &[String],
    auto_rebind: bool,
) -> Option<PortChoice> {
    let present = |name: &str| available.iter().find(|p| same_port(p, name));

    if !requested.is_empty() {
        if let Some(port) = present(requested) {
            return Some(PortChoice {
                port: port.clone(),
                rebound: false,
            });
        }
    }
    if !auto_rebind {
        return None;
    }
    if let Some(port) = bound.and_then(|b| present(b)) {
        return Some(PortChoice {
            port: port.clone(),
            rebound: true,
        });
    }
    let mut sorted = available.to_vec();
    sort_port_names(&mut sorted);
    sorted.into_iter().next().map(|port| PortChoice {
        port,
        rebound: true,
    })
}

/// Delay after the `failures`-th consecutive failed open: `base * 2^(failures-1)` plus up
/// to 20% jitter, never above `max`.
pub fn open_backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let shift = (failures - 1).min(16);
    let exp = base.saturating_mul(1u32 << shift).min(max);
    let jitter_cap = (exp.as_millis() / 5) as u64;
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
    (exp + jitter).min(max)
}
