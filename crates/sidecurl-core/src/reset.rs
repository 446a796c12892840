//! Reset signals toward the observer.
//!
//! ```text
//! [0..2]   Magic "QR"
//! [2..6]   Reset epoch (u32 BE), first reset is 1
//! ```
//!
//! The schedule is fixed-rate: resets are due every `interval` from the
//! moment the loop starts. A loop that falls more than one interval behind
//! sends once and re-anchors on the current time instead of bursting.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::ResetConfig;

pub const RESET_MAGIC: [u8; 2] = *b"QR";

pub const RESET_SIGNAL_LEN: usize = 6;

/// One reset signal ready to go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSignal {
    pub epoch: u32,
    pub to: SocketAddr,
}

impl ResetSignal {
    pub fn encode(&self) -> [u8; RESET_SIGNAL_LEN] {
        let mut buf = [0u8; RESET_SIGNAL_LEN];
        buf[0..2].copy_from_slice(&RESET_MAGIC);
        buf[2..6].copy_from_slice(&self.epoch.to_be_bytes());
        buf
    }

    /// Parse the epoch out of a reset datagram. Returns None if the magic or
    /// length doesn't match.
    pub fn parse_epoch(buf: &[u8]) -> Option<u32> {
        if buf.len() != RESET_SIGNAL_LEN || buf[0..2] != RESET_MAGIC {
            return None;
        }
        Some(u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]))
    }
}

/// Decides when the next reset is due.
#[derive(Debug, Clone)]
pub struct ResetPolicy {
    interval: Duration,
    destination: SocketAddr,
    next_due: Instant,
    epoch: u32,
}

impl ResetPolicy {
    /// None when resets are disabled.
    pub fn new(config: &ResetConfig, now: Instant) -> Option<Self> {
        if !config.enabled || config.interval.is_zero() {
            return None;
        }
        Some(Self {
            interval: config.interval,
            destination: config.destination(),
            next_due: now + config.interval,
            epoch: 0,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Epoch of the last signal handed out (0 before the first).
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    /// Time left until the next reset; zero if already due.
    pub fn until_due(&self, now: Instant) -> Duration {
        self.next_due.saturating_duration_since(now)
    }

    /// Hand out the next signal and schedule the one after it.
    pub fn next_signal(&mut self, now: Instant) -> ResetSignal {
        self.epoch = self.epoch.wrapping_add(1);
        self.next_due += self.interval;
        if self.next_due <= now {
            self.next_due = now + self.interval;
        }
        ResetSignal {
            epoch: self.epoch,
            to: self.destination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(interval_ms: u64) -> ResetConfig {
        ResetConfig {
            enabled: true,
            interval: Duration::from_millis(interval_ms),
            ..Default::default()
        }
    }

    #[test]
    fn disabled_has_no_policy() {
        assert!(ResetPolicy::new(&ResetConfig::default(), Instant::now()).is_none());
    }

    #[test]
    fn first_reset_one_interval_after_start() {
        let start = Instant::now();
        let policy = ResetPolicy::new(&config(10), start).unwrap();
        assert!(!policy.is_due(start));
        assert_eq!(policy.until_due(start), Duration::from_millis(10));
        assert!(policy.is_due(start + Duration::from_millis(10)));
        assert_eq!(policy.until_due(start + Duration::from_millis(30)), Duration::ZERO);
    }

    #[test]
    fn fixed_rate_schedule() {
        let start = Instant::now();
        let mut policy = ResetPolicy::new(&config(10), start).unwrap();

        // Woken 2ms late each time: the schedule does not drift.
        let signal = policy.next_signal(start + Duration::from_millis(12));
        assert_eq!(signal.epoch, 1);
        assert_eq!(policy.until_due(start + Duration::from_millis(12)), Duration::from_millis(8));

        let signal = policy.next_signal(start + Duration::from_millis(22));
        assert_eq!(signal.epoch, 2);
        assert!(policy.is_due(start + Duration::from_millis(30)));
    }

    #[test]
    fn falling_behind_does_not_burst() {
        let start = Instant::now();
        let mut policy = ResetPolicy::new(&config(10), start).unwrap();

        let late = start + Duration::from_millis(55);
        policy.next_signal(late);
        assert!(!policy.is_due(late));
        assert_eq!(policy.until_due(late), Duration::from_millis(10));
    }

    #[test]
    fn signal_wire_format() {
        let signal = ResetSignal {
            epoch: 0x0a0b_0c0d,
            to: "127.0.0.1:5104".parse().unwrap(),
        };
        let buf = signal.encode();
        assert_eq!(buf, [b'Q', b'R', 0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(ResetSignal::parse_epoch(&buf), Some(0x0a0b_0c0d));
        assert_eq!(ResetSignal::parse_epoch(&buf[..5]), None);
        assert_eq!(ResetSignal::parse_epoch(b"XX\0\0\0\x01"), None);
    }

    #[test]
    fn destination_from_config() {
        let mut policy = ResetPolicy::new(
            &ResetConfig {
                enabled: true,
                host: "10.0.0.7".parse().unwrap(),
                port: 6000,
                interval: Duration::from_millis(5),
            },
            Instant::now(),
        )
        .unwrap();
        let signal = policy.next_signal(Instant::now() + Duration::from_millis(5));
        assert_eq!(signal.to, "10.0.0.7:6000".parse().unwrap());
        assert_eq!(policy.epoch(), 1);
    }
}
