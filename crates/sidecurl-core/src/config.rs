//! Sidecar configuration.
//!
//! Built once at startup (CLI flags, environment, or `Default`) and then
//! only ever borrowed. Everything the observer protocol needs lives in
//! [`SidecarConfig`]; the accounting knobs the engine interprets are handed
//! over as a [`QuackParams`] view and never looked at by the decoder.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::quack::{MAX_QUACK_DATAGRAM, QUACK_COUNT_LEN};
use crate::{DEFAULT_SIDECAR_PORT, Error, Result};

/// Port the observer listens on for reset signals.
pub const DEFAULT_RESET_PORT: u16 = 5104;

/// Stream record size: a bare 32-bit count.
pub const DEFAULT_RECORD_SIZE: usize = 4;

/// Largest stream record accepted (same bound as a datagram quack).
pub const MAX_RECORD_SIZE: usize = MAX_QUACK_DATAGRAM;

/// Upper bound on a single readiness wait.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Minimum spacing between two reset signals.
pub const DEFAULT_RESET_INTERVAL: Duration = Duration::from_millis(100);

/// Packets that may arrive out of order before one is declared lost.
pub const DEFAULT_REORDER_THRESHOLD: u32 = 3;

/// Wire variant of the side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// One quack per UDP datagram.
    Datagram,
    /// Fixed-size quack records on an accepted TCP stream.
    Stream,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datagram => f.write_str("udp"),
            Self::Stream => f.write_str("tcp"),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" | "datagram" => Ok(Self::Datagram),
            "tcp" | "stream" => Ok(Self::Stream),
            other => Err(format!("unknown sidecar transport '{}' (expected udp or tcp)", other)),
        }
    }
}

/// Reset signal policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetConfig {
    pub enabled: bool,
    /// Observer host that receives reset signals.
    pub host: IpAddr,
    pub port: u16,
    /// Minimum time between two resets.
    pub interval: Duration,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_RESET_PORT,
            interval: DEFAULT_RESET_INTERVAL,
        }
    }
}

impl ResetConfig {
    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Full sidecar configuration. Immutable once the transfer starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarConfig {
    /// Quack count that triggers engine action. `<= 0` disables the sidecar.
    pub threshold: i32,
    pub transport: Transport,
    /// Address the side channel binds to.
    pub listen_addr: SocketAddr,
    /// Stream variant only: bytes per quack record.
    pub record_size: usize,
    /// Treat packets confirmed by a quack as acknowledged.
    pub mark_acked: bool,
    /// Treat packets missing from a quack as lost and retransmit them.
    pub mark_lost: bool,
    /// Shrink the congestion window on quack-detected loss.
    pub update_cwnd: bool,
    /// One-way delay sender -> observer.
    pub near_delay: Duration,
    /// End-to-end delay sender -> receiver.
    pub e2e_delay: Duration,
    pub reorder_threshold: u32,
    /// Opaque encoding style tag, forwarded to the engine untouched.
    pub quack_style: Option<String>,
    /// Congestion controller name (cubic, reno, bbr), forwarded untouched.
    pub congestion_control: Option<String>,
    /// Network interface the engine's sidecar traffic is bound to.
    pub sidecar_interface: Option<String>,
    /// Only emit data when the congestion window exceeds one MTU.
    pub mtu_gating: bool,
    pub min_ack_delay: Option<Duration>,
    pub max_ack_delay: Option<Duration>,
    pub reset: ResetConfig,
    pub poll_timeout: Duration,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            threshold: 0,
            transport: Transport::Datagram,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_SIDECAR_PORT),
            record_size: DEFAULT_RECORD_SIZE,
            mark_acked: false,
            mark_lost: false,
            update_cwnd: false,
            near_delay: Duration::ZERO,
            e2e_delay: Duration::ZERO,
            reorder_threshold: DEFAULT_REORDER_THRESHOLD,
            quack_style: None,
            congestion_control: None,
            sidecar_interface: None,
            mtu_gating: false,
            min_ack_delay: None,
            max_ack_delay: None,
            reset: ResetConfig::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl SidecarConfig {
    /// Whether the side channel should be opened at all.
    pub fn is_enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Whether reset signals will be emitted.
    pub fn resets_enabled(&self) -> bool {
        self.is_enabled() && self.reset.enabled
    }

    /// Largest record the decoder accepts for the configured transport.
    pub fn max_record_len(&self) -> usize {
        match self.transport {
            Transport::Datagram => MAX_QUACK_DATAGRAM,
            Transport::Stream => self.record_size,
        }
    }

    /// Engine-facing view of the accounting options.
    pub fn params(&self) -> QuackParams<'_> {
        QuackParams {
            threshold: self.threshold.max(0) as u32,
            mark_acked: self.mark_acked,
            mark_lost: self.mark_lost,
            update_cwnd: self.update_cwnd,
            near_delay: self.near_delay,
            e2e_delay: self.e2e_delay,
            reorder_threshold: self.reorder_threshold,
            quack_style: self.quack_style.as_deref(),
            congestion_control: self.congestion_control.as_deref(),
            sidecar_interface: self.sidecar_interface.as_deref(),
            mtu_gating: self.mtu_gating,
            min_ack_delay: self.min_ack_delay,
            max_ack_delay: self.max_ack_delay,
        }
    }

    /// Reject combinations the channel or loop cannot run with.
    /// A disabled sidecar is always valid.
    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout.is_zero() {
            return Err(Error::Config("poll timeout must be non-zero".into()));
        }
        if !self.is_enabled() {
            return Ok(());
        }
        if self.transport == Transport::Stream
            && !(QUACK_COUNT_LEN..=MAX_RECORD_SIZE).contains(&self.record_size)
        {
            return Err(Error::Config(format!(
                "record size {} outside {}..={}",
                self.record_size, QUACK_COUNT_LEN, MAX_RECORD_SIZE
            )));
        }
        if self.reset.enabled {
            if self.reset.interval.is_zero() {
                return Err(Error::Config("reset interval must be non-zero".into()));
            }
            if self.reset.port == 0 {
                return Err(Error::Config("reset port must be non-zero".into()));
            }
        }
        if let (Some(min), Some(max)) = (self.min_ack_delay, self.max_ack_delay) {
            if min > max {
                return Err(Error::Config(format!(
                    "min ack delay {:?} exceeds max ack delay {:?}",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

/// Accounting options the engine applies when a quack lands.
///
/// Passed through verbatim: nothing here changes how a record is framed or
/// decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuackParams<'a> {
    pub threshold: u32,
    pub mark_acked: bool,
    pub mark_lost: bool,
    pub update_cwnd: bool,
    pub near_delay: Duration,
    pub e2e_delay: Duration,
    pub reorder_threshold: u32,
    pub quack_style: Option<&'a str>,
    pub congestion_control: Option<&'a str>,
    pub sidecar_interface: Option<&'a str>,
    pub mtu_gating: bool,
    pub min_ack_delay: Option<Duration>,
    pub max_ack_delay: Option<Duration>,
}
