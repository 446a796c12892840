//! Structured sidecar logging.
//!
//! The channel, scheduler and reset policy report what they do as
//! [`SidecarEvent`]s. The binary routes them to `tracing`; tests plug in a
//! recorder to assert on them.

use std::fmt;
use std::net::SocketAddr;

use crate::config::Transport;

/// Structured log entry.
#[derive(Debug, Clone)]
pub struct SidecarLog {
    pub component: &'static str,
    pub event: SidecarEvent,
}

/// Events worth logging.
#[derive(Debug, Clone)]
pub enum SidecarEvent {
    /// Side channel bound (datagram) or accepted (stream).
    ChannelOpened {
        transport: Transport,
        local: SocketAddr,
    },
    /// Stream peer went away; the transfer continues without quacks.
    ChannelClosed {
        transport: Transport,
        local: SocketAddr,
    },
    /// A complete record arrived and decoded.
    QuackReceived {
        seq: u64,
        count: u32,
        len: usize,
        from: SocketAddr,
        head: String,
    },
    /// Quack handed to the live connection and egress flushed.
    QuackApplied {
        seq: u64,
        count: u32,
    },
    /// No connection to apply the quack to yet.
    QuackDropped {
        seq: u64,
        reason: &'static str,
    },
    ResetSent {
        epoch: u32,
        to: SocketAddr,
    },
    ResetFailed {
        epoch: u32,
        to: SocketAddr,
        message: String,
    },
    /// Engine never reported a descriptor within the bootstrap budget.
    BootstrapExhausted {
        steps: u32,
    },
    /// Engine reported zero running transfers.
    LoopFinished {
        iterations: u64,
        quacks: u64,
        resets: u64,
    },
}

impl fmt::Display for SidecarEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelOpened { transport, local } => {
                write!(f, "channel_opened transport={} local={}", transport, local)
            }
            Self::ChannelClosed { transport, local } => {
                write!(f, "channel_closed transport={} local={}", transport, local)
            }
            Self::QuackReceived { seq, count, len, from, head } => {
                write!(f, "quack_received seq={} count={} len={} from={} head={}", seq, count, len, from, head)
            }
            Self::QuackApplied { seq, count } => {
                write!(f, "quack_applied seq={} count={}", seq, count)
            }
            Self::QuackDropped { seq, reason } => {
                write!(f, "quack_dropped seq={} reason={}", seq, reason)
            }
            Self::ResetSent { epoch, to } => {
                write!(f, "reset_sent epoch={} to={}", epoch, to)
            }
            Self::ResetFailed { epoch, to, message } => {
                write!(f, "reset_failed epoch={} to={}: {}", epoch, to, message)
            }
            Self::BootstrapExhausted { steps } => {
                write!(f, "bootstrap_exhausted steps={}", steps)
            }
            Self::LoopFinished { iterations, quacks, resets } => {
                write!(f, "loop_finished iterations={} quacks={} resets={}", iterations, quacks, resets)
            }
        }
    }
}

/// Sink for sidecar log entries.
pub trait SidecarLogger: Send + Sync {
    fn log(&self, entry: SidecarLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl SidecarLogger for TracingLogger {
    fn log(&self, entry: SidecarLog) {
        // Lifecycle at info, per-quack traffic at debug
        match &entry.event {
            SidecarEvent::ResetFailed { .. } | SidecarEvent::ChannelClosed { .. } => {
                tracing::warn!(component = entry.component, "{}", entry.event);
            }
            SidecarEvent::ChannelOpened { .. }
            | SidecarEvent::BootstrapExhausted { .. }
            | SidecarEvent::LoopFinished { .. } => {
                tracing::info!(component = entry.component, "{}", entry.event);
            }
            _ => {
                tracing::debug!(component = entry.component, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl SidecarLogger for NullLogger {
    fn log(&self, _entry: SidecarLog) {}
}

/// Hex preview of the first bytes of a record, for debug output.
pub(crate) fn head_hex(raw: &[u8]) -> String {
    const PREVIEW: usize = 8;
    let shown = &raw[..raw.len().min(PREVIEW)];
    if raw.len() > PREVIEW {
        format!("{}..", hex::encode(shown))
    } else {
        hex::encode(shown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_hex_truncates() {
        assert_eq!(head_hex(&[0xde, 0xad]), "dead");
        assert_eq!(head_hex(&[0u8; 12]), "0000000000000000..");
    }

    #[test]
    fn display_is_key_value() {
        let event = SidecarEvent::ResetSent {
            epoch: 3,
            to: "127.0.0.1:5104".parse().unwrap(),
        };
        assert_eq!(event.to_string(), "reset_sent epoch=3 to=127.0.0.1:5104");
    }
}
