//! Boundary between the sidecar loop and the transfer engine.
//!
//! The engine owns every bit of connection state. The loop only asks it for
//! readiness, drives it one step at a time, and pushes quacks into its live
//! connection through [`apply_digest`] followed by [`flush_egress`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::config::QuackParams;
use crate::poll::InterestSet;
use crate::quack::Quack;

/// Failures reported by an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transfer timed out after {0:?}")]
    TimedOut(Duration),
}

/// Receives quacks. Implemented by the engine's connection type.
pub trait QuackSink {
    /// Update loss/ack/retransmit/cwnd state from a quack. Must not block.
    fn recv_quack(&mut self, quack: &Quack, from: SocketAddr);
}

/// What the sidecar loop needs from a transfer engine.
pub trait TransferEngine {
    type Connection: QuackSink;

    /// Forward the accounting options once, before the first step. Only
    /// called when the side channel is open.
    fn configure_sidecar(&mut self, params: &QuackParams<'_>) -> Result<(), EngineError> {
        let _ = params;
        Ok(())
    }

    /// Register the descriptors the engine is waiting on. Returns the longest
    /// the engine is willing to wait before its next step, if it cares.
    fn register_interest(&mut self, set: &mut InterestSet) -> crate::Result<Option<Duration>>;

    /// Do whatever non-blocking work is possible. Returns the number of
    /// transfers still running.
    fn perform(&mut self) -> Result<usize, EngineError>;

    /// The live connection, once one exists.
    fn connection(&mut self) -> Option<&mut Self::Connection>;

    /// Send anything that became eligible without waiting for the engine's
    /// own pacing timer.
    fn flush_egress(&mut self) -> Result<(), EngineError>;
}

/// Result of handing a quack to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Delivered,
    /// The engine has no connection yet (handshake not done).
    NoConnection,
}

/// Hand `quack` to the engine's live connection.
pub fn apply_digest<E: TransferEngine>(engine: &mut E, quack: &Quack, from: SocketAddr) -> Applied {
    match engine.connection() {
        Some(conn) => {
            conn.recv_quack(quack, from);
            Applied::Delivered
        }
        None => Applied::NoConnection,
    }
}

/// Ask the engine to send newly eligible packets right away.
pub fn flush_egress<E: TransferEngine>(engine: &mut E) -> Result<(), EngineError> {
    engine.flush_egress()
}
