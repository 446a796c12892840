//! Sidecar quack ingestion for bulk HTTP transfers.
//!
//! Runs next to a transfer engine and feeds it loss digests ("quacks")
//! produced by an on-path observer:
//! - Datagram or byte-stream side channel on a well-known port (5103)
//! - Framing validation and decoding of quack records
//! - Single-threaded `poll(2)` loop multiplexing engine and channel readiness
//! - Quack application plus an immediate egress flush on the live connection
//! - Periodic reset signals so the observer can resynchronize its counters

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod poll;
pub mod quack;
pub mod reset;
pub mod scheduler;
pub mod stats;

// Re-export key types for convenience.
pub use channel::{DatagramChannel, QuackChannel, Recv, StreamChannel, StreamListener};
pub use config::{QuackParams, ResetConfig, SidecarConfig, Transport};
pub use engine::{Applied, EngineError, QuackSink, TransferEngine, apply_digest, flush_egress};
pub use error::{Error, Result};
pub use logging::{NullLogger, SidecarEvent, SidecarLog, SidecarLogger, TracingLogger};
pub use poll::{Interest, InterestSet, MAX_POLL_FDS};
pub use quack::{
    CodecError, MAX_QUACK_DATAGRAM, QUACK_COUNT_LEN, Quack, QuackDecoder, decode_count,
    encode_quack,
};
pub use reset::{RESET_MAGIC, RESET_SIGNAL_LEN, ResetPolicy, ResetSignal};
pub use scheduler::{BOOTSTRAP_MAX_STEPS, Bootstrap, LoopState, Scheduler};
pub use stats::SidecarStats;

/// Well-known port the observer sends quacks to.
pub const DEFAULT_SIDECAR_PORT: u16 = 5103;
