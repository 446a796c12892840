//! Error types for the sidecar core.
//!
//! Every variant is fatal to the transfer. Recoverable conditions (a
//! would-block read, a lost reset datagram) never surface as an `Error`.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::engine::EngineError;
use crate::quack::CodecError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid sidecar configuration: {0}")]
    Config(String),

    #[error("cannot open sidecar channel on {addr}: {source}")]
    ChannelSetup {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("sidecar channel I/O error: {0}")]
    ChannelIo(#[source] io::Error),

    #[error("malformed quack: {0}")]
    Codec(#[from] CodecError),

    #[error("readiness set is full ({limit} descriptors)")]
    InterestOverflow { limit: usize },

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("transfer engine: {0}")]
    Engine(#[from] EngineError),
}

impl Error {
    pub(crate) fn setup(addr: SocketAddr) -> impl FnOnce(io::Error) -> Error {
        move |source| Error::ChannelSetup { addr, source }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
