//! Quack record format.
//!
//! ```text
//! [0..4]   Packet count seen by the observer (u32 BE)
//! [4..]    Sketch body (power sums, reorder markers); opaque here
//! ```
//!
//! A datagram carries exactly one record of up to 2048 bytes. On the stream
//! transport every record is exactly `record_size` bytes. The whole record,
//! count included, is handed to the engine unmodified.

use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;

use crate::config::SidecarConfig;

/// Size of the leading count field.
pub const QUACK_COUNT_LEN: usize = 4;

/// Largest quack accepted on the datagram transport.
pub const MAX_QUACK_DATAGRAM: usize = 2048;

/// Framing failures. Any of these means the side channel is broken.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("record of {len} bytes is shorter than the {min}-byte count")]
    TooShort { len: usize, min: usize },

    #[error("record of {len} bytes exceeds the {max}-byte limit")]
    TooLong { len: usize, max: usize },
}

/// A decoded quack.
#[derive(Debug, Clone)]
pub struct Quack {
    /// Arrival order on the channel, starting at 1.
    pub seq: u64,
    /// Packets the observer has counted in its current epoch.
    pub count: u32,
    /// The full record as received.
    pub raw: Bytes,
    pub received_at: Instant,
}

impl Quack {
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Everything after the count.
    pub fn body(&self) -> &[u8] {
        &self.raw[QUACK_COUNT_LEN..]
    }
}

/// Read the count field. Returns None if the record is too short.
pub fn decode_count(raw: &[u8]) -> Option<u32> {
    let head: [u8; QUACK_COUNT_LEN] = raw.get(..QUACK_COUNT_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(head))
}

/// Encode a quack record into `buf`. Returns bytes written.
///
/// # Panics
/// Panics if `buf` is smaller than `QUACK_COUNT_LEN + body.len()`.
pub fn encode_quack(buf: &mut [u8], count: u32, body: &[u8]) -> usize {
    let total = QUACK_COUNT_LEN + body.len();
    assert!(buf.len() >= total);

    buf[..QUACK_COUNT_LEN].copy_from_slice(&count.to_be_bytes());
    buf[QUACK_COUNT_LEN..total].copy_from_slice(body);
    total
}

/// Validates framing and stamps each record with its arrival sequence.
#[derive(Debug)]
pub struct QuackDecoder {
    max_len: usize,
    next_seq: u64,
}

impl QuackDecoder {
    pub fn new(max_len: usize) -> Self {
        Self { max_len, next_seq: 1 }
    }

    pub fn for_config(config: &SidecarConfig) -> Self {
        Self::new(config.max_record_len())
    }

    /// Decode one complete record.
    pub fn decode(&mut self, raw: &[u8]) -> Result<Quack, CodecError> {
        if raw.len() > self.max_len {
            return Err(CodecError::TooLong { len: raw.len(), max: self.max_len });
        }
        let count = decode_count(raw).ok_or(CodecError::TooShort {
            len: raw.len(),
            min: QUACK_COUNT_LEN,
        })?;

        let seq = self.next_seq;
        self.next_seq += 1;

        Ok(Quack {
            seq,
            count,
            raw: Bytes::copy_from_slice(raw),
            received_at: Instant::now(),
        })
    }

    /// Number of records decoded so far.
    pub fn decoded(&self) -> u64 {
        self.next_seq - 1
    }
}
