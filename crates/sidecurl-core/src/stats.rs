//! Counters collected by the sidecar loop.
//!
//! The loop is the only writer, so these are plain integers handed back to
//! the caller when the transfer finishes.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidecarStats {
    /// Completed loop iterations.
    pub iterations: u64,
    /// Engine steps taken while it had no descriptors to report.
    pub bootstrap_steps: u64,
    /// Complete records decoded.
    pub quacks_received: u64,
    /// Records delivered to the live connection.
    pub quacks_applied: u64,
    /// Records dropped because no connection existed yet.
    pub quacks_dropped: u64,
    /// Total bytes of complete records.
    pub quack_bytes: u64,
    /// Reads that ended mid-record (stream transport).
    pub partial_reads: u64,
    /// Channel wake-ups that yielded nothing (would-block, empty datagram).
    pub idle_reads: u64,
    /// Egress flushes requested after a quack.
    pub flushes: u64,
    pub resets_sent: u64,
    pub resets_failed: u64,
}

impl SidecarStats {
    /// Reset signals attempted, successful or not.
    pub fn resets_attempted(&self) -> u64 {
        self.resets_sent + self.resets_failed
    }
}
