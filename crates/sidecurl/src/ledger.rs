//! Quack accounting for the bundled HTTP connection.
//!
//! The observer's count is cumulative within an epoch. A repeat of the last
//! count carries nothing new and is ignored; a count that goes backwards
//! means the observer reset its sketch, so a new epoch starts from zero.

use sidecurl_core::{Quack, QuackParams};

/// Bytes per segment when estimating how many packets went out.
pub const SEGMENT_SIZE: u64 = 1460;

/// Policy knobs copied out of the sidecar options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerPolicy {
    pub threshold: u32,
    pub mark_acked: bool,
    pub mark_lost: bool,
    pub update_cwnd: bool,
    pub reorder_threshold: u32,
}

impl From<&QuackParams<'_>> for LedgerPolicy {
    fn from(params: &QuackParams<'_>) -> Self {
        Self {
            threshold: params.threshold,
            mark_acked: params.mark_acked,
            mark_lost: params.mark_lost,
            update_cwnd: params.update_cwnd,
            reorder_threshold: params.reorder_threshold,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuackLedger {
    policy: LedgerPolicy,
    /// Quacks that moved the count forward.
    pub applied: u64,
    /// Repeats of the last count.
    pub stale: u64,
    /// Observer epochs seen (count went backwards).
    pub epochs: u32,
    pub last_count: Option<u32>,
    /// Segments the observer has confirmed, summed across epochs.
    pub acked: u64,
    /// Segments declared lost by the most recent quack.
    pub lost: u64,
    /// Times a loss would have shrunk the congestion window.
    pub cwnd_cuts: u64,
    // Segments sent at the start of the current epoch.
    epoch_base: u64,
}

impl QuackLedger {
    pub fn new(policy: LedgerPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: LedgerPolicy) {
        self.policy = policy;
    }

    /// Fold one quack in. `segments_sent` is the sender's running total.
    pub fn record(&mut self, quack: &Quack, segments_sent: u64) {
        let previous = match self.last_count {
            Some(last) if quack.count == last => {
                self.stale += 1;
                return;
            }
            Some(last) if quack.count < last => {
                self.epochs += 1;
                self.epoch_base = segments_sent;
                0
            }
            Some(last) => last,
            None => 0,
        };
        self.last_count = Some(quack.count);
        self.applied += 1;

        if self.policy.mark_acked {
            self.acked += u64::from(quack.count - previous);
        }

        if self.policy.mark_lost && quack.count >= self.policy.threshold {
            let sent_this_epoch = segments_sent.saturating_sub(self.epoch_base);
            let missing = sent_this_epoch.saturating_sub(u64::from(quack.count));
            let lost = missing.saturating_sub(u64::from(self.policy.reorder_threshold));
            if lost > 0 && self.policy.update_cwnd {
                self.cwnd_cuts += 1;
            }
            self.lost = lost;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidecurl_core::QuackDecoder;

    fn quack(decoder: &mut QuackDecoder, count: u32) -> Quack {
        decoder.decode(&count.to_be_bytes()).unwrap()
    }

    #[test]
    fn repeat_count_is_stale() {
        let mut decoder = QuackDecoder::new(4);
        let mut ledger = QuackLedger::new(LedgerPolicy { mark_acked: true, ..Default::default() });

        ledger.record(&quack(&mut decoder, 10), 20);
        ledger.record(&quack(&mut decoder, 10), 20);

        assert_eq!(ledger.applied, 1);
        assert_eq!(ledger.stale, 1);
        assert_eq!(ledger.acked, 10);
    }

    #[test]
    fn count_going_backwards_starts_epoch() {
        let mut decoder = QuackDecoder::new(4);
        let mut ledger = QuackLedger::new(LedgerPolicy { mark_acked: true, ..Default::default() });

        ledger.record(&quack(&mut decoder, 10), 12);
        ledger.record(&quack(&mut decoder, 4), 30);

        assert_eq!(ledger.epochs, 1);
        assert_eq!(ledger.applied, 2);
        assert_eq!(ledger.acked, 14);
        assert_eq!(ledger.last_count, Some(4));
    }

    #[test]
    fn loss_respects_reorder_threshold() {
        let mut decoder = QuackDecoder::new(4);
        let mut ledger = QuackLedger::new(LedgerPolicy {
            threshold: 5,
            mark_lost: true,
            update_cwnd: true,
            reorder_threshold: 3,
            ..Default::default()
        });

        // 2 missing: inside the reorder window.
        ledger.record(&quack(&mut decoder, 8), 10);
        assert_eq!(ledger.lost, 0);
        assert_eq!(ledger.cwnd_cuts, 0);

        // 7 missing: 4 beyond the window.
        ledger.record(&quack(&mut decoder, 13), 20);
        assert_eq!(ledger.lost, 4);
        assert_eq!(ledger.cwnd_cuts, 1);
    }

    #[test]
    fn below_threshold_never_declares_loss() {
        let mut decoder = QuackDecoder::new(4);
        let mut ledger = QuackLedger::new(LedgerPolicy {
            threshold: 50,
            mark_lost: true,
            ..Default::default()
        });
        ledger.record(&quack(&mut decoder, 1), 100);
        assert_eq!(ledger.lost, 0);
        assert_eq!(ledger.applied, 1);
    }
}
