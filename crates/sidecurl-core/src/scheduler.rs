//! Sidecar event loop.
//!
//! One thread, one bounded `poll(2)` per iteration:
//!
//! ```text
//! [bootstrap] -> [register channel] -> [wait] -> [quack?] -> [reset?] -> [step]
//!  engine fds     read interest        min(poll_timeout,      apply +     best
//!  or up to 64    (if still open)       engine hint,          flush       effort
//!  blind steps                          next reset)
//! ```
//!
//! A quack read in an iteration is applied and flushed before that
//! iteration's engine step. The loop ends only when the engine reports no
//! running transfers, or on a fatal error.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::{QuackChannel, Recv};
use crate::config::SidecarConfig;
use crate::engine::{self, Applied, TransferEngine};
use crate::logging::{NullLogger, SidecarEvent, SidecarLog, SidecarLogger, head_hex};
use crate::poll::{Interest, InterestSet};
use crate::quack::QuackDecoder;
use crate::reset::ResetPolicy;
use crate::stats::SidecarStats;
use crate::Result;

/// Engine steps allowed while it reports no descriptors, per iteration.
pub const BOOTSTRAP_MAX_STEPS: u32 = 64;

/// What the last iteration woke up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Wait timed out (engine timer or reset deadline).
    Polling,
    /// Only engine descriptors were ready.
    EngineReady,
    /// The side channel was readable.
    ChannelReady,
    /// Engine reported zero running transfers.
    Done,
}

/// How the bootstrap phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    /// The engine registered at least one descriptor.
    Ready,
    /// The engine finished while being stepped.
    Finished,
    /// Step budget spent without a descriptor. Falls back to a timed wait.
    Exhausted,
}

pub struct Scheduler<'a, E: TransferEngine> {
    config: &'a SidecarConfig,
    engine: &'a mut E,
    channel: Option<Box<dyn QuackChannel>>,
    decoder: QuackDecoder,
    reset: Option<ResetPolicy>,
    interest: InterestSet,
    logger: Arc<dyn SidecarLogger>,
    stats: SidecarStats,
    state: LoopState,
    running: usize,
    wait_hint: Option<Duration>,
    configured: bool,
}

impl<'a, E: TransferEngine> Scheduler<'a, E> {
    /// `channel` is None when the sidecar is disabled; the loop then only
    /// drives the engine. The reset schedule starts now.
    pub fn new(
        config: &'a SidecarConfig,
        engine: &'a mut E,
        channel: Option<Box<dyn QuackChannel>>,
    ) -> Self {
        let reset = if channel.is_some() && config.resets_enabled() {
            ResetPolicy::new(&config.reset, Instant::now())
        } else {
            None
        };
        Self {
            config,
            engine,
            channel,
            decoder: QuackDecoder::for_config(config),
            reset,
            interest: InterestSet::new(),
            logger: Arc::new(NullLogger),
            stats: SidecarStats::default(),
            state: LoopState::Polling,
            running: 1,
            wait_hint: None,
            configured: false,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn SidecarLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Replace the reset schedule. Ignored without a channel to send on.
    pub fn with_reset_policy(mut self, policy: ResetPolicy) -> Self {
        if self.channel.is_some() {
            self.reset = Some(policy);
        }
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &SidecarStats {
        &self.stats
    }

    /// Transfers still running after the last engine step.
    pub fn running(&self) -> usize {
        self.running
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Drive the engine to completion.
    pub fn run(mut self) -> Result<SidecarStats> {
        while self.turn()? != LoopState::Done {}
        Ok(self.stats)
    }

    /// One loop iteration.
    pub fn turn(&mut self) -> Result<LoopState> {
        if self.state == LoopState::Done {
            return Ok(LoopState::Done);
        }
        if !self.configured {
            self.configured = true;
            if self.channel.is_some() {
                self.engine.configure_sidecar(&self.config.params())?;
            }
        }

        self.interest.clear();
        if self.bootstrap()? == Bootstrap::Finished {
            self.stats.iterations += 1;
            return Ok(self.finish());
        }

        let channel_fd = self.channel.as_ref().and_then(|c| c.raw_fd());
        if let Some(fd) = channel_fd {
            self.interest.register(fd, Interest::Read)?;
        }

        let wait = self.wait_for(Instant::now());
        let ready = self.interest.wait(wait)?;

        self.state = LoopState::Polling;
        if let Some(fd) = channel_fd {
            if ready > 0 && self.interest.is_readable(fd) {
                self.state = LoopState::ChannelReady;
                self.service_channel()?;
            }
        }
        if self.state == LoopState::Polling && ready > 0 {
            self.state = LoopState::EngineReady;
        }

        self.service_reset(Instant::now());

        self.running = self.engine.perform()?;
        self.stats.iterations += 1;
        if self.running == 0 {
            return Ok(self.finish());
        }
        Ok(self.state)
    }

    /// Collect engine descriptors, stepping the engine while it has none.
    pub fn bootstrap(&mut self) -> Result<Bootstrap> {
        let mut steps = 0;
        loop {
            self.wait_hint = self.engine.register_interest(&mut self.interest)?;
            if !self.interest.is_empty() {
                return Ok(Bootstrap::Ready);
            }
            if steps == BOOTSTRAP_MAX_STEPS {
                self.emit(SidecarEvent::BootstrapExhausted { steps });
                return Ok(Bootstrap::Exhausted);
            }

            self.running = self.engine.perform()?;
            steps += 1;
            self.stats.bootstrap_steps += 1;
            if self.running == 0 {
                return Ok(Bootstrap::Finished);
            }
        }
    }

    fn wait_for(&self, now: Instant) -> Duration {
        let mut wait = self.config.poll_timeout;
        if let Some(hint) = self.wait_hint {
            wait = wait.min(hint);
        }
        if let Some(policy) = &self.reset {
            wait = wait.min(policy.until_due(now));
        }
        wait
    }

    fn service_channel(&mut self) -> Result<()> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };

        match channel.try_recv()? {
            Recv::Record { bytes, from } => self.deliver(&bytes, from)?,
            Recv::Partial { .. } => self.stats.partial_reads += 1,
            Recv::Idle => self.stats.idle_reads += 1,
            Recv::Closed => {
                let event = SidecarEvent::ChannelClosed {
                    transport: channel.transport(),
                    local: channel.local_addr(),
                };
                // Resets leave through the channel's sockets; they go with it.
                self.channel = None;
                self.reset = None;
                self.emit(event);
            }
        }
        Ok(())
    }

    fn deliver(&mut self, raw: &[u8], from: SocketAddr) -> Result<()> {
        let quack = self.decoder.decode(raw)?;
        self.stats.quacks_received += 1;
        self.stats.quack_bytes += quack.len() as u64;
        self.emit(SidecarEvent::QuackReceived {
            seq: quack.seq,
            count: quack.count,
            len: quack.len(),
            from,
            head: head_hex(raw),
        });

        match engine::apply_digest(&mut *self.engine, &quack, from) {
            Applied::Delivered => {
                self.stats.quacks_applied += 1;
                engine::flush_egress(&mut *self.engine)?;
                self.stats.flushes += 1;
                self.emit(SidecarEvent::QuackApplied {
                    seq: quack.seq,
                    count: quack.count,
                });
            }
            Applied::NoConnection => {
                self.stats.quacks_dropped += 1;
                self.emit(SidecarEvent::QuackDropped {
                    seq: quack.seq,
                    reason: "no connection",
                });
            }
        }
        Ok(())
    }

    fn service_reset(&mut self, now: Instant) {
        let Some(policy) = self.reset.as_mut() else {
            return;
        };
        if !policy.is_due(now) {
            return;
        }
        let signal = policy.next_signal(now);
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        match channel.send_reset(&signal.encode(), signal.to) {
            Ok(_) => {
                self.stats.resets_sent += 1;
                self.emit(SidecarEvent::ResetSent {
                    epoch: signal.epoch,
                    to: signal.to,
                });
            }
            Err(e) => {
                self.stats.resets_failed += 1;
                self.emit(SidecarEvent::ResetFailed {
                    epoch: signal.epoch,
                    to: signal.to,
                    message: e.to_string(),
                });
            }
        }
    }

    fn finish(&mut self) -> LoopState {
        self.state = LoopState::Done;
        self.emit(SidecarEvent::LoopFinished {
            iterations: self.stats.iterations,
            quacks: self.stats.quacks_received,
            resets: self.stats.resets_attempted(),
        });
        LoopState::Done
    }

    fn emit(&self, event: SidecarEvent) {
        self.logger.log(SidecarLog {
            component: "scheduler",
            event,
        });
    }
}
