mod args;
mod http;
mod ledger;
mod response;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};

use sidecurl_core::{Scheduler, SidecarLogger, TracingLogger, channel};

use crate::args::Args;
use crate::http::HttpEngine;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse_or_exit();

    let default_filter = if args.verbose {
        "sidecurl=debug,sidecurl_core=debug"
    } else {
        "sidecurl=info,sidecurl_core=info"
    };
    // Body goes to stdout, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(io::stderr)
        .init();

    let config = args.sidecar_config();
    config.validate()?;
    let request = args.request()?;
    let max_time = args.max_time()?;
    if args.http1_1 {
        debug!("HTTP/1.1 requested explicitly");
    }

    let logger: Arc<dyn SidecarLogger> = Arc::new(TracingLogger);

    // The tcp transport blocks here until the observer connects.
    let channel = channel::open(&config, logger.as_ref())?;
    if channel.is_none() {
        info!("sidecar disabled (threshold {})", config.threshold);
    }

    let sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let mut engine = HttpEngine::new(&request, sink).with_max_time(max_time);
    let stats = Scheduler::new(&config, &mut engine, channel)
        .with_logger(logger)
        .run()
        .with_context(|| format!("transfer of {} failed", args.url))?;

    let summary = engine.summary();
    match summary.status {
        Some(status) if status >= 400 => {
            warn!("server answered {} {}", status, summary.reason)
        }
        Some(status) => debug!("server answered {} {}", status, summary.reason),
        None => warn!("no response status"),
    }
    info!(
        "received {} body bytes (sent {}) in {:.3}s",
        summary.body_bytes,
        summary.request_bytes,
        summary.elapsed.as_secs_f64()
    );

    if config.is_enabled() {
        info!(
            "sidecar: {} quacks ({} applied, {} dropped, {} bytes), resets {} sent / {} failed, {} iterations",
            stats.quacks_received,
            stats.quacks_applied,
            stats.quacks_dropped,
            stats.quack_bytes,
            stats.resets_sent,
            stats.resets_failed,
            stats.iterations
        );
        let ledger = &summary.ledger;
        info!(
            "ledger: applied={} stale={} epochs={} last_count={:?} acked={} flushes={}",
            ledger.applied,
            ledger.stale,
            ledger.epochs,
            ledger.last_count,
            ledger.acked,
            engine.flushes()
        );
        if ledger.policy().mark_lost {
            info!("ledger: lost={} cwnd_cuts={}", ledger.lost, ledger.cwnd_cuts);
        }
    }

    Ok(())
}
