//! Command line and environment.
//!
//! Every sidecar option can come from a flag or a `SIDECURL_*` variable
//! (a `.env` file is loaded first). Flags win.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::Parser;

use sidecurl_core::config::{
    DEFAULT_RECORD_SIZE, DEFAULT_REORDER_THRESHOLD, DEFAULT_RESET_PORT,
};
use sidecurl_core::{ResetConfig, SidecarConfig, Transport};

use crate::http::{HttpRequest, Target};

#[derive(Debug, Parser)]
#[command(name = "sidecurl", version, about = "HTTP transfers with sidecar quack feedback")]
pub struct Args {
    /// URL to transfer (http://host[:port]/path)
    pub url: String,

    /// Write the body to this file instead of stdout
    #[arg(short = 'o', long, env = "SIDECURL_OUTPUT")]
    pub output: Option<PathBuf>,

    /// POST this data; `@file` reads it from a file
    #[arg(short = 'd', long = "data-binary", value_name = "DATA")]
    pub data: Option<String>,

    /// Give up on the transfer after this many seconds
    #[arg(short = 'm', long = "max-time", env = "SIDECURL_MAX_TIME", value_name = "SECONDS")]
    pub max_time: Option<f64>,

    /// Use HTTP/1.1 (the default)
    #[arg(short = '1', long = "http1.1")]
    pub http1_1: bool,

    /// Use HTTP/3 (needs an external QUIC engine)
    #[arg(short = '3', long = "http3", conflicts_with = "http1_1")]
    pub http3: bool,

    /// Debug logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Quack count that triggers engine action; 0 or less disables the sidecar
    #[arg(
        short = 't',
        long,
        env = "SIDECURL_THRESHOLD",
        default_value_t = 0,
        allow_negative_numbers = true
    )]
    pub threshold: i32,

    /// Side channel transport: udp or tcp
    #[arg(long, env = "SIDECURL_TRANSPORT", default_value = "udp")]
    pub transport: Transport,

    /// Side channel bind address
    #[arg(long, env = "SIDECURL_LISTEN", default_value = "0.0.0.0:5103")]
    pub listen: SocketAddr,

    /// Bytes per quack record on the tcp transport
    #[arg(long, env = "SIDECURL_RECORD_SIZE", default_value_t = DEFAULT_RECORD_SIZE)]
    pub record_size: usize,

    #[arg(long, env = "SIDECURL_MARK_ACKED")]
    pub mark_acked: bool,

    #[arg(long, env = "SIDECURL_MARK_LOST")]
    pub mark_lost: bool,

    #[arg(long, env = "SIDECURL_UPDATE_CWND")]
    pub update_cwnd: bool,

    /// One-way delay to the observer, in milliseconds
    #[arg(long, env = "SIDECURL_NEAR_DELAY", default_value_t = 0)]
    pub near_delay: u64,

    /// End-to-end delay, in milliseconds
    #[arg(long, env = "SIDECURL_E2E_DELAY", default_value_t = 0)]
    pub e2e_delay: u64,

    /// Periodically tell the observer to reset its counters
    #[arg(short = 'Q', long = "quack-reset", env = "SIDECURL_QUACK_RESET")]
    pub quack_reset: bool,

    #[arg(long, env = "SIDECURL_RESET_HOST", default_value = "127.0.0.1")]
    pub reset_host: IpAddr,

    #[arg(long, env = "SIDECURL_RESET_PORT", default_value_t = DEFAULT_RESET_PORT)]
    pub reset_port: u16,

    /// Milliseconds between reset signals
    #[arg(long, env = "SIDECURL_RESET_INTERVAL", default_value_t = 100)]
    pub reset_interval: u64,

    #[arg(long, env = "SIDECURL_REORDER_THRESHOLD", default_value_t = DEFAULT_REORDER_THRESHOLD)]
    pub reorder_threshold: u32,

    /// Quack encoding style, passed to the engine as is
    #[arg(short = 'u', long = "quack-style", env = "SIDECURL_QUACK_STYLE")]
    pub quack_style: Option<String>,

    /// Congestion controller: cubic, reno or bbr
    #[arg(short = 'q', long = "quiche-cc", env = "SIDECURL_CC", value_name = "ALGORITHM")]
    pub congestion_control: Option<String>,

    /// Interface the sidecar traffic goes out on
    #[arg(short = 's', long = "sidecar", env = "SIDECURL_INTERFACE", value_name = "IFACE")]
    pub sidecar_interface: Option<String>,

    /// Only send when the congestion window exceeds one MTU
    #[arg(short = 'S', long = "sidecar-mtu", env = "SIDECURL_MTU")]
    pub sidecar_mtu: bool,

    /// Minimum ACK delay, in milliseconds
    #[arg(short = 'M', long = "min-ack-delay", env = "SIDECURL_MIN_ACK_DELAY")]
    pub min_ack_delay: Option<u64>,

    /// Maximum ACK delay, in milliseconds
    #[arg(short = 'D', long = "max-ack-delay", env = "SIDECURL_MAX_ACK_DELAY")]
    pub max_ack_delay: Option<u64>,

    /// Longest single readiness wait, in milliseconds
    #[arg(long, env = "SIDECURL_POLL_TIMEOUT", default_value_t = 1000)]
    pub poll_timeout: u64,
}

impl Args {
    pub fn sidecar_config(&self) -> SidecarConfig {
        SidecarConfig {
            threshold: self.threshold,
            transport: self.transport,
            listen_addr: self.listen,
            record_size: self.record_size,
            mark_acked: self.mark_acked,
            mark_lost: self.mark_lost,
            update_cwnd: self.update_cwnd,
            near_delay: Duration::from_millis(self.near_delay),
            e2e_delay: Duration::from_millis(self.e2e_delay),
            reorder_threshold: self.reorder_threshold,
            quack_style: self.quack_style.clone(),
            congestion_control: self.congestion_control.clone(),
            sidecar_interface: self.sidecar_interface.clone(),
            mtu_gating: self.sidecar_mtu,
            min_ack_delay: self.min_ack_delay.map(Duration::from_millis),
            max_ack_delay: self.max_ack_delay.map(Duration::from_millis),
            reset: ResetConfig {
                enabled: self.quack_reset,
                host: self.reset_host,
                port: self.reset_port,
                interval: Duration::from_millis(self.reset_interval),
            },
            poll_timeout: Duration::from_millis(self.poll_timeout),
        }
    }

    /// Parse the process arguments. A command line that does not parse is
    /// a usage error and exits with status 1; `--help` and `--version`
    /// print and exit 0.
    pub fn parse_or_exit() -> Self {
        match Self::try_parse() {
            Ok(args) => args,
            Err(e) => {
                let _ = e.print();
                std::process::exit(usage_exit_code(&e));
            }
        }
    }

    pub fn max_time(&self) -> anyhow::Result<Option<Duration>> {
        self.max_time
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("invalid --max-time {}", secs))
            })
            .transpose()
    }

    /// Build the request. Reads the `@file` body, if any.
    pub fn request(&self) -> anyhow::Result<HttpRequest> {
        if self.http3 {
            bail!("HTTP/3 needs the QUIC engine, which is not built in");
        }
        let target = Target::parse(&self.url)?;

        let Some(data) = &self.data else {
            return Ok(HttpRequest::get(target));
        };
        let body = match data.strip_prefix('@') {
            Some(path) => std::fs::read(path)
                .with_context(|| format!("cannot read request body from {}", path))?,
            None => data.clone().into_bytes(),
        };
        Ok(HttpRequest::post(target, Bytes::from(body)))
    }
}

/// Exit status for a command line clap rejected or answered itself.
pub fn usage_exit_code(err: &clap::Error) -> i32 {
    if err.use_stderr() { 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("sidecurl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_leave_sidecar_off() {
        let args = parse(&["http://localhost/"]);
        let config = args.sidecar_config();
        assert!(!config.is_enabled());
        assert_eq!(config.transport, Transport::Datagram);
        assert_eq!(config.listen_addr.port(), 5103);
        assert_eq!(config.reset.port, 5104);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn sidecar_flags_map_to_config() {
        let args = parse(&[
            "-t", "10", "--transport", "tcp", "--record-size", "16", "--mark-lost", "-Q",
            "--reset-interval", "10", "-u", "power_sum", "-S", "-M", "5", "-D", "25",
            "http://localhost/",
        ]);
        let config = args.sidecar_config();
        assert_eq!(config.threshold, 10);
        assert_eq!(config.transport, Transport::Stream);
        assert_eq!(config.record_size, 16);
        assert!(config.mark_lost);
        assert!(config.resets_enabled());
        assert_eq!(config.reset.interval, Duration::from_millis(10));
        assert_eq!(config.quack_style.as_deref(), Some("power_sum"));
        assert!(config.mtu_gating);
        assert_eq!(config.min_ack_delay, Some(Duration::from_millis(5)));
        assert_eq!(config.max_ack_delay, Some(Duration::from_millis(25)));
        config.validate().unwrap();
    }

    #[test]
    fn engine_options_map_to_config() {
        let args = parse(&["-t", "4", "-q", "cubic", "-s", "eth0", "http://localhost/"]);
        let config = args.sidecar_config();
        assert_eq!(config.congestion_control.as_deref(), Some("cubic"));
        assert_eq!(config.sidecar_interface.as_deref(), Some("eth0"));

        let params = config.params();
        assert_eq!(params.congestion_control, Some("cubic"));
        assert_eq!(params.sidecar_interface, Some("eth0"));

        let args = parse(&["--quiche-cc", "bbr", "--sidecar", "wlan0", "http://localhost/"]);
        assert_eq!(args.congestion_control.as_deref(), Some("bbr"));
        assert_eq!(args.sidecar_interface.as_deref(), Some("wlan0"));
    }

    #[test]
    fn usage_errors_exit_with_one() {
        let bad = [
            vec!["sidecurl", "-t", "abc", "http://127.0.0.1:9/"],
            vec!["sidecurl", "--bogus", "http://x/"],
            vec!["sidecurl"],
            vec!["sidecurl", "http://a/", "http://b/"],
        ];
        for argv in bad {
            let err = Args::try_parse_from(argv.iter().copied()).unwrap_err();
            assert_eq!(usage_exit_code(&err), 1, "{:?}", argv);
        }

        let err = Args::try_parse_from(["sidecurl", "--help"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);
        let err = Args::try_parse_from(["sidecurl", "--version"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);
    }

    #[test]
    fn negative_threshold_is_accepted() {
        let args = parse(&["-t", "-1", "http://localhost/"]);
        assert_eq!(args.threshold, -1);
        assert!(!args.sidecar_config().is_enabled());
    }

    #[test]
    fn http3_is_rejected() {
        let args = parse(&["-3", "http://localhost/"]);
        assert!(args.request().is_err());
        assert!(Args::try_parse_from(["sidecurl", "-1", "-3", "http://x/"]).is_err());
    }

    #[test]
    fn inline_data_posts() {
        let args = parse(&["-d", "a=1", "http://localhost/"]);
        let request = args.request().unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.body.as_deref(), Some(&b"a=1"[..]));
    }

    #[test]
    fn missing_data_file_is_an_error() {
        let args = parse(&["-d", "@/nonexistent/sidecurl-body", "http://localhost/"]);
        assert!(args.request().is_err());
    }

    #[test]
    fn max_time_in_seconds() {
        let args = parse(&["-m", "1.5", "http://localhost/"]);
        assert_eq!(args.max_time().unwrap(), Some(Duration::from_millis(1500)));
        let args = parse(&["-m", "nan", "http://localhost/"]);
        assert!(args.max_time().is_err());
    }
}
