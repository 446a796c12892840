//! Bundled HTTP/1.1 transfer engine.
//!
//! ```text
//! [Idle] --> [Connecting] --> [Sending] --> [Receiving] --> [Done]
//!  resolve    non-blocking     request       head + body
//!  + connect  connect()        bytes         to the sink
//! ```
//!
//! Every step is non-blocking; the sidecar loop decides when to call it.
//! While idle the engine has no socket and registers nothing, so the loop's
//! bootstrap phase is what gets the first connect going.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};
use url::{Host, Url};

use sidecurl_core::{
    EngineError, Interest, InterestSet, Quack, QuackParams, QuackSink, TransferEngine,
};

use crate::ledger::{LedgerPolicy, QuackLedger, SEGMENT_SIZE};
use crate::response::ResponseParser;

const USER_AGENT: &str = concat!("sidecurl/", env!("CARGO_PKG_VERSION"));

/// Read buffer per engine step.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// `http://host[:port]/path`, split up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        // Bare host[:port][/path], as curl accepts it.
        let url = if raw.contains("://") {
            Url::parse(raw)
        } else {
            Url::parse(&format!("http://{}", raw))
        }
        .map_err(|e| EngineError::Setup(format!("invalid URL '{}': {}", raw, e)))?;

        if url.scheme() != "http" {
            return Err(EngineError::Setup(format!(
                "unsupported scheme '{}': only plain http is built in",
                url.scheme()
            )));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(EngineError::Setup("credentials in URL are not supported".into()));
        }

        let host = match url.host() {
            Some(Host::Ipv6(addr)) => addr.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Domain(name)) if !name.is_empty() => name.to_string(),
            _ => return Err(EngineError::Setup(format!("no host in '{}'", raw))),
        };
        let port = url.port_or_known_default().unwrap_or(80);

        // The fragment never goes on the wire.
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self { host, port, path })
    }

    fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == 80 {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// A request ready for the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub target: Target,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn get(target: Target) -> Self {
        Self { method: Method::Get, target, body: None }
    }

    pub fn post(target: Target, body: Bytes) -> Self {
        Self { method: Method::Post, target, body: Some(body) }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nConnection: close\r\n",
            self.method.as_str(),
            self.target.path,
            self.target.host_header(),
            USER_AGENT,
        );
        if let Some(body) = &self.body {
            head.push_str(&format!(
                "Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n",
                body.len()
            ));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

/// Transfer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Sending,
    Receiving,
    Done,
}

/// The live connection as seen by the sidecar: quacks land in its ledger.
#[derive(Debug)]
pub struct HttpConnection {
    pub peer: SocketAddr,
    pub ledger: QuackLedger,
    bytes_sent: u64,
}

impl HttpConnection {
    fn segments_sent(&self) -> u64 {
        self.bytes_sent.div_ceil(SEGMENT_SIZE)
    }
}

impl QuackSink for HttpConnection {
    fn recv_quack(&mut self, quack: &Quack, from: SocketAddr) {
        let segments = self.segments_sent();
        self.ledger.record(quack, segments);
        debug!(
            "quack seq={} count={} from={} peer={} applied={} stale={} lost={}",
            quack.seq,
            quack.count,
            from,
            self.peer,
            self.ledger.applied,
            self.ledger.stale,
            self.ledger.lost
        );
    }
}

/// What a finished transfer looked like.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub status: Option<u16>,
    pub reason: String,
    pub body_bytes: u64,
    pub request_bytes: u64,
    pub elapsed: Duration,
    pub ledger: QuackLedger,
}

/// Plain HTTP/1.1 over one non-blocking TCP connection.
pub struct HttpEngine {
    request: Vec<u8>,
    target: Target,
    written: usize,
    socket: Option<Socket>,
    conn: Option<HttpConnection>,
    phase: Phase,
    parser: ResponseParser,
    sink: Box<dyn Write>,
    policy: LedgerPolicy,
    started: Instant,
    max_time: Option<Duration>,
    flushes: u64,
}

impl HttpEngine {
    pub fn new(request: &HttpRequest, sink: Box<dyn Write>) -> Self {
        Self {
            request: request.encode(),
            target: request.target.clone(),
            written: 0,
            socket: None,
            conn: None,
            phase: Phase::Idle,
            parser: ResponseParser::default(),
            sink,
            policy: LedgerPolicy::default(),
            started: Instant::now(),
            max_time: None,
            flushes: 0,
        }
    }

    /// Abort the transfer once it has run this long.
    pub fn with_max_time(mut self, max_time: Option<Duration>) -> Self {
        self.max_time = max_time;
        self
    }

    /// Egress flushes requested by the sidecar.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            status: self.parser.head().map(|h| h.status),
            reason: self.parser.head().map(|h| h.reason.clone()).unwrap_or_default(),
            body_bytes: self.parser.body_bytes(),
            request_bytes: self.written as u64,
            elapsed: self.started.elapsed(),
            ledger: self
                .conn
                .as_ref()
                .map(|c| c.ledger.clone())
                .unwrap_or_else(|| QuackLedger::new(self.policy)),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.max_time.map(|t| self.started + t)
    }

    fn check_deadline(&self) -> Result<(), EngineError> {
        match (self.deadline(), self.max_time) {
            (Some(deadline), Some(max)) if Instant::now() >= deadline => {
                Err(EngineError::TimedOut(max))
            }
            _ => Ok(()),
        }
    }

    fn start_connect(&mut self) -> Result<(), EngineError> {
        let addr = (self.target.host.as_str(), self.target.port)
            .to_socket_addrs()
            .map_err(|e| EngineError::Setup(format!("cannot resolve {}: {}", self.target.host, e)))?
            .next()
            .ok_or_else(|| EngineError::Setup(format!("no address for {}", self.target.host)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        let connected = match socket.connect(&addr.into()) {
            Ok(()) => true,
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => return Err(EngineError::Setup(format!("connect to {}: {}", addr, e))),
        };
        info!("connecting to {} ({})", addr, self.target.host);

        self.socket = Some(socket);
        self.phase = Phase::Connecting;
        if connected {
            self.on_connected(addr);
        }
        Ok(())
    }

    fn poll_connect(&mut self) -> Result<(), EngineError> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(());
        };
        if let Some(e) = socket.take_error()? {
            return Err(EngineError::Setup(format!("connect: {}", e)));
        }
        match socket.peer_addr() {
            Ok(peer) => {
                let peer = peer.as_socket().unwrap_or_else(|| unspecified_peer(self.target.port));
                self.on_connected(peer);
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn on_connected(&mut self, peer: SocketAddr) {
        debug!("connected to {}", peer);
        self.conn = Some(HttpConnection {
            peer,
            ledger: QuackLedger::new(self.policy),
            bytes_sent: 0,
        });
        self.phase = Phase::Sending;
    }

    /// Write as much of the request as the socket takes.
    fn send_pending(&mut self) -> Result<(), EngineError> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };
        while self.written < self.request.len() {
            match socket.write(&self.request[self.written..]) {
                Ok(0) => return Err(EngineError::Protocol("connection closed while sending".into())),
                Ok(n) => {
                    self.written += n;
                    if let Some(conn) = self.conn.as_mut() {
                        conn.bytes_sent += n as u64;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if self.phase == Phase::Sending {
            debug!("request sent ({} bytes)", self.written);
            self.phase = Phase::Receiving;
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<(), EngineError> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return Ok(());
            };
            let n = match socket.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            if n == 0 {
                self.parser.finish()?;
                return self.complete();
            }

            let progress = self.parser.feed(&buf[..n])?;
            if !progress.body.is_empty() {
                self.sink.write_all(&progress.body)?;
            }
            if progress.complete {
                return self.complete();
            }
        }
    }

    fn complete(&mut self) -> Result<(), EngineError> {
        self.sink.flush()?;
        self.socket = None;
        self.phase = Phase::Done;
        if let Some(head) = self.parser.head() {
            info!(
                "HTTP {} {} ({} body bytes in {:?})",
                head.status,
                head.reason,
                self.parser.body_bytes(),
                self.started.elapsed()
            );
        }
        Ok(())
    }
}

fn unspecified_peer(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

impl TransferEngine for HttpEngine {
    type Connection = HttpConnection;

    fn configure_sidecar(&mut self, params: &QuackParams<'_>) -> Result<(), EngineError> {
        self.policy = LedgerPolicy::from(params);
        if let Some(conn) = self.conn.as_mut() {
            conn.ledger.set_policy(self.policy);
        }
        debug!(
            "sidecar options: threshold={} mark_acked={} mark_lost={} update_cwnd={} reorder={} style={:?} cc={:?} iface={:?}",
            params.threshold,
            params.mark_acked,
            params.mark_lost,
            params.update_cwnd,
            params.reorder_threshold,
            params.quack_style,
            params.congestion_control,
            params.sidecar_interface
        );
        Ok(())
    }

    fn register_interest(&mut self, set: &mut InterestSet) -> sidecurl_core::Result<Option<Duration>> {
        let interest = match self.phase {
            Phase::Connecting | Phase::Sending => Some(Interest::Write),
            Phase::Receiving => Some(Interest::Read),
            Phase::Idle | Phase::Done => None,
        };
        if let (Some(interest), Some(socket)) = (interest, self.socket.as_ref()) {
            set.register(socket.as_raw_fd(), interest)?;
        }
        Ok(self.deadline().map(|d| d.saturating_duration_since(Instant::now())))
    }

    fn perform(&mut self) -> Result<usize, EngineError> {
        if self.phase == Phase::Done {
            return Ok(0);
        }
        self.check_deadline()?;

        if self.phase == Phase::Idle {
            self.start_connect()?;
        }
        if self.phase == Phase::Connecting {
            self.poll_connect()?;
        }
        if self.phase == Phase::Sending {
            self.send_pending()?;
        }
        if self.phase == Phase::Receiving {
            self.receive()?;
        }

        Ok(if self.phase == Phase::Done { 0 } else { 1 })
    }

    fn connection(&mut self) -> Option<&mut HttpConnection> {
        self.conn.as_mut()
    }

    fn flush_egress(&mut self) -> Result<(), EngineError> {
        self.flushes += 1;
        if self.phase == Phase::Sending {
            self.send_pending()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::{TcpListener, TcpStream, UdpSocket};
    use std::sync::{Arc, Mutex};
    use std::thread;

    use crossbeam_channel::bounded;
    use sidecurl_core::{NullLogger, Scheduler, SidecarConfig, channel, encode_quack};

    /// Sink the test can read back after the engine is done with it.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Read one request head (and its Content-Length body) off `stream`.
    fn read_request(stream: &TcpStream) -> (String, Vec<u8>) {
        let mut reader = BufReader::new(stream);
        let mut head = String::new();
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if let Some(v) = line.strip_prefix("Content-Length: ") {
                content_length = v.trim().parse().unwrap();
            }
            head.push_str(&line);
            if line == "\r\n" {
                break;
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();
        (head, body)
    }

    fn target_for(listener: &TcpListener) -> Target {
        let addr = listener.local_addr().unwrap();
        Target::parse(&format!("http://{}/file.bin", addr)).unwrap()
    }

    #[test]
    fn parses_urls() {
        let t = Target::parse("http://example.com/a/b?c=1#frag").unwrap();
        assert_eq!(t, Target { host: "example.com".into(), port: 80, path: "/a/b?c=1".into() });

        let t = Target::parse("HTTP://10.0.0.1:8080").unwrap();
        assert_eq!((t.host.as_str(), t.port, t.path.as_str()), ("10.0.0.1", 8080, "/"));

        let t = Target::parse("http://[::1]:9000/x").unwrap();
        assert_eq!((t.host.as_str(), t.port), ("::1", 9000));
        assert_eq!(t.host_header(), "[::1]:9000");

        let t = Target::parse("localhost:81?q").unwrap();
        assert_eq!((t.port, t.path.as_str()), (81, "/?q"));
    }

    #[test]
    fn rejects_unsupported_urls() {
        assert!(matches!(Target::parse("https://example.com/"), Err(EngineError::Setup(_))));
        assert!(Target::parse("http://user:pw@example.com/").is_err());
        assert!(Target::parse("http://example.com:http/").is_err());
        assert!(Target::parse("http://").is_err());
        assert!(Target::parse("ftp://example.com/").is_err());
    }

    #[test]
    fn encodes_post() {
        let target = Target::parse("http://example.com:8080/upload").unwrap();
        let request = HttpRequest::post(target, Bytes::from_static(b"abc"));
        let wire = String::from_utf8(request.encode()).unwrap();

        assert!(wire.starts_with("POST /upload HTTP/1.1\r\nHost: example.com:8080\r\n"));
        assert!(wire.contains("Connection: close\r\n"));
        assert!(wire.ends_with("Content-Length: 3\r\n\r\nabc"));
    }

    #[test]
    fn idle_engine_registers_nothing() {
        let target = Target::parse("http://127.0.0.1:9/").unwrap();
        let mut engine = HttpEngine::new(&HttpRequest::get(target), Box::new(io::sink()));
        let mut set = InterestSet::new();

        assert_eq!(engine.register_interest(&mut set).unwrap(), None);
        assert!(set.is_empty());
        assert!(engine.connection().is_none());
    }

    #[test]
    fn get_through_scheduler() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = target_for(&listener);
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (head, _) = read_request(&stream);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world")
                .unwrap();
            head
        });

        let captured = Captured::default();
        let mut engine = HttpEngine::new(&HttpRequest::get(target), Box::new(captured.clone()));
        let config = SidecarConfig::default();
        let stats = Scheduler::new(&config, &mut engine, None).run().unwrap();

        let head = server.join().unwrap();
        assert!(head.starts_with("GET /file.bin HTTP/1.1\r\n"));
        assert_eq!(captured.contents(), b"hello world");
        assert_eq!(engine.phase, Phase::Done);
        assert!(stats.bootstrap_steps >= 1);

        let summary = engine.summary();
        assert_eq!(summary.status, Some(200));
        assert_eq!(summary.body_bytes, 11);
    }

    #[test]
    fn post_body_reaches_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = target_for(&listener);
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (_, body) = read_request(&stream);
            stream.write_all(b"HTTP/1.0 201 Created\r\n\r\nok").unwrap();
            body
        });

        let captured = Captured::default();
        let request = HttpRequest::post(target, Bytes::from(vec![9u8; 5000]));
        let mut engine = HttpEngine::new(&request, Box::new(captured.clone()));
        let config = SidecarConfig::default();
        Scheduler::new(&config, &mut engine, None).run().unwrap();

        assert_eq!(server.join().unwrap(), vec![9u8; 5000]);
        assert_eq!(captured.contents(), b"ok");
        assert_eq!(engine.summary().status, Some(201));
    }

    #[test]
    fn truncated_response_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = target_for(&listener);
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&stream);
            stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort").unwrap();
        });

        let mut engine = HttpEngine::new(&HttpRequest::get(target), Box::new(io::sink()));
        let config = SidecarConfig::default();
        let result = Scheduler::new(&config, &mut engine, None).run();
        server.join().unwrap();

        assert!(matches!(
            result,
            Err(sidecurl_core::Error::Engine(EngineError::Protocol(_)))
        ));
    }

    #[test]
    fn max_time_aborts_stalled_transfer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = target_for(&listener);
        let (release_tx, release_rx) = bounded::<()>(1);
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            read_request(&stream);
            // Never answer until the test is done.
            let _ = release_rx.recv();
        });

        let mut engine = HttpEngine::new(&HttpRequest::get(target), Box::new(io::sink()))
            .with_max_time(Some(Duration::from_millis(50)));
        let config = SidecarConfig::default();
        let result = Scheduler::new(&config, &mut engine, None).run();
        release_tx.send(()).unwrap();
        server.join().unwrap();

        assert!(matches!(
            result,
            Err(sidecurl_core::Error::Engine(EngineError::TimedOut(_)))
        ));
    }

    #[test]
    fn quacks_land_in_connection_ledger() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = target_for(&listener);
        let (quacked_tx, quacked_rx) = bounded::<()>(1);
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&stream);
            // Hold the response until the observer has spoken.
            quacked_rx.recv().unwrap();
            thread::sleep(Duration::from_millis(50));
            stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").unwrap();
        });

        let config = SidecarConfig {
            threshold: 1,
            mark_acked: true,
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let side = channel::open(&config, &NullLogger).unwrap().unwrap();
        let side_addr = side.local_addr();

        let observer = thread::spawn(move || {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            // Give the engine time to connect before the quacks land.
            thread::sleep(Duration::from_millis(50));
            let mut record = [0u8; 8];
            for count in [3, 3, 5] {
                encode_quack(&mut record, count, &[0; 4]);
                socket.send_to(&record, side_addr).unwrap();
            }
            quacked_tx.send(()).unwrap();
        });

        let mut engine = HttpEngine::new(&HttpRequest::get(target), Box::new(io::sink()));
        let stats = Scheduler::new(&config, &mut engine, Some(side)).run().unwrap();
        observer.join().unwrap();
        server.join().unwrap();

        assert_eq!(stats.quacks_received, 3);
        assert_eq!(stats.quacks_applied, 3);
        assert_eq!(engine.flushes(), 3);

        let ledger = engine.summary().ledger;
        assert_eq!(ledger.applied, 2);
        assert_eq!(ledger.stale, 1);
        assert_eq!(ledger.acked, 5);
        assert!(ledger.policy().mark_acked);
    }
}
