//! Side channel carrying quacks from the observer.
//!
//! Two wire variants behind one [`QuackChannel`] interface:
//!
//! ```text
//! Datagram   bind 0.0.0.0:5103/udp    one recv_from() == one record
//! Stream     listen 0.0.0.0:5103/tcp  accept once, reassemble fixed-size records
//! ```
//!
//! Both are non-blocking once set up. A would-block read is never an error;
//! anything else the socket reports is.

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::config::{SidecarConfig, Transport};
use crate::logging::{SidecarEvent, SidecarLog, SidecarLogger};
use crate::quack::MAX_QUACK_DATAGRAM;
use crate::{Error, Result};

/// Socket receive buffer for the datagram channel (1 MB).
const RECV_BUF_SIZE: usize = 1024 * 1024;

/// Outcome of one non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    /// A complete record.
    Record { bytes: Bytes, from: SocketAddr },
    /// Bytes arrived but the record is not complete yet.
    Partial { buffered: usize },
    /// Nothing to read (would block, or an empty datagram).
    Idle,
    /// Stream peer closed the connection.
    Closed,
}

/// Receive complete quack records; send reset datagrams back.
pub trait QuackChannel {
    fn transport(&self) -> Transport;

    fn local_addr(&self) -> SocketAddr;

    /// Descriptor to wait on. None once the channel has closed.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Read without blocking. Errors other than would-block are fatal.
    fn try_recv(&mut self) -> Result<Recv>;

    /// Best-effort datagram toward the observer.
    fn send_reset(&mut self, signal: &[u8], to: SocketAddr) -> io::Result<usize>;
}

/// Open the channel described by `config`, or nothing if the sidecar is
/// disabled. The stream variant blocks here until the observer connects.
pub fn open(
    config: &SidecarConfig,
    logger: &dyn SidecarLogger,
) -> Result<Option<Box<dyn QuackChannel>>> {
    if !config.is_enabled() {
        return Ok(None);
    }

    let channel: Box<dyn QuackChannel> = match config.transport {
        Transport::Datagram => Box::new(DatagramChannel::bind(config.listen_addr)?),
        Transport::Stream => {
            let listener = StreamListener::bind(config.listen_addr)?;
            Box::new(listener.accept(config.record_size)?)
        }
    };

    logger.log(SidecarLog {
        component: "channel",
        event: SidecarEvent::ChannelOpened {
            transport: channel.transport(),
            local: channel.local_addr(),
        },
    });
    Ok(Some(channel))
}

fn socket_local_addr(socket: &Socket, fallback: SocketAddr) -> SocketAddr {
    socket
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .unwrap_or(fallback)
}

fn unspecified(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn create_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = sock.set_recv_buffer_size(RECV_BUF_SIZE) {
        warn!("sidecar: failed to set recv buffer: {}", e);
    }
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    Ok(sock.into())
}

// ── Datagram ────────────────────────────────────────────────────────────

/// UDP side channel. Datagrams preserve record boundaries.
pub struct DatagramChannel {
    socket: UdpSocket,
    local: SocketAddr,
    // One spare byte so an oversized datagram is visible instead of truncated.
    buf: Vec<u8>,
}

impl DatagramChannel {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = create_udp_socket(addr).map_err(Error::setup(addr))?;
        let local = socket.local_addr().unwrap_or(addr);
        Ok(Self {
            socket,
            local,
            buf: vec![0u8; MAX_QUACK_DATAGRAM + 1],
        })
    }
}

impl QuackChannel for DatagramChannel {
    fn transport(&self) -> Transport {
        Transport::Datagram
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn try_recv(&mut self) -> Result<Recv> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((0, _)) => Ok(Recv::Idle),
            Ok((len, from)) => Ok(Recv::Record {
                bytes: Bytes::copy_from_slice(&self.buf[..len]),
                from,
            }),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(Recv::Idle)
            }
            // ICMP feedback from a reset sent to a closed port. Not ours to act on.
            Err(ref e)
                if e.kind() == io::ErrorKind::ConnectionRefused
                    || e.kind() == io::ErrorKind::ConnectionReset =>
            {
                Ok(Recv::Idle)
            }
            Err(e) => Err(Error::ChannelIo(e)),
        }
    }

    fn send_reset(&mut self, signal: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(signal, to)
    }
}

// ── Stream ──────────────────────────────────────────────────────────────

/// Bound and listening stream endpoint, waiting for the observer.
pub struct StreamListener {
    socket: Socket,
    local: SocketAddr,
}

impl StreamListener {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let setup = |e| Error::ChannelSetup { addr, source: e };
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(setup)?;
        socket.set_reuse_address(true).map_err(setup)?;
        socket.bind(&addr.into()).map_err(setup)?;
        socket.listen(1).map_err(setup)?;
        let local = socket_local_addr(&socket, addr);
        Ok(Self { socket, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Block until one observer connects. The listener is closed afterwards.
    pub fn accept(self, record_size: usize) -> Result<StreamChannel> {
        let addr = self.local;
        let setup = |e| Error::ChannelSetup { addr, source: e };

        let (conn, peer) = self.socket.accept().map_err(setup)?;
        conn.set_nonblocking(true).map_err(setup)?;
        conn.set_nodelay(true).map_err(setup)?;
        let peer = peer.as_socket().unwrap_or(addr);

        let reset_socket = create_udp_socket(unspecified(&addr)).map_err(setup)?;

        Ok(StreamChannel {
            stream: Some(conn.into()),
            reset_socket,
            local: addr,
            peer,
            buf: vec![0u8; record_size],
            offset: 0,
        })
    }
}

/// TCP side channel. Records are exactly `record_size` bytes; partial reads
/// are buffered and never surfaced.
pub struct StreamChannel {
    stream: Option<TcpStream>,
    reset_socket: UdpSocket,
    local: SocketAddr,
    peer: SocketAddr,
    buf: Vec<u8>,
    // Always < buf.len() between calls.
    offset: usize,
}

impl StreamChannel {
    pub fn record_size(&self) -> usize {
        self.buf.len()
    }

    /// Bytes of the current record received so far.
    pub fn buffered(&self) -> usize {
        self.offset
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl QuackChannel for StreamChannel {
    fn transport(&self) -> Transport {
        Transport::Stream
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn try_recv(&mut self) -> Result<Recv> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Recv::Closed);
        };

        // Never read past the current record.
        match stream.read(&mut self.buf[self.offset..]) {
            Ok(0) => {
                if self.offset > 0 {
                    warn!(
                        "sidecar: peer {} closed mid-record, discarding {} bytes",
                        self.peer, self.offset
                    );
                }
                self.stream = None;
                self.offset = 0;
                Ok(Recv::Closed)
            }
            Ok(n) => {
                self.offset += n;
                if self.offset < self.buf.len() {
                    return Ok(Recv::Partial { buffered: self.offset });
                }
                self.offset = 0;
                Ok(Recv::Record {
                    bytes: Bytes::copy_from_slice(&self.buf),
                    from: self.peer,
                })
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(Recv::Idle)
            }
            Err(e) => Err(Error::ChannelIo(e)),
        }
    }

    fn send_reset(&mut self, signal: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.reset_socket.send_to(signal, to)
    }
}
