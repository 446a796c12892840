//! Readiness set for the sidecar loop, backed by `poll(2)`.
//!
//! The engine registers its sockets, the scheduler adds the side channel,
//! and one bounded wait covers both. Capacity is fixed: overflowing it is a
//! fatal error, never a silently dropped descriptor.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::{Error, Result};

/// Descriptor capacity of one readiness set (FD_SETSIZE on Linux).
pub const MAX_POLL_FDS: usize = 1024;

/// What a registered descriptor is waited on for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Self::Read => libc::POLLIN,
            Self::Write => libc::POLLOUT,
            Self::ReadWrite => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// Descriptors plus their readiness after the last [`InterestSet::wait`].
pub struct InterestSet {
    fds: Vec<libc::pollfd>,
    limit: usize,
}

impl std::fmt::Debug for InterestSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fds: Vec<RawFd> = self.fds.iter().map(|p| p.fd).collect();
        f.debug_struct("InterestSet")
            .field("fds", &fds)
            .field("limit", &self.limit)
            .finish()
    }
}

impl Default for InterestSet {
    fn default() -> Self {
        Self::new()
    }
}

impl InterestSet {
    pub fn new() -> Self {
        Self::with_limit(MAX_POLL_FDS)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            fds: Vec::with_capacity(limit.min(64)),
            limit,
        }
    }

    /// Forget every registration.
    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Add `fd`. Registering the same descriptor twice merges the interests.
    pub fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if let Some(entry) = self.fds.iter_mut().find(|p| p.fd == fd) {
            entry.events |= interest.events();
            return Ok(());
        }
        if self.fds.len() >= self.limit {
            return Err(Error::InterestOverflow { limit: self.limit });
        }
        self.fds.push(libc::pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        });
        Ok(())
    }

    fn revents(&self, fd: RawFd) -> libc::c_short {
        self.fds
            .iter()
            .find(|p| p.fd == fd)
            .map(|p| p.revents)
            .unwrap_or(0)
    }

    /// Readable, hung up, or errored: a read will not block.
    pub fn is_readable(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
    }

    pub fn is_writable(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLOUT | libc::POLLERR) != 0
    }

    /// Number of descriptors that reported any event.
    pub fn ready_count(&self) -> usize {
        self.fds.iter().filter(|p| p.revents != 0).count()
    }

    /// Block until something is ready or `timeout` passes. Returns the number
    /// of ready descriptors. An interrupted wait reports zero.
    pub fn wait(&mut self, timeout: Duration) -> Result<usize> {
        for entry in &mut self.fds {
            entry.revents = 0;
        }

        // Round sub-millisecond waits up so a pending deadline never spins.
        let mut millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        if millis == 0 && !timeout.is_zero() {
            millis = 1;
        }

        // SAFETY: `fds` is a live, exclusively borrowed buffer of `len()`
        // initialized pollfd entries for the duration of the call.
        let n = unsafe {
            libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, millis)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Poll(err));
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::fd::AsRawFd;
    use std::time::Instant;

    #[test]
    fn overflow_is_an_error() {
        let mut set = InterestSet::with_limit(2);
        set.register(10, Interest::Read).unwrap();
        set.register(11, Interest::Write).unwrap();
        match set.register(12, Interest::Read) {
            Err(Error::InterestOverflow { limit }) => assert_eq!(limit, 2),
            other => panic!("expected overflow, got {:?}", other),
        }
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn duplicate_registration_merges() {
        let mut set = InterestSet::with_limit(1);
        set.register(5, Interest::Read).unwrap();
        set.register(5, Interest::Write).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.fds[0].events, libc::POLLIN | libc::POLLOUT);
    }

    #[test]
    fn wait_times_out_when_idle() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut set = InterestSet::new();
        set.register(socket.as_raw_fd(), Interest::Read).unwrap();

        let start = Instant::now();
        let ready = set.wait(Duration::from_millis(20)).unwrap();
        assert_eq!(ready, 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(!set.is_readable(socket.as_raw_fd()));
    }

    #[test]
    fn wait_reports_readable_socket() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"quack", receiver.local_addr().unwrap()).unwrap();

        let mut set = InterestSet::new();
        set.register(receiver.as_raw_fd(), Interest::Read).unwrap();
        set.register(sender.as_raw_fd(), Interest::Read).unwrap();

        let ready = set.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(ready, 1);
        assert_eq!(set.ready_count(), 1);
        assert!(set.is_readable(receiver.as_raw_fd()));
        assert!(!set.is_readable(sender.as_raw_fd()));
    }

    #[test]
    fn unregistered_fd_is_never_ready() {
        let set = InterestSet::new();
        assert!(!set.is_readable(3));
        assert!(!set.is_writable(3));
    }
}
