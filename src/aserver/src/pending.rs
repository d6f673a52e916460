//! A freshly accepted connection waiting for its sibling.
use std::os::unix::io::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

use ipc::{handshake, Peer, Socket};
use nix::poll::PollFlags;

#[derive(Debug)]
pub struct Pending {
    id: u64,
    sock: Socket,
    peer: Peer,
    local: bool,
    cookie: Option<u32>,
    since: Instant,
}

impl Pending {
    pub fn new(id: u64, sock: Socket, peer: Peer, local: bool) -> Self {
        Pending {
            id,
            sock,
            peer,
            local,
            cookie: None,
            since: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn cookie(&self) -> Option<u32> {
        self.cookie
    }

    /// Before the exchange, readable means the value arrived. After it the
    /// client sends nothing until paired, so readable means it went away.
    pub fn interest(&self) -> PollFlags {
        PollFlags::POLLIN
    }

    pub fn exchanged(&self) -> bool {
        self.cookie.is_some()
    }

    /// Reads the client's rendezvous value and echoes it back.
    pub fn exchange(&mut self) -> Result<u32, ipc::Error> {
        let cookie = handshake::read_cookie(&mut self.sock)?;
        handshake::write_cookie(&mut self.sock, cookie)?;
        self.cookie = Some(cookie);
        Ok(cookie)
    }

    pub fn expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.since) >= timeout
    }

    pub fn into_socket(self) -> Socket {
        self.sock
    }
}

impl AsFd for Pending {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}
