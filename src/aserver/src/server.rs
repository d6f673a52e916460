//! The single-threaded event loop: listeners, pending rendezvous sockets,
//! sessions and the device descriptors sessions are waiting on.
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use fnv::FnvHashMap;
use ipc::{handshake, Listener, Peer};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::config::{Config, ServerConfig};
use crate::device::DeviceRegistry;
use crate::log;
use crate::pending::Pending;
use crate::session::{self, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Data,
    Ctrl,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Listener(usize),
    Pending(u64),
    Session(u64, Slot),
}

pub struct Server {
    config: ServerConfig,
    registry: DeviceRegistry,
    listeners: Vec<Listener>,
    pending: Vec<Pending>,
    sessions: FnvHashMap<u64, Session>,
    next_id: u64,
}

impl Server {
    pub fn new(config: &Config, registry: DeviceRegistry) -> anyhow::Result<Self> {
        config.validate()?;
        let mut listeners = Vec::new();
        if let Some(path) = &config.server.socket {
            let listener = ipc::open_local_socket(path)
                .with_context(|| format!("binding local socket at {:?}", path))?;
            log::info!("listening on {:?}", path);
            listeners.push(listener);
        }
        if let Some(port) = config.server.port {
            let listener = ipc::open_inet_socket(port)
                .with_context(|| format!("binding tcp port {}", port))?;
            log::info!("listening on {:?}", listener.local_addr());
            listeners.push(listener);
        }
        if registry.is_empty() {
            log::warn!("no devices configured, every open will fail");
        }
        Ok(Server {
            config: config.server.clone(),
            registry,
            listeners,
            pending: Vec::new(),
            sessions: FnvHashMap::default(),
            next_id: 0,
        })
    }

    /// Address of the TCP listener, useful when bound to port 0.
    pub fn inet_addr(&self) -> Option<SocketAddr> {
        self.listeners.iter().find_map(Listener::local_addr)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn mainloop(&mut self, exit_flag: &AtomicBool) -> anyhow::Result<()> {
        let interval = u16::try_from(self.config.poll_interval_ms)
            .map(PollTimeout::from)
            .unwrap_or(PollTimeout::MAX);
        while !exit_flag.load(Ordering::Relaxed) {
            self.poll_once(interval)?;
        }
        log::info!(
            "exiting with {} sessions and {} pending connections",
            self.sessions.len(),
            self.pending.len()
        );
        Ok(())
    }

    /// Waits once for readiness and runs every handler that became ready.
    /// Returns the number of ready descriptors.
    pub fn poll_once(&mut self, timeout: PollTimeout) -> anyhow::Result<usize> {
        let ready = {
            let mut fds = Vec::new();
            let mut tokens = Vec::new();
            if self.accepting() {
                for (i, listener) in self.listeners.iter().enumerate() {
                    fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
                    tokens.push(Token::Listener(i));
                }
            }
            for p in &self.pending {
                fds.push(PollFd::new(p.as_fd(), p.interest()));
                tokens.push(Token::Pending(p.id()));
            }
            for (&id, s) in &self.sessions {
                // playback data sockets stay readable, so only hang-up is watched
                fds.push(PollFd::new(s.data_fd(), PollFlags::empty()));
                tokens.push(Token::Session(id, Slot::Data));
                fds.push(PollFd::new(s.ctrl_fd(), PollFlags::POLLIN));
                tokens.push(Token::Session(id, Slot::Ctrl));
                if let Some((fd, events)) = s.device_target() {
                    fds.push(PollFd::new(fd, events));
                    tokens.push(Token::Session(id, Slot::Device));
                }
            }
            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(0),
                Err(e) => return Err(e).context("poll"),
            }
            fds.iter()
                .zip(tokens)
                .filter_map(|(fd, token)| match fd.revents() {
                    Some(revents) if !revents.is_empty() => Some((token, revents)),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };

        for &(token, revents) in &ready {
            match token {
                Token::Listener(i) => self.on_listener(i, revents)?,
                Token::Pending(id) => self.on_pending(id, revents),
                Token::Session(id, slot) => self.on_session(id, slot, revents),
            }
        }
        self.reap_pending(Instant::now());
        Ok(ready.len())
    }

    fn accepting(&self) -> bool {
        self.pending.len() < self.config.max_pending && self.sessions.len() < self.config.max_clients
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn on_listener(&mut self, index: usize, revents: PollFlags) -> anyhow::Result<()> {
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            bail!("listener {} failed: {:?}", index, revents);
        }
        while self.accepting() {
            let (sock, peer) = match self.listeners[index].accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e).context("accept"),
            };
            let local = match peer {
                Peer::Local => true,
                Peer::Inet(addr) => ipc::locality::is_local(addr.ip()).unwrap_or_else(|e| {
                    log::warn!("locality check for {}: {}", addr, e);
                    false
                }),
            };
            let id = self.next_id();
            log::debug!("pending {}: accepted from {:?}, local: {}", id, peer, local);
            self.pending.push(Pending::new(id, sock, peer, local));
        }
        Ok(())
    }

    fn on_pending(&mut self, id: u64, revents: PollFlags) {
        let Some(index) = self.pending.iter().position(|p| p.id() == id) else {
            return;
        };
        let pending = &mut self.pending[index];
        if !pending.exchanged() && revents.contains(PollFlags::POLLIN) {
            match pending.exchange() {
                Ok(cookie) => {
                    log::debug!("pending {}: rendezvous value {:#x}", id, cookie);
                    self.pair(index);
                }
                Err(e) => {
                    log::debug!("pending {}: dropped: {}", id, e);
                    self.pending.remove(index);
                }
            }
        } else if revents.intersects(handshake::hangup_flags() | PollFlags::POLLIN) {
            log::debug!("pending {}: hung up before pairing", id);
            self.pending.remove(index);
        }
    }

    /// Merges `index` with an earlier connection carrying the same value.
    fn pair(&mut self, index: usize) {
        let id = self.pending[index].id();
        let cookie = self.pending[index].cookie();
        let Some(sibling) = self
            .pending
            .iter()
            .position(|p| p.id() != id && p.cookie() == cookie)
        else {
            return;
        };
        let (first, second) = if sibling > index {
            let b = self.pending.remove(sibling);
            let a = self.pending.remove(index);
            (a, b)
        } else {
            let a = self.pending.remove(index);
            let b = self.pending.remove(sibling);
            (b, a)
        };
        // the connection that arrived first carries data
        let (data, ctrl) = if first.id() < second.id() {
            (first, second)
        } else {
            (second, first)
        };
        let local = data.is_local() && ctrl.is_local();
        let peer = ctrl.peer();
        let session_id = self.next_id();
        match Session::new(session_id, data.into_socket(), ctrl.into_socket(), peer, local) {
            Ok(session) => {
                log::info!("session {}: connected from {:?}", session_id, peer);
                self.sessions.insert(session_id, session);
            }
            Err(e) => log::warn!("session {}: setup failed: {}", session_id, e),
        }
    }

    fn on_session(&mut self, id: u64, slot: Slot, revents: PollFlags) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let res = match slot {
            Slot::Ctrl if revents.contains(PollFlags::POLLIN) => session.on_ctrl(&self.registry),
            Slot::Ctrl => session.on_data(revents),
            Slot::Data => session.on_data(revents),
            Slot::Device => session.on_device(),
        };
        if let Err(e) = res {
            self.teardown(id, e);
        }
    }

    fn teardown(&mut self, id: u64, reason: session::Error) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        match reason {
            session::Error::HangUp | session::Error::Closed => {
                log::info!("session {}: ended: {}", id, reason)
            }
            e => log::warn!("session {}: torn down: {}", id, e),
        }
        drop(session);
    }

    fn reap_pending(&mut self, now: Instant) {
        let timeout = Duration::from_millis(self.config.pending_timeout_ms);
        self.pending.retain(|p| {
            let expired = p.expired(now, timeout);
            if expired {
                log::info!("pending {}: never paired, dropped", p.id());
            }
            !expired
        });
    }
}
