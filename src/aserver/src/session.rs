//! One client: a data socket, a control socket and, once opened, a device
//! exposed through a shared control block.
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd};

use aserver_api::open::{OpenHeader, OPEN_HEADER_SIZE};
use aserver_api::{CtlLayout, DeviceKind, OpenAnswer, OpenMode, PcmLayout, Stream, TransportKind};
use ipc::{handshake, ControlBlock, Peer, Socket};
use nix::errno::Errno;
use nix::poll::PollFlags;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

use crate::device::{DevResult, DeviceRegistry};
use crate::log;
use crate::transport::{Bridge, CtlShm, PcmShm, Reply, Transport};

#[derive(Debug, Error)]
pub enum Error {
    #[error("peer hung up")]
    HangUp,
    #[error("session closed by client")]
    Closed,
    #[error("ipc: {0}")]
    Ipc(#[from] ipc::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

struct OpenDevice {
    name: String,
    stream: Stream,
    mode: OpenMode,
    transport: Box<dyn Transport>,
}

enum State {
    Unopened,
    Open(OpenDevice),
    Closed,
}

pub struct Session {
    id: u64,
    data: Socket,
    ctrl: Socket,
    peer: Peer,
    local: bool,
    state: State,
    awaiting: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Unopened => "unopened",
            State::Open(_) => "open",
            State::Closed => "closed",
        };
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &state)
            .field("awaiting", &self.awaiting)
            .finish()
    }
}

fn ipc_errno(e: &ipc::Error) -> Errno {
    match e {
        ipc::Error::Sys(errno) => *errno,
        ipc::Error::Io(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
        _ => Errno::EINVAL,
    }
}

impl Session {
    /// Both sockets are switched to non-blocking: `data` for the readiness
    /// bridge, `ctrl` so a client that stalls mid-request cannot hold the loop.
    pub fn new(id: u64, data: Socket, ctrl: Socket, peer: Peer, local: bool) -> io::Result<Self> {
        data.set_nonblocking(true)?;
        ctrl.set_nonblocking(true)?;
        Ok(Session {
            id,
            data,
            ctrl,
            peer,
            local,
            state: State::Unopened,
            awaiting: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    pub fn shmid(&self) -> Option<i32> {
        match &self.state {
            State::Open(dev) => dev.transport.shmid(),
            _ => None,
        }
    }

    pub fn awaiting(&self) -> bool {
        self.awaiting
    }

    pub fn data_fd(&self) -> BorrowedFd<'_> {
        self.data.as_fd()
    }

    pub fn ctrl_fd(&self) -> BorrowedFd<'_> {
        self.ctrl.as_fd()
    }

    /// The device descriptor, only while a command is waiting on it.
    pub fn device_target(&self) -> Option<(BorrowedFd<'_>, PollFlags)> {
        match &self.state {
            State::Open(dev) if self.awaiting => dev.transport.poll_target(),
            _ => None,
        }
    }

    /// The control socket is readable: either the open request or a
    /// command signal.
    pub fn on_ctrl(&mut self, registry: &DeviceRegistry) -> Result<(), Error> {
        match self.state {
            State::Unopened => self.open(registry),
            State::Open(_) => self.command(),
            State::Closed => Err(Error::Closed),
        }
    }

    pub fn on_data(&mut self, revents: PollFlags) -> Result<(), Error> {
        if revents.intersects(handshake::hangup_flags()) {
            return Err(Error::HangUp);
        }
        Ok(())
    }

    /// The device became ready: reflect it on the client's data socket.
    pub fn on_device(&mut self) -> Result<(), Error> {
        self.awaiting = false;
        let bridge = match &self.state {
            State::Open(dev) => dev.transport.bridge(),
            _ => return Ok(()),
        };
        let res = match bridge {
            Bridge::Consume => {
                let mut byte = [0u8; 1];
                self.data.read(&mut byte)
            }
            Bridge::Produce => self.data.write(&[0u8]),
        };
        match res {
            Ok(0) if bridge == Bridge::Consume => Err(Error::HangUp),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn open(&mut self, registry: &DeviceRegistry) -> Result<(), Error> {
        let mut raw = [0u8; OPEN_HEADER_SIZE];
        let n = match self.ctrl.read(&mut raw) {
            Ok(0) => return Err(Error::HangUp),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if n < OPEN_HEADER_SIZE {
            return Err(ipc::Error::ShortTransfer {
                expected: OPEN_HEADER_SIZE,
                actual: n,
            }
            .into());
        }
        let header = OpenHeader::read_from(&raw[..]).ok_or(Error::HangUp)?;
        let mut name = vec![0u8; header.name_len as usize];
        let got = if name.is_empty() {
            0
        } else {
            match self.ctrl.read(&mut name) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(e.into()),
            }
        };

        let answer = match self.open_device(registry, &header, &name, got) {
            Ok(dev) => {
                let cookie = dev.transport.shmid().unwrap_or(-1);
                log::info!(
                    "session {}: opened {:?} {:?} \"{}\" mode {:?}, segment {}",
                    self.id,
                    dev.transport.kind(),
                    dev.stream,
                    dev.name,
                    dev.mode,
                    cookie
                );
                self.state = State::Open(dev);
                OpenAnswer::ok(cookie)
            }
            Err(e) => {
                log::info!("session {}: open refused: {}", self.id, e);
                OpenAnswer::err(e as i32)
            }
        };
        self.ctrl.write_all(answer.as_bytes())?;
        Ok(())
    }

    fn open_device(
        &self,
        registry: &DeviceRegistry,
        header: &OpenHeader,
        name: &[u8],
        got: usize,
    ) -> DevResult<OpenDevice> {
        if got != name.len() {
            return Err(Errno::EINVAL);
        }
        let kind = DeviceKind::from_raw(header.dev_kind).ok_or(Errno::EINVAL)?;
        match TransportKind::from_raw(header.transport) {
            Some(TransportKind::Shm) => {}
            None => return Err(Errno::EINVAL),
        }
        let stream = Stream::from_raw(header.stream).ok_or(Errno::EINVAL)?;
        let name = std::str::from_utf8(name).map_err(|_| Errno::EINVAL)?;
        if !self.local {
            log::warn!(
                "session {}: shared memory refused to remote peer {:?}",
                self.id,
                self.peer
            );
            return Err(Errno::EINVAL);
        }
        let mode = OpenMode::from_bits_truncate(header.mode);
        let transport: Box<dyn Transport> = match kind {
            DeviceKind::Pcm => {
                let device = registry.open_pcm(name, stream, mode)?;
                let block = ControlBlock::<PcmLayout>::create().map_err(|e| ipc_errno(&e))?;
                Box::new(PcmShm::new(device, block))
            }
            DeviceKind::Ctl => {
                let device = registry.open_ctl(name, mode)?;
                let block = ControlBlock::<CtlLayout>::create().map_err(|e| ipc_errno(&e))?;
                Box::new(CtlShm::new(device, block))
            }
        };
        Ok(OpenDevice {
            name: name.to_owned(),
            stream,
            mode,
            transport,
        })
    }

    fn command(&mut self) -> Result<(), Error> {
        let Session {
            ctrl,
            state,
            awaiting,
            id,
            ..
        } = self;
        let State::Open(dev) = state else {
            return Err(Error::Closed);
        };
        handshake::recv_signal(ctrl).map_err(|e| match e {
            ipc::Error::ShortTransfer { .. } => Error::HangUp,
            e => Error::Ipc(e),
        })?;
        let outcome = dev.transport.dispatch(ctrl.is_unix());
        if outcome.awaiting {
            log::trace!("session {}: waiting on device", id);
            *awaiting = true;
        }
        if handshake::hung_up(ctrl).map_err(ipc::Error::from)? {
            return Err(Error::HangUp);
        }
        match outcome.reply {
            Reply::Signal => handshake::send_signal(ctrl)?,
            Reply::Descriptor(fd) => ipc::send_fd(ctrl, fd.as_fd())?,
        }
        if outcome.close {
            log::debug!("session {}: \"{}\" closed by client", id, dev.name);
            *state = State::Closed;
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let State::Open(dev) = &mut self.state {
            dev.transport.close();
        }
        if let Err(e) = self.ctrl.shutdown() {
            if e.kind() != io::ErrorKind::NotConnected {
                log::debug!("session {}: shutdown: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::null::{NullPcm, NullPcmSettings};
    use aserver_api::open::OPEN_ANSWER_SIZE;
    use aserver_api::pcm::{PcmCommand, PcmInfo};
    use aserver_api::OpenRequest;
    use ipc::ShmSegment;
    use std::os::unix::net::UnixStream;

    fn registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry.register_pcm("default", |stream, _mode| {
            Ok(Box::new(NullPcm::open("default", NullPcmSettings::default(), stream)?)
                as Box<dyn crate::device::PcmDevice>)
        });
        registry
    }

    /// Returns the session plus the client ends of (data, ctrl).
    fn session(local: bool) -> (Session, UnixStream, UnixStream) {
        let (data_client, data_server) = UnixStream::pair().unwrap();
        let (ctrl_client, ctrl_server) = UnixStream::pair().unwrap();
        let peer = if local {
            Peer::Local
        } else {
            Peer::Inet("203.0.113.7:4000".parse().unwrap())
        };
        let session = Session::new(
            1,
            Socket::Unix(data_server),
            Socket::Unix(ctrl_server),
            peer,
            local,
        )
        .unwrap();
        (session, data_client, ctrl_client)
    }

    fn answer(ctrl: &mut UnixStream) -> OpenAnswer {
        let mut buf = [0u8; OPEN_ANSWER_SIZE];
        ctrl.read_exact(&mut buf).unwrap();
        OpenAnswer::read_from(&buf[..]).unwrap()
    }

    fn request(kind: DeviceKind, name: &str) -> OpenRequest {
        OpenRequest::new(kind, name, Stream::Playback, OpenMode::empty())
    }

    #[test]
    fn open_and_command() {
        let registry = registry();
        let (mut session, _data, mut ctrl) = session(true);
        ctrl.write_all(&request(DeviceKind::Pcm, "default").encode().unwrap())
            .unwrap();
        session.on_ctrl(&registry).unwrap();
        let ans = answer(&mut ctrl);
        assert_eq!(ans.result, 0);
        assert!(session.is_open());
        assert_eq!(session.shmid(), Some(ans.cookie));

        let block = ControlBlock::<PcmLayout>::attach(ans.cookie).unwrap();
        block.set_cmd(PcmCommand::Info as u32);
        ctrl.write_all(&[0]).unwrap();
        session.on_ctrl(&registry).unwrap();
        let mut signal = [0u8; 1];
        ctrl.read_exact(&mut signal).unwrap();
        assert_eq!(block.cmd(), 0);
        assert_eq!(block.result(), 0);
        assert!(block.params::<PcmInfo>().unwrap().is_pcm());
    }

    #[test]
    fn unknown_transport_allocates_nothing() {
        let registry = registry();
        let (mut session, _data, mut ctrl) = session(true);
        let mut req = request(DeviceKind::Pcm, "default").encode().unwrap();
        req[1] = 99;
        ctrl.write_all(&req).unwrap();
        session.on_ctrl(&registry).unwrap();
        assert_eq!(answer(&mut ctrl).result, -(Errno::EINVAL as i64));
        assert!(!session.is_open());
        assert_eq!(session.shmid(), None);
    }

    #[test]
    fn short_name_is_einval_and_session_survives() {
        let registry = registry();
        let (mut session, _data, mut ctrl) = session(true);
        let mut req = request(DeviceKind::Pcm, "default").encode().unwrap();
        req[4] = 9;
        ctrl.write_all(&req).unwrap();
        session.on_ctrl(&registry).unwrap();
        assert_eq!(answer(&mut ctrl).result, -(Errno::EINVAL as i64));

        ctrl.write_all(&request(DeviceKind::Pcm, "default").encode().unwrap())
            .unwrap();
        session.on_ctrl(&registry).unwrap();
        assert_eq!(answer(&mut ctrl).result, 0);
    }

    #[test]
    fn unknown_device_is_enoent() {
        let registry = registry();
        let (mut session, _data, mut ctrl) = session(true);
        ctrl.write_all(&request(DeviceKind::Ctl, "default").encode().unwrap())
            .unwrap();
        session.on_ctrl(&registry).unwrap();
        assert_eq!(answer(&mut ctrl).result, -(Errno::ENOENT as i64));
    }

    #[test]
    fn remote_peer_is_refused() {
        let registry = registry();
        let (mut session, _data, mut ctrl) = session(false);
        ctrl.write_all(&request(DeviceKind::Pcm, "default").encode().unwrap())
            .unwrap();
        session.on_ctrl(&registry).unwrap();
        assert_eq!(answer(&mut ctrl).result, -(Errno::EINVAL as i64));
    }

    #[test]
    fn short_header_tears_down() {
        let registry = registry();
        let (mut session, _data, mut ctrl) = session(true);
        // the client keeps the socket open, the session must not wait for more
        ctrl.write_all(&[0, 0]).unwrap();
        assert!(matches!(
            session.on_ctrl(&registry),
            Err(Error::Ipc(ipc::Error::ShortTransfer {
                expected: OPEN_HEADER_SIZE,
                actual: 2
            }))
        ));
    }

    #[test]
    fn closed_before_header_is_hang_up() {
        let registry = registry();
        let (mut session, _data, ctrl) = session(true);
        drop(ctrl);
        assert!(matches!(session.on_ctrl(&registry), Err(Error::HangUp)));
    }

    #[test]
    fn missing_name_bytes_do_not_block() {
        let registry = registry();
        let (mut session, _data, mut ctrl) = session(true);
        let req = request(DeviceKind::Pcm, "default").encode().unwrap();
        ctrl.write_all(&req[..OPEN_HEADER_SIZE]).unwrap();
        session.on_ctrl(&registry).unwrap();
        assert_eq!(answer(&mut ctrl).result, -(Errno::EINVAL as i64));
        assert!(!session.is_open());
    }

    #[test]
    fn spurious_wakeup_keeps_session() {
        let registry = registry();
        let (mut session, _data, _ctrl) = session(true);
        session.on_ctrl(&registry).unwrap();
        assert!(!session.is_open());
    }

    #[test]
    fn drop_releases_segment() {
        let registry = registry();
        let (mut session, _data, mut ctrl) = session(true);
        ctrl.write_all(&request(DeviceKind::Pcm, "default").encode().unwrap())
            .unwrap();
        session.on_ctrl(&registry).unwrap();
        let id = answer(&mut ctrl).cookie;
        assert!(ShmSegment::stat(id).unwrap().is_some());
        drop(session);
        assert!(ShmSegment::stat(id).unwrap().is_none());
    }
}
