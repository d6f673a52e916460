//! The command round trip shared by both stubs.
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use aserver_api::{BlockLayout, OpenRequest};
use ipc::{handshake, ControlBlock, Socket};
use nix::errno::Errno;
use nix::poll::{PollFlags, PollTimeout};
use nix::sys::socket::{setsockopt, sockopt};

use crate::connect::{self, ServerAddr};
use crate::log;
use crate::Error;

/// What readiness of the data socket means for this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Playback: writable when the device has room.
    Writable,
    /// Capture and mixer events: readable when data is waiting.
    Readable,
}

impl Readiness {
    fn events(self) -> PollFlags {
        match self {
            Readiness::Writable => PollFlags::POLLOUT,
            Readiness::Readable => PollFlags::POLLIN,
        }
    }
}

pub(crate) struct Channel<L: BlockLayout> {
    data: Socket,
    ctrl: Socket,
    block: Option<ControlBlock<L>>,
    readiness: Readiness,
    poisoned: bool,
}

impl<L: BlockLayout> Channel<L> {
    pub(crate) fn open(
        addr: &ServerAddr,
        req: &OpenRequest,
        readiness: Readiness,
    ) -> Result<Self, Error> {
        let (data, mut ctrl) = connect::connect(addr)?;
        let cookie = connect::open(&mut ctrl, req)?;
        let block = ControlBlock::<L>::attach(cookie)?;
        data.set_nonblocking(true)?;
        if readiness == Readiness::Writable && data.is_unix() {
            // the kernel rounds up to its minimum, so one byte is enough to
            // flip the socket between writable and full
            setsockopt(&data, sockopt::SndBuf, &0).map_err(ipc::Error::Sys)?;
        }
        let mut channel = Channel {
            data,
            ctrl,
            block: Some(block),
            readiness,
            poisoned: false,
        };
        channel.clean_poll()?;
        log::debug!("opened {} \"{}\" on segment {}", L::NAME, req.name, cookie);
        Ok(channel)
    }

    pub(crate) fn shmid(&self) -> Option<i32> {
        self.block.as_ref().and_then(ControlBlock::shmid)
    }

    pub(crate) fn block(&self) -> Result<&ControlBlock<L>, Error> {
        self.usable()?;
        self.block.as_ref().ok_or(Error::BadSession)
    }

    pub(crate) fn block_mut(&mut self) -> Result<&mut ControlBlock<L>, Error> {
        self.usable()?;
        self.block.as_mut().ok_or(Error::BadSession)
    }

    fn usable(&self) -> Result<(), Error> {
        if self.block.is_none() {
            return Err(Error::BadSession);
        }
        if self.poisoned {
            return Err(Error::BadFd);
        }
        Ok(())
    }

    /// The socket an application polls to learn the device is ready.
    pub(crate) fn poll_descriptor(&self) -> BorrowedFd<'_> {
        self.data.as_fd()
    }

    /// Runs `cmd` with the parameters already in the block.
    pub(crate) fn action(&mut self, cmd: u32) -> Result<i64, Error> {
        self.exchange(cmd, false).map(|(result, _)| result)
    }

    /// Runs a command answered with a descriptor.
    pub(crate) fn action_fd(&mut self, cmd: u32) -> Result<(i64, OwnedFd), Error> {
        match self.exchange(cmd, true)? {
            (result, Some(fd)) => Ok((result, fd)),
            (_, None) => {
                self.poisoned = true;
                Err(Error::BadFd)
            }
        }
    }

    fn exchange(&mut self, cmd: u32, want_fd: bool) -> Result<(i64, Option<OwnedFd>), Error> {
        self.usable()?;
        self.clean_poll()?;
        let res = self.round_trip(cmd, want_fd);
        if let Err(Error::BadFd) = res {
            log::warn!("{} session broken on command {:#x}", L::NAME, cmd);
            self.poisoned = true;
        }
        res
    }

    fn round_trip(&mut self, cmd: u32, want_fd: bool) -> Result<(i64, Option<OwnedFd>), Error> {
        let block = self.block.as_ref().ok_or(Error::BadSession)?;
        if handshake::hung_up(&self.ctrl).unwrap_or(true) {
            return Err(Error::BadFd);
        }
        block.set_cmd(cmd);
        handshake::send_signal(&mut self.ctrl).map_err(|_| Error::BadFd)?;
        let fd = if want_fd {
            ipc::recv_fd(&self.ctrl).map_err(|_| Error::BadFd)?
        } else {
            handshake::recv_signal(&mut self.ctrl).map_err(|_| Error::BadFd)?;
            None
        };
        if block.cmd() != 0 {
            return Err(Error::BadFd);
        }
        let result = block.result();
        if result < 0 {
            return Err(Error::from_result(result));
        }
        Ok((result, fd))
    }

    /// Resets the data socket so the next readiness reported on it comes
    /// from the server: playback keeps it full, capture keeps it empty.
    pub(crate) fn clean_poll(&mut self) -> Result<(), Error> {
        match self.readiness {
            // a tcp send buffer never fills from a few bytes; playback over
            // tcp sees the data socket as always writable
            Readiness::Writable if !self.data.is_unix() => Ok(()),
            Readiness::Writable => loop {
                let revents =
                    handshake::poll_one(&self.data, PollFlags::POLLOUT, PollTimeout::ZERO)
                        .map_err(ipc::Error::Sys)?;
                if !revents.contains(PollFlags::POLLOUT) {
                    return Ok(());
                }
                match self.data.write(&[0u8]) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            },
            Readiness::Readable => {
                let mut buf = [0u8; 64];
                loop {
                    match self.data.read(&mut buf) {
                        Ok(0) => return Ok(()),
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Blocks until the server reports the device ready, or `timeout`.
    /// Returns whether it became ready.
    pub(crate) fn wait(&self, timeout: PollTimeout) -> Result<bool, Error> {
        self.usable()?;
        let events = self.readiness.events();
        let revents =
            handshake::poll_one(&self.data, events, timeout).map_err(ipc::Error::Sys)?;
        if revents.intersects(handshake::hangup_flags()) {
            return Err(Error::BadFd);
        }
        Ok(revents.intersects(events))
    }

    /// Retries `f` while the device would block, waiting on the data socket
    /// in between. With `nonblock` the first `EAGAIN` is returned as is.
    pub(crate) fn retry<T, F>(&mut self, nonblock: bool, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Self) -> Result<T, Error>,
    {
        loop {
            match f(self) {
                Err(Error::Device(Errno::EAGAIN)) if !nonblock => {
                    self.wait(PollTimeout::NONE)?;
                }
                res => return res,
            }
        }
    }

    /// Sends the close command once and releases the block and sockets
    /// whatever the server answers.
    pub(crate) fn close(&mut self, cmd: u32) -> Result<(), Error> {
        if self.block.is_none() {
            return Err(Error::BadSession);
        }
        let res = if self.poisoned {
            Ok(())
        } else {
            self.round_trip(cmd, false).map(|_| ())
        };
        self.block = None;
        let _ = self.data.shutdown();
        let _ = self.ctrl.shutdown();
        res
    }
}
