//! Command dispatch over a shared control block, one implementation per
//! device kind. The kind is fixed when the session opens its device.
use std::io;
use std::os::unix::io::{BorrowedFd, OwnedFd};

use aserver_api::{BlockLayout, DeviceKind};
use ipc::ControlBlock;
use nix::errno::Errno;
use nix::poll::PollFlags;
use zerocopy::{AsBytes, FromBytes};

use crate::device::DevResult;
use crate::log;

pub mod ctl;
pub mod pcm;

pub use ctl::CtlShm;
pub use pcm::PcmShm;

/// How the response signal is sent.
#[derive(Debug)]
pub enum Reply {
    Signal,
    Descriptor(OwnedFd),
}

#[derive(Debug)]
pub struct Outcome {
    pub reply: Reply,
    /// The command would have blocked; the device descriptor should be
    /// watched until it is ready.
    pub awaiting: bool,
    /// The client closed the device; the session ends after the reply.
    pub close: bool,
}

impl Outcome {
    fn signal() -> Self {
        Outcome {
            reply: Reply::Signal,
            awaiting: false,
            close: false,
        }
    }
}

/// Readiness bridge action on the client's data socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bridge {
    /// Read and discard a byte so the client sees the socket writable.
    Consume,
    /// Write a byte so the client sees the socket readable.
    Produce,
}

pub trait Transport: Send {
    fn kind(&self) -> DeviceKind;

    /// Segment id handed to the client as the open cookie.
    fn shmid(&self) -> Option<i32>;

    /// Consumes the pending command from the control block, runs it and
    /// stores its result. `can_pass_fd` is false on sockets that cannot
    /// carry descriptors.
    fn dispatch(&mut self, can_pass_fd: bool) -> Outcome;

    /// The device descriptor and the events that mean it is ready.
    fn poll_target(&self) -> Option<(BorrowedFd<'_>, PollFlags)>;

    fn bridge(&self) -> Bridge;

    /// Closes the device, records the result and marks the segment for
    /// removal. Safe to call more than once.
    fn close(&mut self);
}

pub(crate) fn fault(e: ipc::Error) -> Errno {
    log::debug!("control block access refused: {}", e);
    Errno::EFAULT
}

pub(crate) fn io_errno(e: io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Reads a parameter struct, lets the device fill it in, writes it back.
pub(crate) fn inout<L, T, F>(block: &mut ControlBlock<L>, f: F) -> DevResult<i64>
where
    L: BlockLayout,
    T: AsBytes + FromBytes,
    F: FnOnce(&mut T) -> DevResult<()>,
{
    let mut value: T = block.params().map_err(fault)?;
    f(&mut value)?;
    block.set_params(&value).map_err(fault)?;
    Ok(0)
}

pub(crate) fn result_code(res: DevResult<i64>) -> i64 {
    match res {
        Ok(v) => v,
        Err(e) => -(e as i64),
    }
}
