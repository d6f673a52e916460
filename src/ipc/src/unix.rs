//! Descriptor passing over a unix domain stream socket.
//!
//! Every message is exactly one payload byte, optionally carrying one
//! descriptor as `SCM_RIGHTS` ancillary data.
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::Error;

/// Sends one byte together with `fd`.
pub fn send_fd<S: AsFd>(sock: &S, fd: BorrowedFd<'_>) -> Result<(), Error> {
    let payload = [0u8; 1];
    let iov = [IoSlice::new(&payload)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let n = socket::sendmsg::<()>(
        sock.as_fd().as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )?;
    if n != 1 {
        return Err(Error::ShortTransfer {
            expected: 1,
            actual: n,
        });
    }
    Ok(())
}

/// Receives one byte and the descriptor sent with it, if any.
///
/// A read of anything but one byte is a protocol failure, whether or not a
/// descriptor arrived; a descriptor received alongside it is closed.
pub fn recv_fd<S: AsFd>(sock: &S) -> Result<Option<OwnedFd>, Error> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let msg = socket::recvmsg::<()>(
        sock.as_fd().as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let mut received = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            // SAFETY: the kernel just installed these descriptors for us and
            // nothing else refers to them.
            received.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    if msg.bytes != 1 {
        return Err(Error::ShortTransfer {
            expected: 1,
            actual: msg.bytes,
        });
    }
    Ok(received.into_iter().next())
}
