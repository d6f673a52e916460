//! One-byte signalling and the rendezvous value exchange.
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recv, MsgFlags};

use crate::Error;

/// Events that mean the peer is gone, whatever else is reported. `poll`
/// reports these without being asked for them.
pub fn hangup_flags() -> PollFlags {
    PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL
}

/// Polls a single descriptor, retrying on `EINTR`. Returns the reported events.
pub fn poll_one<F: AsFd>(fd: &F, events: PollFlags, timeout: PollTimeout) -> Result<PollFlags, Errno> {
    loop {
        let mut fds = [PollFd::new(fd.as_fd(), events)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(PollFlags::empty()),
            Ok(_) => return Ok(fds[0].revents().unwrap_or(PollFlags::empty())),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Peeks at the socket without consuming anything. An orderly shutdown by
/// the peer reads as end of stream.
pub fn peer_closed<F: AsFd>(fd: &F) -> Result<bool, Errno> {
    let mut byte = [0u8; 1];
    let flags = MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT;
    match recv(fd.as_fd().as_raw_fd(), &mut byte, flags) {
        Ok(0) => Ok(true),
        Ok(_) => Ok(false),
        Err(Errno::EAGAIN | Errno::EINTR) => Ok(false),
        Err(Errno::ECONNRESET | Errno::EPIPE) => Ok(true),
        Err(e) => Err(e),
    }
}

/// Non-blocking check whether the peer has hung up.
///
/// A TCP peer that closes only shows up as readable, so a readable socket is
/// peeked for end of stream.
pub fn hung_up<F: AsFd>(fd: &F) -> Result<bool, Errno> {
    let revents = poll_one(fd, PollFlags::POLLIN, PollTimeout::ZERO)?;
    if revents.intersects(hangup_flags()) {
        return Ok(true);
    }
    if revents.contains(PollFlags::POLLIN) {
        return peer_closed(fd);
    }
    Ok(false)
}

fn transfer_result(expected: usize, res: io::Result<usize>) -> Result<(), Error> {
    match res {
        Ok(n) if n == expected => Ok(()),
        Ok(n) => Err(Error::ShortTransfer {
            expected,
            actual: n,
        }),
        Err(e) => Err(e.into()),
    }
}

pub fn send_signal<W: Write>(w: &mut W) -> Result<(), Error> {
    transfer_result(1, w.write(&[0]))
}

pub fn recv_signal<R: Read>(r: &mut R) -> Result<(), Error> {
    let mut buf = [0u8; 1];
    transfer_result(1, r.read(&mut buf))
}

pub fn write_cookie<W: Write>(w: &mut W, cookie: u32) -> Result<(), Error> {
    transfer_result(4, w.write(&cookie.to_ne_bytes()))
}

/// A single read: a value split across segments counts as short and the
/// connection is dropped.
pub fn read_cookie<R: Read>(r: &mut R) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    transfer_result(4, r.read(&mut buf))?;
    Ok(u32::from_ne_bytes(buf))
}

/// Client half of the rendezvous: send `cookie` and expect it echoed back.
pub fn rendezvous<S: Read + Write>(sock: &mut S, cookie: u32) -> Result<(), Error> {
    write_cookie(sock, cookie)?;
    let received = read_cookie(sock)?;
    if received != cookie {
        return Err(Error::CookieMismatch {
            sent: cookie,
            received,
        });
    }
    Ok(())
}
