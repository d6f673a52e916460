//! Transport primitives shared by the audio server and its client stubs:
//! stream sockets, descriptor passing, SysV shared memory and the checked
//! control block living inside it.
use std::io;

use thiserror::Error;

pub mod block;
pub mod handshake;
pub mod locality;
pub mod shm;
pub mod socket;
pub mod unix;

pub use block::ControlBlock;
pub use shm::{SegmentStat, ShmSegment};
pub use socket::{open_inet_socket, open_local_socket, Listener, Peer, Socket};
pub use unix::{recv_fd, send_fd};

pub use nix::errno::Errno;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO: {0}.")]
    Io(#[from] io::Error),
    #[error("System: {0}.")]
    Sys(#[from] Errno),
    #[error("Access of {len} bytes at offset {offset} exceeds capacity {capacity}.")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("Expected {expected} bytes, transferred {actual}.")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("Segment of {actual} bytes is smaller than {expected}.")]
    SegmentTooSmall { expected: usize, actual: usize },
    #[error("Rendezvous mismatch: sent {sent:#x}, received {received:#x}.")]
    CookieMismatch { sent: u32, received: u32 },
}
