use std::io;
use std::net::IpAddr;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The device refused the operation.
    #[error("device error: {0}")]
    Device(Errno),
    /// The session is out of sync with the server or the server is gone.
    /// The stub is unusable from here on and must be closed.
    #[error("bad file descriptor: session is broken")]
    BadFd,
    #[error("session already closed")]
    BadSession,
    #[error("rendezvous failed: {0}")]
    Rendezvous(ipc::Error),
    #[error("{0} is not an address of this host")]
    NotLocal(IpAddr),
    #[error("no address resolved for {0}")]
    NoAddrResolved(String),
    #[error("open request: {0}")]
    Request(#[from] aserver_api::open::Error),
    #[error("IO Error {0}")]
    Io(#[from] io::Error),
    #[error("IPC error: {0}")]
    Ipc(#[from] ipc::Error),
}

impl Error {
    pub(crate) fn from_result(result: i64) -> Self {
        Error::Device(Errno::from_raw(-result as i32))
    }

    /// The errno behind a device error.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Device(e) => Some(*e),
            _ => None,
        }
    }
}
