//! Reaching the server: address resolution, the two-socket rendezvous and
//! the open request.
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use aserver_api::open::OPEN_ANSWER_SIZE;
use aserver_api::{OpenAnswer, OpenRequest};
use ipc::{handshake, Socket};
use zerocopy::FromBytes;

use crate::log;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    Local(PathBuf),
    Inet { host: String, port: u16 },
}

enum Target {
    Local(PathBuf),
    Inet(SocketAddr),
}

impl Target {
    /// Network addresses must belong to this host: the control block is
    /// shared memory.
    fn resolve(addr: &ServerAddr) -> Result<Self, Error> {
        match addr {
            ServerAddr::Local(path) => Ok(Target::Local(path.clone())),
            ServerAddr::Inet { host, port } => {
                let addrs: Vec<SocketAddr> = (host.as_str(), *port).to_socket_addrs()?.collect();
                let first = addrs
                    .first()
                    .copied()
                    .ok_or_else(|| Error::NoAddrResolved(host.clone()))?;
                for addr in &addrs {
                    if ipc::locality::is_local(addr.ip())? {
                        return Ok(Target::Inet(*addr));
                    }
                }
                Err(Error::NotLocal(first.ip()))
            }
        }
    }

    fn connect(&self) -> io::Result<Socket> {
        match self {
            Target::Local(path) => Socket::connect_local(path),
            Target::Inet(addr) => Socket::connect_inet(*addr),
        }
    }
}

static NEXT_COOKIE: AtomicU32 = AtomicU32::new(0);

/// Unique within the process; the pid spreads values across processes.
pub(crate) fn next_cookie() -> u32 {
    std::process::id().rotate_left(16) ^ NEXT_COOKIE.fetch_add(1, Ordering::Relaxed)
}

/// Connects the data socket, then the control socket, each proving its
/// pairing with the same rendezvous value.
pub(crate) fn connect(addr: &ServerAddr) -> Result<(Socket, Socket), Error> {
    let target = Target::resolve(addr)?;
    let cookie = next_cookie();
    let mut data = target.connect()?;
    handshake::rendezvous(&mut data, cookie).map_err(Error::Rendezvous)?;
    let mut ctrl = target.connect()?;
    handshake::rendezvous(&mut ctrl, cookie).map_err(Error::Rendezvous)?;
    log::debug!("connected to {:?} with rendezvous value {:#x}", addr, cookie);
    Ok((data, ctrl))
}

/// Sends the open request and returns the cookie naming the control block.
pub(crate) fn open(ctrl: &mut Socket, req: &OpenRequest) -> Result<i32, Error> {
    ctrl.write_all(&req.encode()?)?;
    let mut buf = [0u8; OPEN_ANSWER_SIZE];
    ctrl.read_exact(&mut buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::BadFd,
        _ => Error::Io(e),
    })?;
    let answer = OpenAnswer::read_from(&buf[..]).ok_or(Error::BadFd)?;
    if answer.result < 0 {
        return Err(Error::from_result(answer.result));
    }
    Ok(answer.cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_do_not_repeat() {
        let a = next_cookie();
        let b = next_cookie();
        let c = next_cookie();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn remote_address_is_refused() {
        let addr = ServerAddr::Inet {
            host: "203.0.113.7".to_owned(),
            port: 8024,
        };
        assert!(matches!(Target::resolve(&addr), Err(Error::NotLocal(_))));
    }

    #[test]
    fn loopback_is_accepted() {
        let addr = ServerAddr::Inet {
            host: "127.0.0.1".to_owned(),
            port: 8024,
        };
        assert!(matches!(Target::resolve(&addr), Ok(Target::Inet(_))));
    }
}
