//! Listening and connected stream sockets, over a filesystem path or TCP.
use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

/// Where an accepted connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Local,
    Inet(SocketAddr),
}

/// A connected stream socket of either domain.
#[derive(Debug)]
pub enum Socket {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Socket {
    pub fn connect_local<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        UnixStream::connect(path).map(Socket::Unix)
    }

    pub fn connect_inet(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Socket::Tcp(stream))
    }

    /// Only unix domain sockets can carry descriptors.
    pub fn is_unix(&self) -> bool {
        matches!(self, Socket::Unix(_))
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Socket::Unix(s) => s.set_nonblocking(nonblocking),
            Socket::Tcp(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Socket::Unix(s) => s.shutdown(Shutdown::Both),
            Socket::Tcp(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Unix(s) => s.read(buf),
            Socket::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Unix(s) => s.write(buf),
            Socket::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Socket::Unix(s) => s.as_fd(),
            Socket::Tcp(s) => s.as_fd(),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

/// A non-blocking listener. A local listener unlinks its path when dropped.
#[derive(Debug)]
pub enum Listener {
    Local { inner: UnixListener, path: PathBuf },
    Inet(TcpListener),
}

/// Binds a stream socket at `path`, removing a stale socket file first.
pub fn open_local_socket<P: AsRef<Path>>(path: P) -> io::Result<Listener> {
    let path = path.as_ref();
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    let inner = UnixListener::bind(path)?;
    inner.set_nonblocking(true)?;
    Ok(Listener::Local {
        inner,
        path: path.to_path_buf(),
    })
}

/// Binds a TCP stream socket on all local addresses.
pub fn open_inet_socket(port: u16) -> io::Result<Listener> {
    let inner = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
    inner.set_nonblocking(true)?;
    Ok(Listener::Inet(inner))
}

impl Listener {
    /// Accepted sockets are blocking; callers only read after poll.
    pub fn accept(&self) -> io::Result<(Socket, Peer)> {
        match self {
            Listener::Local { inner, .. } => {
                let (stream, _) = inner.accept()?;
                stream.set_nonblocking(false)?;
                Ok((Socket::Unix(stream), Peer::Local))
            }
            Listener::Inet(inner) => {
                let (stream, addr) = inner.accept()?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok((Socket::Tcp(stream), Peer::Inet(addr)))
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Local { .. } => None,
            Listener::Inet(inner) => inner.local_addr().ok(),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Local { inner, .. } => inner.as_fd(),
            Listener::Inet(inner) => inner.as_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Local { path, .. } = self {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ipc-socket-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn local_listener_replaces_stale_path() {
        let path = temp_path("stale");
        fs::write(&path, b"stale").unwrap();
        let listener = open_local_socket(&path).unwrap();

        let mut client = Socket::connect_local(&path).unwrap();
        let (mut server, peer) = loop {
            match listener.accept() {
                Ok(conn) => break conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("accept: {e}"),
            }
        };
        assert_eq!(peer, Peer::Local);
        assert!(server.is_unix());

        client.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn inet_listener_reports_peer() {
        let listener = open_inet_socket(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let _client = Socket::connect_inet(SocketAddr::from(([127, 0, 0, 1], port))).unwrap();
        let (server, peer) = loop {
            match listener.accept() {
                Ok(conn) => break conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("accept: {e}"),
            }
        };
        assert!(!server.is_unix());
        match peer {
            Peer::Inet(addr) => assert!(addr.ip().is_loopback()),
            Peer::Local => panic!("expected an inet peer"),
        }
    }
}
