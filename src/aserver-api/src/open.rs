//! Device-open negotiation sent on the control socket of a fresh session.
use bitflags::bitflags;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceKind {
    Pcm = 0,
    Ctl = 1,
}

impl DeviceKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(DeviceKind::Pcm),
            1 => Some(DeviceKind::Ctl),
            _ => None,
        }
    }
}

/// How the command mailbox is shared. Only SysV shared memory exists;
/// every other value is refused by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportKind {
    Shm = 0,
}

impl TransportKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(TransportKind::Shm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stream {
    Playback = 0,
    Capture = 1,
}

impl Stream {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Stream::Playback),
            1 => Some(Stream::Capture),
            _ => None,
        }
    }
}

bitflags! {
    /// Mode flags requested by the client at open.
    #[derive(Default)]
    pub struct OpenMode: u8 {
        /// Transfers return `EAGAIN` instead of waiting for the device.
        const NONBLOCK = 0b0000_0001;
        /// Deliver a signal on period boundaries.
        const ASYNC = 0b0000_0010;
    }
}

/// Fixed header preceding the device name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct OpenHeader {
    pub dev_kind: u8,
    pub transport: u8,
    pub stream: u8,
    pub mode: u8,
    pub name_len: u8,
}

pub const OPEN_HEADER_SIZE: usize = std::mem::size_of::<OpenHeader>();

#[derive(Debug, Error)]
pub enum Error {
    #[error("device name is {0} bytes, at most 255 fit in the open request")]
    NameTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub kind: DeviceKind,
    pub transport: TransportKind,
    pub stream: Stream,
    pub mode: OpenMode,
    pub name: String,
}

impl OpenRequest {
    pub fn new(kind: DeviceKind, name: &str, stream: Stream, mode: OpenMode) -> Self {
        OpenRequest {
            kind,
            transport: TransportKind::Shm,
            stream,
            mode,
            name: name.to_owned(),
        }
    }

    pub fn header(&self) -> Result<OpenHeader, Error> {
        let name_len = u8::try_from(self.name.len()).map_err(|_| Error::NameTooLong(self.name.len()))?;
        Ok(OpenHeader {
            dev_kind: self.kind as u8,
            transport: self.transport as u8,
            stream: self.stream as u8,
            mode: self.mode.bits(),
            name_len,
        })
    }

    /// Header followed by the raw name bytes, no terminator.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let header = self.header()?;
        let mut buf = Vec::with_capacity(OPEN_HEADER_SIZE + self.name.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        Ok(buf)
    }
}

/// Server reply to an open request. `cookie` is the SysV segment id and is
/// only meaningful when `result == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct OpenAnswer {
    pub result: i64,
    pub cookie: i32,
    pub reserved: u32,
}

pub const OPEN_ANSWER_SIZE: usize = std::mem::size_of::<OpenAnswer>();

impl OpenAnswer {
    pub fn ok(cookie: i32) -> Self {
        OpenAnswer {
            result: 0,
            cookie,
            reserved: 0,
        }
    }

    pub fn err(errno: i32) -> Self {
        OpenAnswer {
            result: -(errno as i64),
            cookie: -1,
            reserved: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_request() {
        let req = OpenRequest::new(DeviceKind::Pcm, "default", Stream::Capture, OpenMode::NONBLOCK);
        let buf = req.encode().unwrap();
        assert_eq!(&buf[..OPEN_HEADER_SIZE], &[0, 0, 1, 1, 7]);
        assert_eq!(&buf[OPEN_HEADER_SIZE..], b"default");
    }

    #[test]
    fn name_too_long() {
        let name = "x".repeat(256);
        let req = OpenRequest::new(DeviceKind::Ctl, &name, Stream::Playback, OpenMode::empty());
        assert!(matches!(req.encode(), Err(Error::NameTooLong(256))));
    }

    #[test]
    fn raw_values_fail_closed() {
        assert_eq!(DeviceKind::from_raw(1), Some(DeviceKind::Ctl));
        assert_eq!(DeviceKind::from_raw(2), None);
        assert_eq!(TransportKind::from_raw(99), None);
        assert_eq!(Stream::from_raw(3), None);
    }

    #[test]
    fn answer_layout() {
        assert_eq!(OPEN_ANSWER_SIZE, 16);
        let answer = OpenAnswer::err(22);
        let back = OpenAnswer::read_from(answer.as_bytes()).unwrap();
        assert_eq!(back.result, -22);
        assert_eq!(back.cookie, -1);
    }
}
