//! Data contracts shared bit-for-bit between the audio server and its clients.
//!
//! Nothing in here performs I/O. Both sides run on the same host and the same
//! build, so the layouts are plain `#[repr(C)]` without padding, encoded and
//! decoded through `zerocopy`.
#![allow(missing_docs)]

macro_rules! commands {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $code,)+
        }

        impl $name {
            /// Unknown codes map to `None` and are answered with `ENOSYS`.
            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

pub mod ctl;
pub mod layout;
pub mod open;
pub mod pcm;

pub use layout::{BlockLayout, CtlLayout, PcmLayout};
pub use open::{DeviceKind, OpenAnswer, OpenMode, OpenRequest, Stream, TransportKind};

/// Copies `s` into a fixed, NUL-padded name field, truncating at a
/// character boundary if needed.
pub fn set_name(dst: &mut [u8], s: &str) {
    dst.fill(0);
    let mut n = s.len().min(dst.len().saturating_sub(1));
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// Reads a NUL-padded name field back as a string, stopping at the first NUL.
pub fn name(src: &[u8]) -> &str {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_field_truncates_and_terminates() {
        let mut field = [0xffu8; 8];
        set_name(&mut field, "Master Playback");
        assert_eq!(name(&field), "Master ");
        assert_eq!(field[7], 0);

        set_name(&mut field, "pcm");
        assert_eq!(name(&field), "pcm");
    }

    #[test]
    fn truncation_keeps_whole_characters() {
        let mut field = [0u8; 8];
        // "é" is two bytes and would straddle the last usable byte
        set_name(&mut field, "Volumeé");
        assert_eq!(name(&field), "Volume");
        assert_eq!(&field[6..], &[0, 0]);
    }
}
