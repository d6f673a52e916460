//! Audio stream commands and their parameter payloads.
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::open::DeviceKind;

commands! {
    /// Command codes for an audio stream session. Zero means "no command".
    PcmCommand {
        Async = 0x101,
        Info = 0x102,
        ParamsInfo = 0x103,
        Params = 0x104,
        Setup = 0x105,
        ChannelInfo = 0x106,
        ChannelParams = 0x107,
        ChannelSetup = 0x108,
        Status = 0x109,
        State = 0x10a,
        Delay = 0x10b,
        AvailUpdate = 0x10c,
        Prepare = 0x10d,
        Start = 0x10e,
        Drop = 0x10f,
        Drain = 0x110,
        Pause = 0x111,
        Rewind = 0x112,
        WriteFrames = 0x113,
        ReadFrames = 0x114,
        WriteVec = 0x115,
        ReadVec = 0x116,
        MmapCount = 0x117,
        MmapRegion = 0x118,
        Munmap = 0x119,
        MmapForward = 0x11a,
        SetAvailMin = 0x11b,
        PollDescriptor = 0x11c,
        Close = 0x11d,
    }
}

impl PcmCommand {
    /// Commands answered with a descriptor alongside the signal byte.
    pub fn hands_off_fd(self) -> bool {
        matches!(self, PcmCommand::MmapRegion | PcmCommand::PollDescriptor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum PcmState {
    Open = 0,
    Setup = 1,
    Prepared = 2,
    Running = 3,
    Xrun = 4,
    Draining = 5,
    Paused = 6,
}

impl PcmState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => PcmState::Open,
            1 => PcmState::Setup,
            2 => PcmState::Prepared,
            3 => PcmState::Running,
            4 => PcmState::Xrun,
            5 => PcmState::Draining,
            6 => PcmState::Paused,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PcmFormat {
    S8 = 0,
    U8 = 1,
    S16Le = 2,
    S16Be = 3,
    S32Le = 10,
    FloatLe = 14,
    Float64Le = 16,
}

impl PcmFormat {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => PcmFormat::S8,
            1 => PcmFormat::U8,
            2 => PcmFormat::S16Le,
            3 => PcmFormat::S16Be,
            10 => PcmFormat::S32Le,
            14 => PcmFormat::FloatLe,
            16 => PcmFormat::Float64Le,
            _ => return None,
        })
    }

    pub fn sample_bytes(self) -> usize {
        match self {
            PcmFormat::S8 | PcmFormat::U8 => 1,
            PcmFormat::S16Le | PcmFormat::S16Be => 2,
            PcmFormat::S32Le | PcmFormat::FloatLe => 4,
            PcmFormat::Float64Le => 8,
        }
    }

    /// Bit in `PcmParamsInfo::formats`.
    pub fn mask(self) -> u64 {
        1 << self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PcmInfo {
    pub kind: u32,
    pub card: i32,
    pub device: i32,
    pub subdevice: i32,
    pub stream: u32,
    pub flags: u32,
    pub subdevices_count: u32,
    pub subdevices_avail: u32,
    pub id: [u8; 32],
    pub name: [u8; 80],
}

impl PcmInfo {
    pub fn is_pcm(&self) -> bool {
        self.kind == DeviceKind::Pcm as u32
    }
}

/// Ranges a device accepts in `Params`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PcmParamsInfo {
    pub formats: u64,
    pub min_rate: u32,
    pub max_rate: u32,
    pub min_channels: u32,
    pub max_channels: u32,
    pub min_period_size: u32,
    pub max_period_size: u32,
    pub min_buffer_size: u32,
    pub max_buffer_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PcmParams {
    pub format: u32,
    pub rate: u32,
    pub channels: u32,
    pub period_size: u32,
    pub buffer_size: u32,
    pub start_threshold: u32,
    pub avail_min: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PcmSetup {
    pub format: u32,
    pub rate: u32,
    pub channels: u32,
    pub period_size: u32,
    pub buffer_size: u32,
    pub frame_bits: u32,
    pub avail_min: u32,
    pub state: u32,
}

impl PcmSetup {
    pub fn frame_bytes(&self) -> usize {
        self.frame_bits as usize / 8
    }
}

/// Location of one channel inside an interleaved frame, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ChannelInfo {
    pub channel: u32,
    pub first: u32,
    pub step: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ChannelParams {
    pub channel: u32,
    pub enabled: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ChannelSetup {
    pub channel: u32,
    pub enabled: u32,
    pub first: u32,
    pub step: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PcmStatus {
    pub state: u32,
    pub reserved: u32,
    pub trigger_ns: u64,
    pub tstamp_ns: u64,
    pub delay: i64,
    pub avail: u64,
    pub avail_max: u64,
    pub hw_ptr: u64,
    pub appl_ptr: u64,
}

/// Frame count argument shared by transfers, rewind, forward, delay and
/// avail-min.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Frames {
    pub frames: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Pause {
    pub enable: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct AsyncParams {
    pub sig: i32,
    pub pid: i32,
}

/// `WriteVec`/`ReadVec` argument. The data area starts with `count`
/// [`IoVec`] entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct XferVec {
    pub count: u32,
    pub reserved: u32,
}

pub const MAX_IOVECS: usize = 64;

/// One buffer of a vector transfer, relative to the start of the data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct IoVec {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct MmapRegion {
    pub index: u32,
    pub reserved: u32,
    pub offset: u64,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PARAMS_CAPACITY;
    use std::mem::size_of;

    #[test]
    fn command_codes() {
        assert_eq!(PcmCommand::from_raw(0), None);
        assert_eq!(PcmCommand::from_raw(0x113), Some(PcmCommand::WriteFrames));
        assert_eq!(PcmCommand::from_raw(0x11d), Some(PcmCommand::Close));
        assert_eq!(PcmCommand::from_raw(0x11e), None);
        assert!(PcmCommand::PollDescriptor.hands_off_fd());
        assert!(!PcmCommand::Status.hands_off_fd());
    }

    #[test]
    fn params_fit_in_block() {
        for size in [
            size_of::<PcmInfo>(),
            size_of::<PcmParamsInfo>(),
            size_of::<PcmParams>(),
            size_of::<PcmSetup>(),
            size_of::<PcmStatus>(),
            size_of::<MmapRegion>(),
        ] {
            assert!(size <= PARAMS_CAPACITY);
        }
        assert_eq!(size_of::<IoVec>(), 16);
    }

    #[test]
    fn formats() {
        assert_eq!(PcmFormat::from_raw(2), Some(PcmFormat::S16Le));
        assert_eq!(PcmFormat::S16Le.sample_bytes(), 2);
        assert_eq!(PcmFormat::FloatLe.mask(), 1 << 14);
        assert_eq!(PcmFormat::from_raw(5), None);
    }
}
