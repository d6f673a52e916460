//! Mixer control commands and their parameter payloads.
use zerocopy::{AsBytes, FromBytes, FromZeroes};

commands! {
    /// Command codes for a control session. Zero means "no command".
    CtlCommand {
        Card = 0x201,
        HwInfo = 0x202,
        ElemList = 0x203,
        ElemInfo = 0x204,
        ElemRead = 0x205,
        ElemWrite = 0x206,
        HwdepNextDevice = 0x207,
        HwdepInfo = 0x208,
        PcmNextDevice = 0x209,
        PcmInfo = 0x20a,
        PcmPreferSubdevice = 0x20b,
        RawmidiNextDevice = 0x20c,
        RawmidiInfo = 0x20d,
        RawmidiPreferSubdevice = 0x20e,
        ReadEvent = 0x20f,
        PollDescriptor = 0x210,
        Close = 0x211,
    }
}

impl CtlCommand {
    pub fn hands_off_fd(self) -> bool {
        matches!(self, CtlCommand::PollDescriptor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct CardInfo {
    pub card: i32,
    pub reserved: u32,
    pub id: [u8; 16],
    pub driver: [u8; 16],
    pub name: [u8; 32],
    pub longname: [u8; 80],
    pub mixername: [u8; 80],
    pub components: [u8; 64],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ElemIface {
    Card = 0,
    Hwdep = 1,
    Mixer = 2,
    Pcm = 3,
    Rawmidi = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ElemId {
    pub numid: u32,
    pub iface: u32,
    pub device: u32,
    pub subdevice: u32,
    pub index: u32,
    pub name: [u8; 44],
}

impl ElemId {
    pub fn by_numid(numid: u32) -> Self {
        let mut id = ElemId::new_zeroed();
        id.numid = numid;
        id
    }

    pub fn by_name(iface: ElemIface, name: &str) -> Self {
        let mut id = ElemId::new_zeroed();
        id.iface = iface as u32;
        crate::set_name(&mut id.name, name);
        id
    }

    pub fn name(&self) -> &str {
        crate::name(&self.name)
    }
}

/// `ElemList` argument. Up to `space` ids starting at `offset` are returned
/// in the data area, `used` of them valid out of `count` in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ElemList {
    pub offset: u32,
    pub space: u32,
    pub used: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ElemType {
    None = 0,
    Boolean = 1,
    Integer = 2,
}

pub const ELEM_ACCESS_READ: u32 = 1 << 0;
pub const ELEM_ACCESS_WRITE: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ElemInfo {
    pub id: ElemId,
    pub kind: u32,
    pub access: u32,
    pub count: u32,
    pub reserved: u32,
    pub min: i64,
    pub max: i64,
    pub step: i64,
}

pub const ELEM_VALUES_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ElemValue {
    pub id: ElemId,
    pub values: [i64; ELEM_VALUES_MAX],
}

/// In/out device cursor for the `*NextDevice` and `*PreferSubdevice`
/// commands. `-1` starts and ends an enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct DeviceIndex {
    pub device: i32,
    pub subdevice: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct HwdepInfo {
    pub device: u32,
    pub card: i32,
    pub iface: i32,
    pub reserved: u32,
    pub id: [u8; 64],
    pub name: [u8; 80],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct RawmidiInfo {
    pub device: u32,
    pub subdevice: u32,
    pub stream: u32,
    pub card: i32,
    pub flags: u32,
    pub subdevices_count: u32,
    pub subdevices_avail: u32,
    pub reserved: u32,
    pub id: [u8; 64],
    pub name: [u8; 80],
    pub subname: [u8; 32],
}

pub const EVENT_MASK_VALUE: u32 = 1 << 0;
pub const EVENT_MASK_INFO: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct CtlEvent {
    pub mask: u32,
    pub id: ElemId,
}
