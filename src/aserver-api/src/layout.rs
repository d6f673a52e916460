//! Byte layout of the shared control block.
//!
//! ```text
//! 0        8      12        16             528            SIZE
//! | result | cmd  | reserved | params (512) | data ...      |
//! ```

pub const RESULT_OFFSET: usize = 0;
pub const CMD_OFFSET: usize = 8;
pub const PARAMS_OFFSET: usize = 16;
pub const PARAMS_CAPACITY: usize = 512;
pub const DATA_OFFSET: usize = PARAMS_OFFSET + PARAMS_CAPACITY;

/// A control block variant. The size is fixed per device kind.
pub trait BlockLayout: Send + 'static {
    const SIZE: usize;
    const NAME: &'static str;

    /// Bytes available to bulk payloads after the header.
    fn data_capacity() -> usize {
        Self::SIZE - DATA_OFFSET
    }
}

#[derive(Debug)]
pub struct PcmLayout;

impl BlockLayout for PcmLayout {
    const SIZE: usize = 65536;
    const NAME: &'static str = "pcm";
}

#[derive(Debug)]
pub struct CtlLayout;

impl BlockLayout for CtlLayout {
    const SIZE: usize = 16384;
    const NAME: &'static str = "ctl";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities() {
        assert_eq!(PcmLayout::data_capacity(), 65536 - 528);
        assert_eq!(CtlLayout::data_capacity(), 16384 - 528);
        assert_eq!(DATA_OFFSET % 8, 0);
    }
}
