//! The shared control block: a fixed-size mailbox carrying one command and
//! its response.
//!
//! The region is never exposed as a typed structure. `cmd` and `result` are
//! atomics at fixed offsets; parameters and bulk data are copied in and out
//! through accessors that check every access against the layout.
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use aserver_api::layout::{CMD_OFFSET, DATA_OFFSET, PARAMS_CAPACITY, PARAMS_OFFSET, RESULT_OFFSET};
use aserver_api::BlockLayout;
use zerocopy::{AsBytes, FromBytes};

use crate::shm::ShmSegment;
use crate::Error;

enum Backing {
    Shm(ShmSegment),
    Heap(HeapRegion),
}

/// Word-aligned process memory, held as a raw allocation so pointers into
/// it stay valid over the whole region.
struct HeapRegion(NonNull<[u64]>);

impl HeapRegion {
    fn zeroed(bytes: usize) -> Self {
        let words = vec![0u64; bytes / size_of::<u64>()].into_boxed_slice();
        HeapRegion(NonNull::from(Box::leak(words)))
    }

    fn base(&self) -> NonNull<u8> {
        self.0.cast::<u8>()
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: the region came from `Box::leak` in `zeroed` and is freed
        // only here.
        unsafe { drop(Box::from_raw(self.0.as_ptr())) }
    }
}

pub struct ControlBlock<L: BlockLayout> {
    backing: Backing,
    base: NonNull<u8>,
    _layout: PhantomData<L>,
}

// SAFETY: the block owns its backing; cross-process access alternates under
// the one-byte handshake.
unsafe impl<L: BlockLayout> Send for ControlBlock<L> {}

impl<L: BlockLayout> std::fmt::Debug for ControlBlock<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("layout", &L::NAME)
            .field("shmid", &self.shmid())
            .field("cmd", &self.cmd())
            .finish()
    }
}

fn check(offset: usize, len: usize, capacity: usize) -> Result<(), Error> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}

impl<L: BlockLayout> ControlBlock<L> {
    /// Allocates a fresh SysV segment of exactly `L::SIZE` bytes.
    pub fn create() -> Result<Self, Error> {
        let seg = ShmSegment::create(L::SIZE)?;
        Ok(Self::from_segment(seg))
    }

    /// Attaches a segment created by the server.
    pub fn attach(shmid: i32) -> Result<Self, Error> {
        let seg = ShmSegment::attach(shmid)?;
        if seg.len() < L::SIZE {
            return Err(Error::SegmentTooSmall {
                expected: L::SIZE,
                actual: seg.len(),
            });
        }
        Ok(Self::from_segment(seg))
    }

    /// A block in process memory of exactly `L::SIZE` bytes.
    pub fn heap() -> Self {
        let region = HeapRegion::zeroed(L::SIZE);
        let base = region.base();
        ControlBlock {
            backing: Backing::Heap(region),
            base,
            _layout: PhantomData,
        }
    }

    fn from_segment(seg: ShmSegment) -> Self {
        // SAFETY: shmat never returns null on success.
        let base = unsafe { NonNull::new_unchecked(seg.as_ptr()) };
        ControlBlock {
            backing: Backing::Shm(seg),
            base,
            _layout: PhantomData,
        }
    }

    pub fn shmid(&self) -> Option<i32> {
        match &self.backing {
            Backing::Shm(seg) => Some(seg.id()),
            Backing::Heap(_) => None,
        }
    }

    /// Marks the backing segment for removal; it goes away once every
    /// process has detached. A no-op on heap blocks.
    pub fn mark_removed(&mut self) -> Result<(), Error> {
        match &mut self.backing {
            Backing::Shm(seg) => seg.mark_removed(),
            Backing::Heap(_) => Ok(()),
        }
    }

    pub fn data_capacity() -> usize {
        L::data_capacity()
    }

    fn cmd_cell(&self) -> &AtomicU32 {
        // SAFETY: the offset is 4-aligned inside a page-aligned region of
        // at least `L::SIZE` bytes.
        unsafe { &*(self.base.as_ptr().add(CMD_OFFSET) as *const AtomicU32) }
    }

    fn result_cell(&self) -> &AtomicI64 {
        // SAFETY: as above, 8-aligned.
        unsafe { &*(self.base.as_ptr().add(RESULT_OFFSET) as *const AtomicI64) }
    }

    pub fn cmd(&self) -> u32 {
        self.cmd_cell().load(Ordering::Acquire)
    }

    pub fn set_cmd(&self, cmd: u32) {
        self.cmd_cell().store(cmd, Ordering::Release)
    }

    /// Consumes the pending command, leaving zero behind.
    pub fn take_cmd(&self) -> u32 {
        self.cmd_cell().swap(0, Ordering::AcqRel)
    }

    pub fn result(&self) -> i64 {
        self.result_cell().load(Ordering::Acquire)
    }

    pub fn set_result(&self, result: i64) {
        self.result_cell().store(result, Ordering::Release)
    }

    fn region(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= L::SIZE);
        // SAFETY: callers checked the range against the layout.
        unsafe { slice::from_raw_parts(self.base.as_ptr().add(offset), len) }
    }

    fn region_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= L::SIZE);
        // SAFETY: callers checked the range against the layout.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len) }
    }

    pub fn params<T: FromBytes>(&self) -> Result<T, Error> {
        let len = size_of::<T>();
        check(0, len, PARAMS_CAPACITY)?;
        T::read_from(self.region(PARAMS_OFFSET, len)).ok_or(Error::OutOfBounds {
            offset: 0,
            len,
            capacity: PARAMS_CAPACITY,
        })
    }

    pub fn set_params<T: AsBytes>(&mut self, value: &T) -> Result<(), Error> {
        let bytes = value.as_bytes();
        check(0, bytes.len(), PARAMS_CAPACITY)?;
        self.region_mut(PARAMS_OFFSET, bytes.len()).copy_from_slice(bytes);
        Ok(())
    }

    pub fn data(&self, offset: usize, len: usize) -> Result<&[u8], Error> {
        check(offset, len, L::data_capacity())?;
        Ok(self.region(DATA_OFFSET + offset, len))
    }

    pub fn data_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], Error> {
        check(offset, len, L::data_capacity())?;
        Ok(self.region_mut(DATA_OFFSET + offset, len))
    }

    pub fn read_data(&self, offset: usize, dst: &mut [u8]) -> Result<(), Error> {
        dst.copy_from_slice(self.data(offset, dst.len())?);
        Ok(())
    }

    pub fn write_data(&mut self, offset: usize, src: &[u8]) -> Result<(), Error> {
        self.data_mut(offset, src.len())?.copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aserver_api::pcm::{PcmParams, PcmStatus};
    use aserver_api::{CtlLayout, PcmLayout};
    use zerocopy::FromZeroes;

    #[test]
    fn cmd_is_consumed_once() {
        let block = ControlBlock::<PcmLayout>::heap();
        block.set_cmd(0x10d);
        assert_eq!(block.take_cmd(), 0x10d);
        assert_eq!(block.cmd(), 0);
        assert_eq!(block.take_cmd(), 0);
    }

    #[test]
    fn params_round_trip() {
        let mut block = ControlBlock::<CtlLayout>::heap();
        let mut params = PcmParams::new_zeroed();
        params.rate = 44100;
        params.channels = 2;
        block.set_params(&params).unwrap();
        let back: PcmParams = block.params().unwrap();
        assert_eq!(back, params);

        // the area is untyped: a different view reads the same bytes
        let status: PcmStatus = block.params().unwrap();
        assert_eq!(status.reserved, 44100);
    }

    #[test]
    fn params_larger_than_area_are_refused() {
        let mut block = ControlBlock::<CtlLayout>::heap();
        let big = [0u8; PARAMS_CAPACITY + 1];
        assert!(matches!(
            block.set_params(&big),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(block.params::<[u8; PARAMS_CAPACITY + 1]>().is_err());
    }

    #[test]
    fn data_accesses_stop_at_the_end() {
        let mut block = ControlBlock::<CtlLayout>::heap();
        let cap = ControlBlock::<CtlLayout>::data_capacity();
        assert_eq!(cap, CtlLayout::SIZE - DATA_OFFSET);

        block.write_data(cap - 4, &[1, 2, 3, 4]).unwrap();
        let mut tail = [0u8; 4];
        block.read_data(cap - 4, &mut tail).unwrap();
        assert_eq!(tail, [1, 2, 3, 4]);

        assert!(block.write_data(cap - 3, &[0; 4]).is_err());
        assert!(block.data(cap, 1).is_err());
        assert!(block.data(usize::MAX, 2).is_err());
        assert!(block.data(cap, 0).is_ok());
    }

    #[test]
    fn heap_block_spans_the_layout() {
        let mut block = ControlBlock::<PcmLayout>::heap();
        let cap = ControlBlock::<PcmLayout>::data_capacity();
        let pattern: Vec<u8> = (0..cap).map(|i| i as u8).collect();
        block.write_data(0, &pattern).unwrap();
        block.set_result(-1);
        block.set_cmd(7);

        let mut back = vec![0u8; cap];
        block.read_data(0, &mut back).unwrap();
        assert_eq!(back, pattern);
        assert_eq!((block.result(), block.cmd()), (-1, 7));
    }

    #[test]
    fn shm_block_is_shared() {
        let server = ControlBlock::<PcmLayout>::create().unwrap();
        let shmid = server.shmid().unwrap();
        let mut client = ControlBlock::<PcmLayout>::attach(shmid).unwrap();

        client.write_data(0, b"frames").unwrap();
        client.set_cmd(0x113);
        assert_eq!(server.take_cmd(), 0x113);
        assert_eq!(server.data(0, 6).unwrap(), b"frames");
        server.set_result(-14);
        assert_eq!(client.result(), -14);
        assert_eq!(client.cmd(), 0);
    }

    #[test]
    fn attach_checks_size() {
        let seg = ShmSegment::create(4096).unwrap();
        assert!(matches!(
            ControlBlock::<CtlLayout>::attach(seg.id()),
            Err(Error::SegmentTooSmall { .. })
        ));
    }
}
