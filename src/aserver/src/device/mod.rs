//! The driver seam. A backend implements [`PcmDevice`] or [`CtlDevice`];
//! the server only ever calls these traits and never blocks in them, since
//! every device is opened non-blocking.
use std::os::unix::io::BorrowedFd;

use aserver_api::ctl::{CardInfo, CtlEvent, ElemId, ElemInfo, ElemList, ElemValue, HwdepInfo, RawmidiInfo};
use aserver_api::pcm::{
    ChannelInfo, ChannelParams, ChannelSetup, MmapRegion, PcmInfo, PcmParams, PcmParamsInfo,
    PcmSetup, PcmState, PcmStatus,
};
use aserver_api::Stream;
use nix::errno::Errno;
use nix::poll::PollFlags;

pub mod null;
pub mod registry;

pub use registry::DeviceRegistry;

/// Device operations fail with the errno the driver reports.
pub type DevResult<T> = Result<T, Errno>;

pub trait PcmDevice: Send {
    fn stream(&self) -> Stream;

    fn info(&mut self, info: &mut PcmInfo) -> DevResult<()>;
    fn params_info(&mut self, info: &mut PcmParamsInfo) -> DevResult<()>;
    /// Installs `params`, writing back what was accepted.
    fn params(&mut self, params: &mut PcmParams) -> DevResult<()>;
    fn setup(&mut self, setup: &mut PcmSetup) -> DevResult<()>;
    fn channel_info(&mut self, info: &mut ChannelInfo) -> DevResult<()>;
    fn channel_params(&mut self, params: &mut ChannelParams) -> DevResult<()>;
    fn channel_setup(&mut self, setup: &mut ChannelSetup) -> DevResult<()>;
    fn status(&mut self, status: &mut PcmStatus) -> DevResult<()>;
    fn state(&mut self) -> PcmState;
    fn delay(&mut self) -> DevResult<i64>;
    fn avail_update(&mut self) -> DevResult<u64>;

    fn prepare(&mut self) -> DevResult<()>;
    fn start(&mut self) -> DevResult<()>;
    /// Stops immediately, discarding pending frames.
    fn drop_frames(&mut self) -> DevResult<()>;
    fn drain(&mut self) -> DevResult<()>;
    fn pause(&mut self, enable: bool) -> DevResult<()>;
    fn rewind(&mut self, frames: u64) -> DevResult<u64>;

    /// Bytes per interleaved frame under the current parameters.
    fn frame_bytes(&self) -> usize;
    /// Writes whole interleaved frames, returning how many were taken.
    fn writei(&mut self, buf: &[u8]) -> DevResult<u64>;
    fn readi(&mut self, buf: &mut [u8]) -> DevResult<u64>;

    /// Writes the concatenation of `bufs` as interleaved frames.
    fn writev(&mut self, bufs: &[&[u8]]) -> DevResult<u64> {
        let joined = bufs.concat();
        self.writei(&joined)
    }

    /// Reads interleaved frames scattered across `bufs` in order.
    fn readv(&mut self, bufs: &mut [&mut [u8]]) -> DevResult<u64> {
        let total = bufs.iter().map(|b| b.len()).sum();
        let mut joined = vec![0u8; total];
        let frames = self.readi(&mut joined)?;
        let end = (frames as usize * self.frame_bytes()).min(joined.len());
        let mut filled = &joined[..end];
        for buf in bufs.iter_mut() {
            let n = buf.len().min(filled.len());
            buf[..n].copy_from_slice(&filled[..n]);
            filled = &filled[n..];
        }
        Ok(frames)
    }

    fn mmap_count(&mut self) -> DevResult<u32>;
    /// Describes region `region.index` and lends its descriptor.
    fn mmap_region(&mut self, region: &mut MmapRegion) -> DevResult<BorrowedFd<'_>>;
    fn munmap(&mut self) -> DevResult<()>;
    fn mmap_forward(&mut self, frames: u64) -> DevResult<u64>;
    fn set_avail_min(&mut self, frames: u64) -> DevResult<()>;
    fn set_async(&mut self, sig: i32, pid: i32) -> DevResult<()>;

    fn poll_descriptor(&self) -> BorrowedFd<'_>;
    /// Events on [`poll_descriptor`](Self::poll_descriptor) meaning "ready".
    fn poll_events(&self) -> PollFlags;

    fn close(&mut self) -> DevResult<()>;
}

pub trait CtlDevice: Send {
    fn card(&self) -> i32;
    fn hw_info(&mut self, info: &mut CardInfo) -> DevResult<()>;
    /// Fills `ids` with up to `list.space` ids from `list.offset` on.
    fn elem_list(&mut self, list: &mut ElemList, ids: &mut Vec<ElemId>) -> DevResult<()>;
    fn elem_info(&mut self, info: &mut ElemInfo) -> DevResult<()>;
    fn elem_read(&mut self, value: &mut ElemValue) -> DevResult<()>;
    fn elem_write(&mut self, value: &mut ElemValue) -> DevResult<()>;

    fn hwdep_next_device(&mut self, device: &mut i32) -> DevResult<()>;
    fn hwdep_info(&mut self, info: &mut HwdepInfo) -> DevResult<()>;
    fn pcm_next_device(&mut self, device: &mut i32) -> DevResult<()>;
    fn pcm_info(&mut self, info: &mut PcmInfo) -> DevResult<()>;
    fn pcm_prefer_subdevice(&mut self, subdevice: i32) -> DevResult<()>;
    fn rawmidi_next_device(&mut self, device: &mut i32) -> DevResult<()>;
    fn rawmidi_info(&mut self, info: &mut RawmidiInfo) -> DevResult<()>;
    fn rawmidi_prefer_subdevice(&mut self, subdevice: i32) -> DevResult<()>;

    /// Pops the next pending event, `EAGAIN` when there is none.
    fn read_event(&mut self) -> DevResult<CtlEvent>;

    fn poll_descriptor(&self) -> BorrowedFd<'_>;
    fn poll_events(&self) -> PollFlags {
        PollFlags::POLLIN
    }

    fn close(&mut self) -> DevResult<()>;
}
