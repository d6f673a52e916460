//! Playback and capture stub.
use std::mem::size_of;
use std::os::unix::io::{BorrowedFd, OwnedFd};

use aserver_api::pcm::{
    AsyncParams, ChannelInfo, ChannelParams, ChannelSetup, Frames, IoVec, MmapRegion, Pause,
    PcmCommand, PcmInfo, PcmParams, PcmParamsInfo, PcmSetup, PcmState, PcmStatus, XferVec,
    MAX_IOVECS,
};
use aserver_api::{DeviceKind, OpenMode, OpenRequest, PcmLayout, Stream};
use ipc::ControlBlock;
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::poll::PollTimeout;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::channel::{Channel, Readiness};
use crate::{Error, ServerAddr};

/// A region of the device buffer mapped into this process.
pub struct MmapArea {
    pub region: MmapRegion,
    pub map: MmapMut,
}

pub struct PcmClient {
    channel: Channel<PcmLayout>,
    stream: Stream,
    mode: OpenMode,
    frame_bytes: usize,
}

impl PcmClient {
    pub fn open(
        addr: &ServerAddr,
        name: &str,
        stream: Stream,
        mode: OpenMode,
    ) -> Result<Self, Error> {
        let req = OpenRequest::new(DeviceKind::Pcm, name, stream, mode);
        let readiness = match stream {
            Stream::Playback => Readiness::Writable,
            Stream::Capture => Readiness::Readable,
        };
        let channel = Channel::open(addr, &req, readiness)?;
        let mut pcm = PcmClient {
            channel,
            stream,
            mode,
            frame_bytes: 0,
        };
        pcm.setup()?;
        Ok(pcm)
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    /// Segment id of the control block, the cookie of the open answer.
    pub fn shmid(&self) -> Option<i32> {
        self.channel.shmid()
    }

    pub fn set_nonblock(&mut self, nonblock: bool) {
        self.mode.set(OpenMode::NONBLOCK, nonblock);
    }

    fn nonblock(&self) -> bool {
        self.mode.contains(OpenMode::NONBLOCK)
    }

    fn block(&mut self) -> Result<&mut ControlBlock<PcmLayout>, Error> {
        self.channel.block_mut()
    }

    /// Sends `input` as parameters and reads the same struct back.
    fn inout<T: AsBytes + FromBytes>(&mut self, cmd: PcmCommand, input: &T) -> Result<T, Error> {
        self.block()?.set_params(input)?;
        self.channel.action(cmd as u32)?;
        Ok(self.channel.block()?.params()?)
    }

    fn simple(&mut self, cmd: PcmCommand) -> Result<i64, Error> {
        self.channel.action(cmd as u32)
    }

    fn with_frames(&mut self, cmd: PcmCommand, frames: u64) -> Result<i64, Error> {
        let frames = i64::try_from(frames).map_err(|_| Error::Device(Errno::EINVAL))?;
        self.block()?.set_params(&Frames { frames })?;
        self.channel.action(cmd as u32)
    }

    pub fn set_async(&mut self, sig: i32, pid: i32) -> Result<(), Error> {
        self.block()?.set_params(&AsyncParams { sig, pid })?;
        self.simple(PcmCommand::Async).map(|_| ())
    }

    pub fn info(&mut self) -> Result<PcmInfo, Error> {
        self.inout(PcmCommand::Info, &PcmInfo::new_zeroed())
    }

    pub fn params_info(&mut self) -> Result<PcmParamsInfo, Error> {
        self.inout(PcmCommand::ParamsInfo, &PcmParamsInfo::new_zeroed())
    }

    /// Returns the parameters as the device accepted them.
    pub fn params(&mut self, params: &PcmParams) -> Result<PcmParams, Error> {
        let accepted = self.inout(PcmCommand::Params, params)?;
        self.setup()?;
        Ok(accepted)
    }

    pub fn setup(&mut self) -> Result<PcmSetup, Error> {
        let setup = self.inout(PcmCommand::Setup, &PcmSetup::new_zeroed())?;
        self.frame_bytes = setup.frame_bytes();
        Ok(setup)
    }

    pub fn channel_info(&mut self, channel: u32) -> Result<ChannelInfo, Error> {
        let mut info = ChannelInfo::new_zeroed();
        info.channel = channel;
        self.inout(PcmCommand::ChannelInfo, &info)
    }

    pub fn channel_params(&mut self, params: &ChannelParams) -> Result<ChannelParams, Error> {
        self.inout(PcmCommand::ChannelParams, params)
    }

    pub fn channel_setup(&mut self, channel: u32) -> Result<ChannelSetup, Error> {
        let mut setup = ChannelSetup::new_zeroed();
        setup.channel = channel;
        self.inout(PcmCommand::ChannelSetup, &setup)
    }

    pub fn status(&mut self) -> Result<PcmStatus, Error> {
        self.inout(PcmCommand::Status, &PcmStatus::new_zeroed())
    }

    pub fn state(&mut self) -> Result<PcmState, Error> {
        let raw = self.simple(PcmCommand::State)?;
        u32::try_from(raw)
            .ok()
            .and_then(PcmState::from_raw)
            .ok_or(Error::BadFd)
    }

    pub fn delay(&mut self) -> Result<i64, Error> {
        self.simple(PcmCommand::Delay)?;
        let Frames { frames } = self.channel.block()?.params()?;
        Ok(frames)
    }

    pub fn avail_update(&mut self) -> Result<u64, Error> {
        Ok(self.simple(PcmCommand::AvailUpdate)? as u64)
    }

    pub fn prepare(&mut self) -> Result<(), Error> {
        self.simple(PcmCommand::Prepare).map(|_| ())
    }

    pub fn start(&mut self) -> Result<(), Error> {
        self.simple(PcmCommand::Start).map(|_| ())
    }

    pub fn drop_frames(&mut self) -> Result<(), Error> {
        self.simple(PcmCommand::Drop).map(|_| ())
    }

    pub fn drain(&mut self) -> Result<(), Error> {
        self.simple(PcmCommand::Drain).map(|_| ())
    }

    pub fn pause(&mut self, enable: bool) -> Result<(), Error> {
        self.block()?.set_params(&Pause {
            enable: enable as u32,
            reserved: 0,
        })?;
        self.simple(PcmCommand::Pause).map(|_| ())
    }

    pub fn rewind(&mut self, frames: u64) -> Result<u64, Error> {
        Ok(self.with_frames(PcmCommand::Rewind, frames)? as u64)
    }

    /// Largest number of whole frames the data area carries at once.
    fn max_frames(&self) -> Result<usize, Error> {
        match self.frame_bytes {
            0 => Err(Error::Device(Errno::EBADFD)),
            fb => Ok(ControlBlock::<PcmLayout>::data_capacity() / fb),
        }
    }

    /// Writes interleaved frames; returns how many the device took. Without
    /// `NONBLOCK` this waits for room instead of failing with `EAGAIN`.
    pub fn writei(&mut self, buf: &[u8]) -> Result<u64, Error> {
        let fb = self.frame_bytes.max(1);
        let frames = (buf.len() / fb).min(self.max_frames()?);
        let chunk = &buf[..frames * fb];
        let nonblock = self.nonblock();
        self.channel.retry(nonblock, |ch| {
            let block = ch.block_mut()?;
            block.write_data(0, chunk)?;
            block.set_params(&Frames {
                frames: frames as i64,
            })?;
            Ok(ch.action(PcmCommand::WriteFrames as u32)? as u64)
        })
    }

    /// Reads interleaved frames into `buf`; returns how many arrived.
    pub fn readi(&mut self, buf: &mut [u8]) -> Result<u64, Error> {
        let fb = self.frame_bytes.max(1);
        let frames = (buf.len() / fb).min(self.max_frames()?);
        let nonblock = self.nonblock();
        let got = self.channel.retry(nonblock, |ch| {
            ch.block_mut()?.set_params(&Frames {
                frames: frames as i64,
            })?;
            Ok(ch.action(PcmCommand::ReadFrames as u32)? as u64)
        })?;
        let len = (got as usize * fb).min(buf.len());
        self.channel.block()?.read_data(0, &mut buf[..len])?;
        Ok(got)
    }

    /// Lays out the scatter table followed by one slot per buffer.
    fn vec_table(lens: &[usize]) -> Result<Vec<IoVec>, Error> {
        if lens.len() > MAX_IOVECS {
            return Err(Error::Device(Errno::EINVAL));
        }
        let capacity = ControlBlock::<PcmLayout>::data_capacity();
        let mut offset = lens.len() * size_of::<IoVec>();
        let mut table = Vec::with_capacity(lens.len());
        for &len in lens {
            if offset + len > capacity {
                return Err(Error::Device(Errno::EFAULT));
            }
            table.push(IoVec {
                offset: offset as u64,
                len: len as u64,
            });
            offset += len;
        }
        Ok(table)
    }

    fn load_table(block: &mut ControlBlock<PcmLayout>, table: &[IoVec]) -> Result<(), Error> {
        block.set_params(&XferVec {
            count: table.len() as u32,
            reserved: 0,
        })?;
        for (i, v) in table.iter().enumerate() {
            block.write_data(i * size_of::<IoVec>(), v.as_bytes())?;
        }
        Ok(())
    }

    /// Writes the concatenation of `bufs` as interleaved frames.
    pub fn writev(&mut self, bufs: &[&[u8]]) -> Result<u64, Error> {
        let lens: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
        let table = Self::vec_table(&lens)?;
        let nonblock = self.nonblock();
        self.channel.retry(nonblock, |ch| {
            let block = ch.block_mut()?;
            Self::load_table(block, &table)?;
            for (v, buf) in table.iter().zip(bufs) {
                block.write_data(v.offset as usize, buf)?;
            }
            Ok(ch.action(PcmCommand::WriteVec as u32)? as u64)
        })
    }

    /// Reads interleaved frames scattered across `bufs` in order.
    pub fn readv(&mut self, bufs: &mut [&mut [u8]]) -> Result<u64, Error> {
        let lens: Vec<usize> = bufs.iter().map(|b| b.len()).collect();
        let table = Self::vec_table(&lens)?;
        let nonblock = self.nonblock();
        let got = self.channel.retry(nonblock, |ch| {
            Self::load_table(ch.block_mut()?, &table)?;
            Ok(ch.action(PcmCommand::ReadVec as u32)? as u64)
        })?;
        let block = self.channel.block()?;
        for (v, buf) in table.iter().zip(bufs.iter_mut()) {
            block.read_data(v.offset as usize, buf)?;
        }
        Ok(got)
    }

    pub fn mmap_count(&mut self) -> Result<u32, Error> {
        Ok(self.simple(PcmCommand::MmapCount)? as u32)
    }

    /// Maps region `index` of the device buffer through the descriptor the
    /// server hands over.
    pub fn mmap_region(&mut self, index: u32) -> Result<MmapArea, Error> {
        let mut region = MmapRegion::new_zeroed();
        region.index = index;
        self.block()?.set_params(&region)?;
        let (_, fd) = self.channel.action_fd(PcmCommand::MmapRegion as u32)?;
        let region: MmapRegion = self.channel.block()?.params()?;
        let len = usize::try_from(region.size).map_err(|_| Error::Device(Errno::EINVAL))?;
        // SAFETY: the server sized the descriptor to cover the region.
        let map = unsafe { MmapOptions::new().offset(region.offset).len(len).map_mut(&fd)? };
        Ok(MmapArea { region, map })
    }

    pub fn munmap(&mut self) -> Result<(), Error> {
        self.simple(PcmCommand::Munmap).map(|_| ())
    }

    pub fn mmap_forward(&mut self, frames: u64) -> Result<u64, Error> {
        let nonblock = self.nonblock();
        let frames = i64::try_from(frames).map_err(|_| Error::Device(Errno::EINVAL))?;
        self.channel.retry(nonblock, |ch| {
            ch.block_mut()?.set_params(&Frames { frames })?;
            Ok(ch.action(PcmCommand::MmapForward as u32)? as u64)
        })
    }

    pub fn set_avail_min(&mut self, frames: u64) -> Result<(), Error> {
        self.with_frames(PcmCommand::SetAvailMin, frames).map(|_| ())
    }

    /// The data socket: it turns writable (playback) or readable (capture)
    /// when the device is ready for the next transfer.
    pub fn poll_descriptor(&self) -> BorrowedFd<'_> {
        self.channel.poll_descriptor()
    }

    /// The device's own pollable descriptor, handed over by the server.
    pub fn device_poll_descriptor(&mut self) -> Result<OwnedFd, Error> {
        self.channel
            .action_fd(PcmCommand::PollDescriptor as u32)
            .map(|(_, fd)| fd)
    }

    /// Waits up to `timeout` for the device to become ready.
    pub fn wait(&self, timeout: PollTimeout) -> Result<bool, Error> {
        self.channel.wait(timeout)
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.channel.close(PcmCommand::Close as u32)
    }
}
