use std::mem::size_of;
use std::os::unix::io::BorrowedFd;

use aserver_api::pcm::{
    AsyncParams, ChannelInfo, ChannelParams, ChannelSetup, Frames, IoVec, MmapRegion, Pause,
    PcmCommand, PcmInfo, PcmParams, PcmParamsInfo, PcmSetup, PcmStatus, XferVec, MAX_IOVECS,
};
use aserver_api::{DeviceKind, PcmLayout, Stream};
use ipc::ControlBlock;
use nix::errno::Errno;
use nix::poll::PollFlags;
use zerocopy::FromBytes;

use super::{fault, inout, io_errno, result_code, Bridge, Outcome, Reply, Transport};
use crate::device::{DevResult, PcmDevice};
use crate::log;

pub struct PcmShm {
    device: Option<Box<dyn PcmDevice>>,
    block: ControlBlock<PcmLayout>,
    stream: Stream,
}

impl PcmShm {
    pub fn new(device: Box<dyn PcmDevice>, block: ControlBlock<PcmLayout>) -> Self {
        let stream = device.stream();
        PcmShm {
            device: Some(device),
            block,
            stream,
        }
    }

    pub fn block(&self) -> &ControlBlock<PcmLayout> {
        &self.block
    }

    fn execute(&mut self, cmd: PcmCommand, outcome: &mut Outcome) -> DevResult<i64> {
        let PcmShm { device, block, .. } = self;
        let dev = device.as_deref_mut().ok_or(Errno::EBADFD)?;
        match cmd {
            PcmCommand::Async => {
                let AsyncParams { sig, pid } = block.params().map_err(fault)?;
                dev.set_async(sig, pid)?;
                Ok(0)
            }
            PcmCommand::Info => inout(block, |info: &mut PcmInfo| dev.info(info)),
            PcmCommand::ParamsInfo => inout(block, |info: &mut PcmParamsInfo| dev.params_info(info)),
            PcmCommand::Params => inout(block, |params: &mut PcmParams| dev.params(params)),
            PcmCommand::Setup => inout(block, |setup: &mut PcmSetup| dev.setup(setup)),
            PcmCommand::ChannelInfo => inout(block, |info: &mut ChannelInfo| dev.channel_info(info)),
            PcmCommand::ChannelParams => {
                inout(block, |params: &mut ChannelParams| dev.channel_params(params))
            }
            PcmCommand::ChannelSetup => {
                inout(block, |setup: &mut ChannelSetup| dev.channel_setup(setup))
            }
            PcmCommand::Status => inout(block, |status: &mut PcmStatus| dev.status(status)),
            PcmCommand::State => Ok(dev.state() as i64),
            PcmCommand::Delay => {
                let frames = dev.delay()?;
                block.set_params(&Frames { frames }).map_err(fault)?;
                Ok(0)
            }
            PcmCommand::AvailUpdate => Ok(dev.avail_update()? as i64),
            PcmCommand::Prepare => dev.prepare().map(|()| 0),
            PcmCommand::Start => dev.start().map(|()| 0),
            PcmCommand::Drop => dev.drop_frames().map(|()| 0),
            PcmCommand::Drain => dev.drain().map(|()| 0),
            PcmCommand::Pause => {
                let Pause { enable, .. } = block.params().map_err(fault)?;
                dev.pause(enable != 0).map(|()| 0)
            }
            PcmCommand::Rewind => Ok(dev.rewind(frames_arg(block)?)? as i64),
            PcmCommand::WriteFrames => {
                let len = bulk_len(frames_arg(block)?, dev.frame_bytes())?;
                let buf = block.data(0, len).map_err(fault)?;
                Ok(dev.writei(buf)? as i64)
            }
            PcmCommand::ReadFrames => {
                let len = bulk_len(frames_arg(block)?, dev.frame_bytes())?;
                let buf = block.data_mut(0, len).map_err(fault)?;
                Ok(dev.readi(buf)? as i64)
            }
            PcmCommand::WriteVec => {
                let iovecs = read_iovecs(block)?;
                let bufs = iovecs
                    .iter()
                    .map(|v| block.data(v.offset as usize, v.len as usize))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(fault)?;
                Ok(dev.writev(&bufs)? as i64)
            }
            PcmCommand::ReadVec => {
                let iovecs = read_iovecs(block)?;
                let mut scratch: Vec<Vec<u8>> =
                    iovecs.iter().map(|v| vec![0u8; v.len as usize]).collect();
                let frames = {
                    let mut views: Vec<&mut [u8]> =
                        scratch.iter_mut().map(|b| b.as_mut_slice()).collect();
                    dev.readv(&mut views)?
                };
                for (v, buf) in iovecs.iter().zip(&scratch) {
                    block.write_data(v.offset as usize, buf).map_err(fault)?;
                }
                Ok(frames as i64)
            }
            PcmCommand::MmapCount => Ok(dev.mmap_count()? as i64),
            PcmCommand::MmapRegion => {
                let mut region: MmapRegion = block.params().map_err(fault)?;
                let fd = dev
                    .mmap_region(&mut region)?
                    .try_clone_to_owned()
                    .map_err(io_errno)?;
                block.set_params(&region).map_err(fault)?;
                outcome.reply = Reply::Descriptor(fd);
                Ok(0)
            }
            PcmCommand::Munmap => dev.munmap().map(|()| 0),
            PcmCommand::MmapForward => Ok(dev.mmap_forward(frames_arg(block)?)? as i64),
            PcmCommand::SetAvailMin => {
                dev.set_avail_min(frames_arg(block)?)?;
                Ok(0)
            }
            PcmCommand::PollDescriptor => {
                let fd = dev.poll_descriptor().try_clone_to_owned().map_err(io_errno)?;
                outcome.reply = Reply::Descriptor(fd);
                Ok(0)
            }
            PcmCommand::Close => {
                outcome.close = true;
                close_device(device, block)
            }
        }
    }
}

fn close_device(
    device: &mut Option<Box<dyn PcmDevice>>,
    block: &mut ControlBlock<PcmLayout>,
) -> DevResult<i64> {
    let res = match device.take() {
        Some(mut dev) => dev.close().map(|()| 0),
        None => Err(Errno::EBADFD),
    };
    if let Err(e) = block.mark_removed() {
        log::warn!("pcm: removing control segment: {}", e);
    }
    res
}

fn frames_arg(block: &ControlBlock<PcmLayout>) -> DevResult<u64> {
    let Frames { frames } = block.params().map_err(fault)?;
    u64::try_from(frames).map_err(|_| Errno::EINVAL)
}

fn bulk_len(frames: u64, frame_bytes: usize) -> DevResult<usize> {
    usize::try_from(frames)
        .ok()
        .and_then(|f| f.checked_mul(frame_bytes))
        .ok_or(Errno::EFAULT)
}

/// Reads the scatter table at the start of the data area. Every entry must
/// lie inside the data area and past the table itself.
fn read_iovecs(block: &ControlBlock<PcmLayout>) -> DevResult<Vec<IoVec>> {
    let XferVec { count, .. } = block.params().map_err(fault)?;
    let count = count as usize;
    if count > MAX_IOVECS {
        return Err(Errno::EFAULT);
    }
    let entry = size_of::<IoVec>();
    let table_len = count * entry;
    let table = block.data(0, table_len).map_err(fault)?;
    let iovecs: Vec<IoVec> = table.chunks_exact(entry).filter_map(IoVec::read_from).collect();
    for v in &iovecs {
        let offset = usize::try_from(v.offset).map_err(|_| Errno::EFAULT)?;
        let len = usize::try_from(v.len).map_err(|_| Errno::EFAULT)?;
        if offset < table_len {
            return Err(Errno::EFAULT);
        }
        block.data(offset, len).map_err(fault)?;
    }
    Ok(iovecs)
}

impl Transport for PcmShm {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Pcm
    }

    fn shmid(&self) -> Option<i32> {
        self.block.shmid()
    }

    fn dispatch(&mut self, can_pass_fd: bool) -> Outcome {
        let raw = self.block.take_cmd();
        let mut outcome = Outcome::signal();
        let res = match PcmCommand::from_raw(raw) {
            None => {
                log::warn!("pcm: unknown command {:#x}", raw);
                Err(Errno::ENOSYS)
            }
            Some(cmd) if cmd.hands_off_fd() && !can_pass_fd => Err(Errno::EOPNOTSUPP),
            Some(cmd) => {
                let res = self.execute(cmd, &mut outcome);
                outcome.awaiting = res == Err(Errno::EAGAIN)
                    && matches!(
                        cmd,
                        PcmCommand::WriteFrames
                            | PcmCommand::ReadFrames
                            | PcmCommand::WriteVec
                            | PcmCommand::ReadVec
                            | PcmCommand::MmapForward
                    );
                log::trace!("pcm: {:?} -> {:?}", cmd, res);
                res
            }
        };
        self.block.set_result(result_code(res));
        outcome
    }

    fn poll_target(&self) -> Option<(BorrowedFd<'_>, PollFlags)> {
        self.device
            .as_deref()
            .map(|dev| (dev.poll_descriptor(), dev.poll_events()))
    }

    fn bridge(&self) -> Bridge {
        match self.stream {
            Stream::Playback => Bridge::Consume,
            Stream::Capture => Bridge::Produce,
        }
    }

    fn close(&mut self) {
        if self.device.is_some() {
            let res = close_device(&mut self.device, &mut self.block);
            self.block.set_result(result_code(res));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::null::{NullPcm, NullPcmSettings};
    use aserver_api::layout::DATA_OFFSET;
    use aserver_api::pcm::PcmFormat;
    use aserver_api::BlockLayout;
    use zerocopy::{AsBytes, FromZeroes};

    fn transport(stream: Stream) -> PcmShm {
        let dev = NullPcm::open("null", NullPcmSettings::default(), stream).unwrap();
        PcmShm::new(Box::new(dev), ControlBlock::heap())
    }

    fn run(t: &mut PcmShm, cmd: PcmCommand) -> (i64, Outcome) {
        t.block.set_cmd(cmd as u32);
        let outcome = t.dispatch(true);
        assert_eq!(t.block.cmd(), 0);
        (t.block.result(), outcome)
    }

    #[test]
    fn unknown_command_is_enosys() {
        let mut t = transport(Stream::Playback);
        t.block.set_cmd(0x1ff);
        let outcome = t.dispatch(true);
        assert_eq!(t.block.result(), -(Errno::ENOSYS as i64));
        assert_eq!(t.block.cmd(), 0);
        assert!(matches!(outcome.reply, Reply::Signal));
    }

    #[test]
    fn info_reports_pcm() {
        let mut t = transport(Stream::Capture);
        let (res, _) = run(&mut t, PcmCommand::Info);
        assert_eq!(res, 0);
        let info: PcmInfo = t.block.params().unwrap();
        assert!(info.is_pcm());
        assert_eq!(info.stream, Stream::Capture as u32);
    }

    #[test]
    fn params_are_echoed() {
        let mut t = transport(Stream::Playback);
        let mut params = PcmParams::new_zeroed();
        params.format = PcmFormat::S16Le as u32;
        params.rate = 44100;
        params.channels = 2;
        params.period_size = 441;
        params.buffer_size = 1764;
        t.block.set_params(&params).unwrap();
        let (res, _) = run(&mut t, PcmCommand::Params);
        assert_eq!(res, 0);
        let echoed: PcmParams = t.block.params().unwrap();
        assert_eq!(echoed.as_bytes(), params.as_bytes());
    }

    #[test]
    fn write_beyond_data_area_faults() {
        let mut t = transport(Stream::Playback);
        let fb = 4;
        let capacity = ControlBlock::<PcmLayout>::data_capacity();
        assert_eq!(capacity, PcmLayout::SIZE - DATA_OFFSET);
        let frames = (capacity / fb + 1) as i64;
        t.block.set_params(&Frames { frames }).unwrap();
        let (res, _) = run(&mut t, PcmCommand::WriteFrames);
        assert_eq!(res, -(Errno::EFAULT as i64));
    }

    #[test]
    fn negative_frame_count_is_einval() {
        let mut t = transport(Stream::Playback);
        t.block.set_params(&Frames { frames: -1 }).unwrap();
        let (res, _) = run(&mut t, PcmCommand::WriteFrames);
        assert_eq!(res, -(Errno::EINVAL as i64));
    }

    #[test]
    fn full_buffer_sets_awaiting() {
        let mut t = transport(Stream::Playback);
        assert_eq!(run(&mut t, PcmCommand::Prepare).0, 0);
        let buffer = NullPcmSettings::default().buffer_size as i64;
        t.block.set_params(&Frames { frames: buffer }).unwrap();
        let (res, outcome) = run(&mut t, PcmCommand::WriteFrames);
        assert_eq!(res, buffer);
        assert!(!outcome.awaiting);
        t.block.set_params(&Frames { frames: 1 }).unwrap();
        let (res, outcome) = run(&mut t, PcmCommand::WriteFrames);
        assert_eq!(res, -(Errno::EAGAIN as i64));
        assert!(outcome.awaiting);
    }

    #[test]
    fn vec_table_is_bounds_checked() {
        let mut t = transport(Stream::Playback);
        t.block
            .set_params(&XferVec {
                count: MAX_IOVECS as u32 + 1,
                reserved: 0,
            })
            .unwrap();
        assert_eq!(run(&mut t, PcmCommand::WriteVec).0, -(Errno::EFAULT as i64));

        // entry overlapping the table
        t.block.set_params(&XferVec { count: 1, reserved: 0 }).unwrap();
        let entry = IoVec { offset: 0, len: 16 };
        t.block.write_data(0, entry.as_bytes()).unwrap();
        assert_eq!(run(&mut t, PcmCommand::WriteVec).0, -(Errno::EFAULT as i64));

        // entry running off the end
        let capacity = ControlBlock::<PcmLayout>::data_capacity() as u64;
        let entry = IoVec {
            offset: 64,
            len: capacity,
        };
        t.block.write_data(0, entry.as_bytes()).unwrap();
        assert_eq!(run(&mut t, PcmCommand::WriteVec).0, -(Errno::EFAULT as i64));
    }

    #[test]
    fn read_vec_scatters_into_data_area() {
        let mut t = transport(Stream::Capture);
        let mut params = PcmParams::new_zeroed();
        params.format = PcmFormat::U8 as u32;
        params.rate = 8000;
        params.channels = 2;
        params.period_size = 16;
        params.buffer_size = 64;
        t.block.set_params(&params).unwrap();
        assert_eq!(run(&mut t, PcmCommand::Params).0, 0);
        assert_eq!(run(&mut t, PcmCommand::Prepare).0, 0);
        assert_eq!(run(&mut t, PcmCommand::Start).0, 0);
        std::thread::sleep(std::time::Duration::from_millis(10));

        t.block.set_params(&XferVec { count: 2, reserved: 0 }).unwrap();
        let left = IoVec { offset: 64, len: 8 };
        let right = IoVec { offset: 128, len: 8 };
        t.block.write_data(0, left.as_bytes()).unwrap();
        t.block.write_data(16, right.as_bytes()).unwrap();
        let (res, _) = run(&mut t, PcmCommand::ReadVec);
        assert_eq!(res, 8);
        assert_eq!(t.block.data(64, 8).unwrap(), &[0x80; 8]);
        assert_eq!(t.block.data(128, 8).unwrap(), &[0x80; 8]);
    }

    #[test]
    fn descriptor_commands_need_a_unix_socket() {
        let mut t = transport(Stream::Playback);
        t.block.set_cmd(PcmCommand::PollDescriptor as u32);
        let outcome = t.dispatch(false);
        assert_eq!(t.block.result(), -(Errno::EOPNOTSUPP as i64));
        assert!(matches!(outcome.reply, Reply::Signal));

        let (res, outcome) = run(&mut t, PcmCommand::PollDescriptor);
        assert_eq!(res, 0);
        assert!(matches!(outcome.reply, Reply::Descriptor(_)));

        t.block.set_params(&MmapRegion::new_zeroed()).unwrap();
        let (res, outcome) = run(&mut t, PcmCommand::MmapRegion);
        assert_eq!(res, 0);
        assert!(matches!(outcome.reply, Reply::Descriptor(_)));
        let region: MmapRegion = t.block.params().unwrap();
        assert_eq!(region.size, 4096 * 4);
    }

    #[test]
    fn close_ends_the_device() {
        let mut t = transport(Stream::Playback);
        let (res, outcome) = run(&mut t, PcmCommand::Close);
        assert_eq!(res, 0);
        assert!(outcome.close);
        assert!(t.poll_target().is_none());
        assert_eq!(run(&mut t, PcmCommand::State).0, -(Errno::EBADFD as i64));
        t.close();
    }
}
