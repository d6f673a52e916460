use std::mem::size_of;
use std::os::unix::io::BorrowedFd;

use aserver_api::ctl::{
    CardInfo, CtlCommand, DeviceIndex, ElemId, ElemInfo, ElemList, ElemValue, HwdepInfo,
    RawmidiInfo,
};
use aserver_api::pcm::PcmInfo;
use aserver_api::{CtlLayout, DeviceKind};
use ipc::ControlBlock;
use nix::errno::Errno;
use nix::poll::PollFlags;
use zerocopy::AsBytes;

use super::{fault, inout, io_errno, result_code, Bridge, Outcome, Reply, Transport};
use crate::device::{CtlDevice, DevResult};
use crate::log;

pub struct CtlShm {
    device: Option<Box<dyn CtlDevice>>,
    block: ControlBlock<CtlLayout>,
}

impl CtlShm {
    pub fn new(device: Box<dyn CtlDevice>, block: ControlBlock<CtlLayout>) -> Self {
        CtlShm {
            device: Some(device),
            block,
        }
    }

    pub fn block(&self) -> &ControlBlock<CtlLayout> {
        &self.block
    }

    fn execute(&mut self, cmd: CtlCommand, outcome: &mut Outcome) -> DevResult<i64> {
        let CtlShm { device, block } = self;
        let dev = device.as_deref_mut().ok_or(Errno::EBADFD)?;
        match cmd {
            CtlCommand::Card => Ok(dev.card() as i64),
            CtlCommand::HwInfo => inout(block, |info: &mut CardInfo| dev.hw_info(info)),
            CtlCommand::ElemList => {
                let mut list: ElemList = block.params().map_err(fault)?;
                let room = (list.space as usize)
                    .checked_mul(size_of::<ElemId>())
                    .ok_or(Errno::EFAULT)?;
                block.data(0, room).map_err(fault)?;
                let mut ids = Vec::with_capacity(list.space as usize);
                dev.elem_list(&mut list, &mut ids)?;
                ids.truncate(list.space as usize);
                list.used = ids.len() as u32;
                for (i, id) in ids.iter().enumerate() {
                    block
                        .write_data(i * size_of::<ElemId>(), id.as_bytes())
                        .map_err(fault)?;
                }
                block.set_params(&list).map_err(fault)?;
                Ok(0)
            }
            CtlCommand::ElemInfo => inout(block, |info: &mut ElemInfo| dev.elem_info(info)),
            CtlCommand::ElemRead => inout(block, |value: &mut ElemValue| dev.elem_read(value)),
            CtlCommand::ElemWrite => inout(block, |value: &mut ElemValue| dev.elem_write(value)),
            CtlCommand::HwdepNextDevice => inout(block, |index: &mut DeviceIndex| {
                dev.hwdep_next_device(&mut index.device)
            }),
            CtlCommand::HwdepInfo => inout(block, |info: &mut HwdepInfo| dev.hwdep_info(info)),
            CtlCommand::PcmNextDevice => inout(block, |index: &mut DeviceIndex| {
                dev.pcm_next_device(&mut index.device)
            }),
            CtlCommand::PcmInfo => inout(block, |info: &mut PcmInfo| dev.pcm_info(info)),
            CtlCommand::PcmPreferSubdevice => {
                let DeviceIndex { subdevice, .. } = block.params().map_err(fault)?;
                dev.pcm_prefer_subdevice(subdevice).map(|()| 0)
            }
            CtlCommand::RawmidiNextDevice => inout(block, |index: &mut DeviceIndex| {
                dev.rawmidi_next_device(&mut index.device)
            }),
            CtlCommand::RawmidiInfo => {
                inout(block, |info: &mut RawmidiInfo| dev.rawmidi_info(info))
            }
            CtlCommand::RawmidiPreferSubdevice => {
                let DeviceIndex { subdevice, .. } = block.params().map_err(fault)?;
                dev.rawmidi_prefer_subdevice(subdevice).map(|()| 0)
            }
            CtlCommand::ReadEvent => {
                let event = dev.read_event()?;
                block.set_params(&event).map_err(fault)?;
                Ok(0)
            }
            CtlCommand::PollDescriptor => {
                let fd = dev.poll_descriptor().try_clone_to_owned().map_err(io_errno)?;
                outcome.reply = Reply::Descriptor(fd);
                Ok(0)
            }
            CtlCommand::Close => {
                outcome.close = true;
                close_device(device, block)
            }
        }
    }
}

fn close_device(
    device: &mut Option<Box<dyn CtlDevice>>,
    block: &mut ControlBlock<CtlLayout>,
) -> DevResult<i64> {
    let res = match device.take() {
        Some(mut dev) => dev.close().map(|()| 0),
        None => Err(Errno::EBADFD),
    };
    if let Err(e) = block.mark_removed() {
        log::warn!("ctl: removing control segment: {}", e);
    }
    res
}

impl Transport for CtlShm {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Ctl
    }

    fn shmid(&self) -> Option<i32> {
        self.block.shmid()
    }

    fn dispatch(&mut self, can_pass_fd: bool) -> Outcome {
        let raw = self.block.take_cmd();
        let mut outcome = Outcome::signal();
        let res = match CtlCommand::from_raw(raw) {
            None => {
                log::warn!("ctl: unknown command {:#x}", raw);
                Err(Errno::ENOSYS)
            }
            Some(cmd) if cmd.hands_off_fd() && !can_pass_fd => Err(Errno::EOPNOTSUPP),
            Some(cmd) => {
                let res = self.execute(cmd, &mut outcome);
                outcome.awaiting = cmd == CtlCommand::ReadEvent && res == Err(Errno::EAGAIN);
                log::trace!("ctl: {:?} -> {:?}", cmd, res);
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
        Bridge::Produce
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
    use crate::device::null::NullCtl;
    use aserver_api::ctl::{ElemIface, EVENT_MASK_VALUE};
    use aserver_api::Stream;
    use zerocopy::{FromBytes, FromZeroes};

    fn transport() -> CtlShm {
        CtlShm::new(Box::new(NullCtl::open("null", 0).unwrap()), ControlBlock::heap())
    }

    fn run(t: &mut CtlShm, cmd: CtlCommand) -> (i64, Outcome) {
        t.block.set_cmd(cmd as u32);
        let outcome = t.dispatch(true);
        assert_eq!(t.block.cmd(), 0);
        (t.block.result(), outcome)
    }

    #[test]
    fn card_and_unknown() {
        let mut t = transport();
        assert_eq!(run(&mut t, CtlCommand::Card).0, 0);
        t.block.set_cmd(0x2ff);
        t.dispatch(true);
        assert_eq!(t.block.result(), -(Errno::ENOSYS as i64));
    }

    #[test]
    fn elem_list_lands_in_data_area() {
        let mut t = transport();
        t.block
            .set_params(&ElemList {
                offset: 0,
                space: 8,
                used: 0,
                count: 0,
            })
            .unwrap();
        assert_eq!(run(&mut t, CtlCommand::ElemList).0, 0);
        let list: ElemList = t.block.params().unwrap();
        assert_eq!(list.used, 2);
        assert_eq!(list.count, 2);
        let first = ElemId::read_from(t.block.data(0, size_of::<ElemId>()).unwrap()).unwrap();
        assert_eq!(first.name(), "Master Playback Volume");
    }

    #[test]
    fn elem_list_space_is_bounds_checked() {
        let mut t = transport();
        let space = (ControlBlock::<CtlLayout>::data_capacity() / size_of::<ElemId>() + 1) as u32;
        t.block
            .set_params(&ElemList {
                offset: 0,
                space,
                used: 0,
                count: 0,
            })
            .unwrap();
        assert_eq!(run(&mut t, CtlCommand::ElemList).0, -(Errno::EFAULT as i64));
    }

    #[test]
    fn write_then_event() {
        let mut t = transport();
        let (res, outcome) = run(&mut t, CtlCommand::ReadEvent);
        assert_eq!(res, -(Errno::EAGAIN as i64));
        assert!(outcome.awaiting);

        let mut value = ElemValue::new_zeroed();
        value.id = ElemId::by_name(ElemIface::Mixer, "Master Playback Volume");
        value.values[0] = 30;
        value.values[1] = 30;
        t.block.set_params(&value).unwrap();
        assert_eq!(run(&mut t, CtlCommand::ElemWrite).0, 0);

        let (res, outcome) = run(&mut t, CtlCommand::ReadEvent);
        assert_eq!(res, 0);
        assert!(!outcome.awaiting);
        let event: aserver_api::ctl::CtlEvent = t.block.params().unwrap();
        assert_eq!(event.mask, EVENT_MASK_VALUE);
        assert_eq!(event.id.numid, 1);
    }

    #[test]
    fn pcm_enumeration() {
        let mut t = transport();
        t.block
            .set_params(&DeviceIndex {
                device: -1,
                subdevice: 0,
            })
            .unwrap();
        assert_eq!(run(&mut t, CtlCommand::PcmNextDevice).0, 0);
        let index: DeviceIndex = t.block.params().unwrap();
        assert_eq!(index.device, 0);

        let mut info = PcmInfo::new_zeroed();
        info.stream = Stream::Playback as u32;
        t.block.set_params(&info).unwrap();
        assert_eq!(run(&mut t, CtlCommand::PcmInfo).0, 0);
        assert!(t.block.params::<PcmInfo>().unwrap().is_pcm());

        t.block
            .set_params(&DeviceIndex {
                device: -1,
                subdevice: 0,
            })
            .unwrap();
        assert_eq!(run(&mut t, CtlCommand::HwdepNextDevice).0, 0);
        assert_eq!(t.block.params::<DeviceIndex>().unwrap().device, -1);
    }

    #[test]
    fn poll_descriptor_over_tcp() {
        let mut t = transport();
        t.block.set_cmd(CtlCommand::PollDescriptor as u32);
        let outcome = t.dispatch(false);
        assert_eq!(t.block.result(), -(Errno::EOPNOTSUPP as i64));
        assert!(matches!(outcome.reply, Reply::Signal));
    }

    #[test]
    fn close_marks_done() {
        let mut t = transport();
        let (res, outcome) = run(&mut t, CtlCommand::Close);
        assert_eq!(res, 0);
        assert!(outcome.close);
        assert!(t.poll_target().is_none());
    }
}
