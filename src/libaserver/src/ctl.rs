//! Mixer control stub.
use std::mem::size_of;
use std::os::unix::io::{BorrowedFd, OwnedFd};

use aserver_api::ctl::{
    CardInfo, CtlCommand, CtlEvent, DeviceIndex, ElemId, ElemInfo, ElemList, ElemValue,
    HwdepInfo, RawmidiInfo,
};
use aserver_api::pcm::PcmInfo;
use aserver_api::{CtlLayout, DeviceKind, OpenMode, OpenRequest, Stream};
use nix::poll::PollTimeout;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::channel::{Channel, Readiness};
use crate::{Error, ServerAddr};

pub struct CtlClient {
    channel: Channel<CtlLayout>,
    mode: OpenMode,
}

impl CtlClient {
    pub fn open(addr: &ServerAddr, name: &str, mode: OpenMode) -> Result<Self, Error> {
        let req = OpenRequest::new(DeviceKind::Ctl, name, Stream::Playback, mode);
        let channel = Channel::open(addr, &req, Readiness::Readable)?;
        Ok(CtlClient { channel, mode })
    }

    pub fn shmid(&self) -> Option<i32> {
        self.channel.shmid()
    }

    fn inout<T: AsBytes + FromBytes>(&mut self, cmd: CtlCommand, input: &T) -> Result<T, Error> {
        self.channel.block_mut()?.set_params(input)?;
        self.channel.action(cmd as u32)?;
        Ok(self.channel.block()?.params()?)
    }

    fn next_device(&mut self, cmd: CtlCommand, device: i32) -> Result<i32, Error> {
        let index = self.inout(cmd, &DeviceIndex { device, subdevice: 0 })?;
        Ok(index.device)
    }

    fn prefer_subdevice(&mut self, cmd: CtlCommand, subdevice: i32) -> Result<(), Error> {
        self.channel
            .block_mut()?
            .set_params(&DeviceIndex { device: 0, subdevice })?;
        self.channel.action(cmd as u32).map(|_| ())
    }

    pub fn card(&mut self) -> Result<i32, Error> {
        Ok(self.channel.action(CtlCommand::Card as u32)? as i32)
    }

    pub fn hw_info(&mut self) -> Result<CardInfo, Error> {
        self.inout(CtlCommand::HwInfo, &CardInfo::new_zeroed())
    }

    /// Lists up to `space` element ids starting at `offset`.
    pub fn elem_list(&mut self, offset: u32, space: u32) -> Result<(ElemList, Vec<ElemId>), Error> {
        let list = self.inout(
            CtlCommand::ElemList,
            &ElemList {
                offset,
                space,
                used: 0,
                count: 0,
            },
        )?;
        let block = self.channel.block()?;
        let entry = size_of::<ElemId>();
        let raw = block.data(0, list.used as usize * entry)?;
        let ids = raw.chunks_exact(entry).filter_map(ElemId::read_from).collect();
        Ok((list, ids))
    }

    pub fn elem_info(&mut self, id: &ElemId) -> Result<ElemInfo, Error> {
        let mut info = ElemInfo::new_zeroed();
        info.id = *id;
        self.inout(CtlCommand::ElemInfo, &info)
    }

    pub fn elem_read(&mut self, id: &ElemId) -> Result<ElemValue, Error> {
        let mut value = ElemValue::new_zeroed();
        value.id = *id;
        self.inout(CtlCommand::ElemRead, &value)
    }

    pub fn elem_write(&mut self, value: &ElemValue) -> Result<ElemValue, Error> {
        self.inout(CtlCommand::ElemWrite, value)
    }

    /// Next hwdep device after `device`, -1 when there is none.
    pub fn hwdep_next_device(&mut self, device: i32) -> Result<i32, Error> {
        self.next_device(CtlCommand::HwdepNextDevice, device)
    }

    pub fn hwdep_info(&mut self, device: u32) -> Result<HwdepInfo, Error> {
        let mut info = HwdepInfo::new_zeroed();
        info.device = device;
        self.inout(CtlCommand::HwdepInfo, &info)
    }

    pub fn pcm_next_device(&mut self, device: i32) -> Result<i32, Error> {
        self.next_device(CtlCommand::PcmNextDevice, device)
    }

    pub fn pcm_info(&mut self, device: i32, subdevice: i32, stream: Stream) -> Result<PcmInfo, Error> {
        let mut info = PcmInfo::new_zeroed();
        info.device = device;
        info.subdevice = subdevice;
        info.stream = stream as u32;
        self.inout(CtlCommand::PcmInfo, &info)
    }

    pub fn pcm_prefer_subdevice(&mut self, subdevice: i32) -> Result<(), Error> {
        self.prefer_subdevice(CtlCommand::PcmPreferSubdevice, subdevice)
    }

    pub fn rawmidi_next_device(&mut self, device: i32) -> Result<i32, Error> {
        self.next_device(CtlCommand::RawmidiNextDevice, device)
    }

    pub fn rawmidi_info(&mut self, device: u32, subdevice: u32) -> Result<RawmidiInfo, Error> {
        let mut info = RawmidiInfo::new_zeroed();
        info.device = device;
        info.subdevice = subdevice;
        self.inout(CtlCommand::RawmidiInfo, &info)
    }

    pub fn rawmidi_prefer_subdevice(&mut self, subdevice: i32) -> Result<(), Error> {
        self.prefer_subdevice(CtlCommand::RawmidiPreferSubdevice, subdevice)
    }

    /// Pops the next pending event. Without `NONBLOCK` this waits for one.
    pub fn read_event(&mut self) -> Result<CtlEvent, Error> {
        let nonblock = self.mode.contains(OpenMode::NONBLOCK);
        self.channel.retry(nonblock, |ch| {
            ch.action(CtlCommand::ReadEvent as u32)?;
            Ok(ch.block()?.params::<CtlEvent>()?)
        })
    }

    /// Waits up to `timeout` for an event to be reported.
    pub fn wait(&self, timeout: PollTimeout) -> Result<bool, Error> {
        self.channel.wait(timeout)
    }

    pub fn poll_descriptor(&self) -> BorrowedFd<'_> {
        self.channel.poll_descriptor()
    }

    pub fn device_poll_descriptor(&mut self) -> Result<OwnedFd, Error> {
        self.channel
            .action_fd(CtlCommand::PollDescriptor as u32)
            .map(|(_, fd)| fd)
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.channel.close(CtlCommand::Close as u32)
    }
}
