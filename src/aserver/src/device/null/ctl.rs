use std::collections::VecDeque;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use aserver_api::ctl::{
    CardInfo, CtlEvent, ElemId, ElemIface, ElemInfo, ElemList, ElemType, ElemValue, HwdepInfo,
    RawmidiInfo, ELEM_ACCESS_READ, ELEM_ACCESS_WRITE, ELEM_VALUES_MAX, EVENT_MASK_VALUE,
};
use aserver_api::pcm::PcmInfo;
use aserver_api::{DeviceKind, Stream};
use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};
use zerocopy::FromZeroes;

use crate::device::{CtlDevice, DevResult};
use crate::log;

struct Elem {
    id: ElemId,
    kind: ElemType,
    min: i64,
    max: i64,
    step: i64,
    values: Vec<i64>,
}

impl Elem {
    fn new(numid: u32, name: &str, kind: ElemType, range: (i64, i64), values: Vec<i64>) -> Self {
        let mut id = ElemId::by_name(ElemIface::Mixer, name);
        id.numid = numid;
        Elem {
            id,
            kind,
            min: range.0,
            max: range.1,
            step: 1,
            values,
        }
    }

    fn matches(&self, id: &ElemId) -> bool {
        if id.numid != 0 {
            return id.numid == self.id.numid;
        }
        id.iface == self.id.iface && id.index == self.id.index && id.name() == self.id.name()
    }
}

/// One opener's view of the card's change events.
struct Subscriber {
    events: Mutex<VecDeque<CtlEvent>>,
    notify: EventFd,
}

impl Subscriber {
    fn push(&self, event: CtlEvent) -> DevResult<()> {
        lock(&self.events).push_back(event);
        self.notify.write(1)?;
        Ok(())
    }
}

struct Card {
    index: i32,
    name: String,
    elems: Vec<Elem>,
    subscribers: Vec<Weak<Subscriber>>,
}

impl Card {
    fn find(&self, id: &ElemId) -> DevResult<usize> {
        self.elems
            .iter()
            .position(|e| e.matches(id))
            .ok_or(Errno::ENOENT)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A mixer with a master volume and a master switch, shared by every
/// control handle opened on it. A write that changes a value queues an
/// event for each handle and raises the eventfd that handle polls on.
#[derive(Clone)]
pub struct NullCard {
    inner: Arc<Mutex<Card>>,
}

impl NullCard {
    pub fn new(name: &str, index: i32) -> Self {
        let card = Card {
            index,
            name: name.to_owned(),
            elems: vec![
                Elem::new(1, "Master Playback Volume", ElemType::Integer, (0, 100), vec![80, 80]),
                Elem::new(2, "Master Playback Switch", ElemType::Boolean, (0, 1), vec![1]),
            ],
            subscribers: Vec::new(),
        };
        NullCard {
            inner: Arc::new(Mutex::new(card)),
        }
    }

    pub fn open(&self) -> DevResult<NullCtl> {
        let notify = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        let sub = Arc::new(Subscriber {
            events: Mutex::new(VecDeque::new()),
            notify,
        });
        let mut card = lock(&self.inner);
        card.subscribers.retain(|s| s.strong_count() > 0);
        card.subscribers.push(Arc::downgrade(&sub));
        Ok(NullCtl {
            index: card.index,
            card: self.clone(),
            sub,
            pcm_subdevice: -1,
            rawmidi_subdevice: -1,
        })
    }
}

/// A control handle on a [`NullCard`].
pub struct NullCtl {
    index: i32,
    card: NullCard,
    sub: Arc<Subscriber>,
    pcm_subdevice: i32,
    rawmidi_subdevice: i32,
}

impl NullCtl {
    /// Opens a handle on a card of its own.
    pub fn open(name: &str, card: i32) -> DevResult<Self> {
        NullCard::new(name, card).open()
    }

    fn state(&self) -> MutexGuard<'_, Card> {
        lock(&self.card.inner)
    }
}

impl CtlDevice for NullCtl {
    fn card(&self) -> i32 {
        self.index
    }

    fn hw_info(&mut self, info: &mut CardInfo) -> DevResult<()> {
        let card = self.state();
        info.card = card.index;
        aserver_api::set_name(&mut info.id, "Null");
        aserver_api::set_name(&mut info.driver, "null");
        aserver_api::set_name(&mut info.name, &card.name);
        aserver_api::set_name(&mut info.longname, &format!("Null card {}", card.index));
        aserver_api::set_name(&mut info.mixername, "Null Mixer");
        aserver_api::set_name(&mut info.components, "");
        Ok(())
    }

    fn elem_list(&mut self, list: &mut ElemList, ids: &mut Vec<ElemId>) -> DevResult<()> {
        let card = self.state();
        let offset = (list.offset as usize).min(card.elems.len());
        ids.extend(
            card.elems[offset..]
                .iter()
                .take(list.space as usize)
                .map(|e| e.id),
        );
        list.used = ids.len() as u32;
        list.count = card.elems.len() as u32;
        Ok(())
    }

    fn elem_info(&mut self, info: &mut ElemInfo) -> DevResult<()> {
        let card = self.state();
        let elem = &card.elems[card.find(&info.id)?];
        info.id = elem.id;
        info.kind = elem.kind as u32;
        info.access = ELEM_ACCESS_READ | ELEM_ACCESS_WRITE;
        info.count = elem.values.len() as u32;
        info.min = elem.min;
        info.max = elem.max;
        info.step = elem.step;
        Ok(())
    }

    fn elem_read(&mut self, value: &mut ElemValue) -> DevResult<()> {
        let card = self.state();
        let elem = &card.elems[card.find(&value.id)?];
        value.id = elem.id;
        value.values = [0; ELEM_VALUES_MAX];
        value.values[..elem.values.len()].copy_from_slice(&elem.values);
        Ok(())
    }

    fn elem_write(&mut self, value: &mut ElemValue) -> DevResult<()> {
        let mut card = self.state();
        let index = card.find(&value.id)?;
        let elem = &mut card.elems[index];
        let count = elem.values.len();
        let new = &value.values[..count];
        if new.iter().any(|v| *v < elem.min || *v > elem.max) {
            return Err(Errno::EINVAL);
        }
        value.id = elem.id;
        if elem.values == new {
            return Ok(());
        }
        elem.values.copy_from_slice(new);
        let mut event = CtlEvent::new_zeroed();
        event.mask = EVENT_MASK_VALUE;
        event.id = elem.id;
        card.subscribers.retain(|s| s.strong_count() > 0);
        for sub in card.subscribers.iter().filter_map(Weak::upgrade) {
            sub.push(event)?;
        }
        Ok(())
    }

    fn hwdep_next_device(&mut self, device: &mut i32) -> DevResult<()> {
        *device = -1;
        Ok(())
    }

    fn hwdep_info(&mut self, _info: &mut HwdepInfo) -> DevResult<()> {
        Err(Errno::ENXIO)
    }

    fn pcm_next_device(&mut self, device: &mut i32) -> DevResult<()> {
        *device = if *device < 0 { 0 } else { -1 };
        Ok(())
    }

    fn pcm_info(&mut self, info: &mut PcmInfo) -> DevResult<()> {
        if info.device != 0 || info.subdevice > 0 {
            return Err(Errno::ENXIO);
        }
        let stream = Stream::from_raw(info.stream as u8).ok_or(Errno::EINVAL)?;
        info.kind = DeviceKind::Pcm as u32;
        info.card = self.index;
        info.subdevice = 0;
        info.stream = stream as u32;
        info.subdevices_count = 1;
        info.subdevices_avail = 1;
        aserver_api::set_name(&mut info.id, "null");
        aserver_api::set_name(&mut info.name, &self.state().name);
        Ok(())
    }

    fn pcm_prefer_subdevice(&mut self, subdevice: i32) -> DevResult<()> {
        self.pcm_subdevice = subdevice;
        Ok(())
    }

    fn rawmidi_next_device(&mut self, device: &mut i32) -> DevResult<()> {
        *device = -1;
        Ok(())
    }

    fn rawmidi_info(&mut self, _info: &mut RawmidiInfo) -> DevResult<()> {
        Err(Errno::ENXIO)
    }

    fn rawmidi_prefer_subdevice(&mut self, subdevice: i32) -> DevResult<()> {
        self.rawmidi_subdevice = subdevice;
        Ok(())
    }

    fn read_event(&mut self) -> DevResult<CtlEvent> {
        let mut events = lock(&self.sub.events);
        let event = events.pop_front().ok_or(Errno::EAGAIN)?;
        if events.is_empty() {
            match self.sub.notify.read() {
                Ok(_) | Err(Errno::EAGAIN) => {}
                Err(e) => log::warn!("null ctl {}: clearing eventfd: {}", self.index, e),
            }
        }
        Ok(event)
    }

    fn poll_descriptor(&self) -> BorrowedFd<'_> {
        self.sub.notify.as_fd()
    }

    fn close(&mut self) -> DevResult<()> {
        lock(&self.sub.events).clear();
        let me = Arc::downgrade(&self.sub);
        self.state().subscribers.retain(|s| !s.ptr_eq(&me));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipc::handshake::poll_one;
    use nix::poll::{PollFlags, PollTimeout};

    fn volume() -> ElemId {
        ElemId::by_name(ElemIface::Mixer, "Master Playback Volume")
    }

    #[test]
    fn list_with_offset_and_space() {
        let mut ctl = NullCtl::open("default", 0).unwrap();
        let mut list = ElemList::new_zeroed();
        list.space = 1;
        let mut ids = Vec::new();
        ctl.elem_list(&mut list, &mut ids).unwrap();
        assert_eq!((list.used, list.count), (1, 2));
        assert_eq!(ids[0].numid, 1);

        list.offset = 1;
        list.space = 8;
        ids.clear();
        ctl.elem_list(&mut list, &mut ids).unwrap();
        assert_eq!(ids[0].name(), "Master Playback Switch");
    }

    #[test]
    fn write_raises_one_event() {
        let mut ctl = NullCtl::open("default", 0).unwrap();
        assert_eq!(ctl.read_event(), Err(Errno::EAGAIN));

        let mut value = ElemValue::new_zeroed();
        value.id = volume();
        ctl.elem_read(&mut value).unwrap();
        assert_eq!(&value.values[..2], &[80, 80]);

        value.values[0] = 30;
        ctl.elem_write(&mut value).unwrap();
        let ready = poll_one(&ctl.poll_descriptor(), PollFlags::POLLIN, PollTimeout::ZERO).unwrap();
        assert!(ready.contains(PollFlags::POLLIN));

        // unchanged values do not notify
        ctl.elem_write(&mut value).unwrap();

        let event = ctl.read_event().unwrap();
        assert_eq!(event.mask, EVENT_MASK_VALUE);
        assert_eq!(event.id.numid, 1);
        assert_eq!(ctl.read_event(), Err(Errno::EAGAIN));
        let ready = poll_one(&ctl.poll_descriptor(), PollFlags::POLLIN, PollTimeout::ZERO).unwrap();
        assert!(!ready.contains(PollFlags::POLLIN));
    }

    #[test]
    fn writes_reach_every_handle_on_the_card() {
        let card = NullCard::new("default", 0);
        let mut writer = card.open().unwrap();
        let mut reader = card.open().unwrap();
        let mut closed = card.open().unwrap();
        closed.close().unwrap();

        let mut value = ElemValue::new_zeroed();
        value.id = volume();
        value.values[..2].copy_from_slice(&[10, 20]);
        writer.elem_write(&mut value).unwrap();

        let ready = poll_one(&reader.poll_descriptor(), PollFlags::POLLIN, PollTimeout::ZERO).unwrap();
        assert!(ready.contains(PollFlags::POLLIN));
        assert_eq!(reader.read_event().unwrap().id.numid, 1);
        assert_eq!(writer.read_event().unwrap().id.numid, 1);
        assert_eq!(closed.read_event(), Err(Errno::EAGAIN));

        let mut seen = ElemValue::new_zeroed();
        seen.id = volume();
        reader.elem_read(&mut seen).unwrap();
        assert_eq!(&seen.values[..2], &[10, 20]);
    }

    #[test]
    fn out_of_range_write() {
        let mut ctl = NullCtl::open("default", 0).unwrap();
        let mut value = ElemValue::new_zeroed();
        value.id = ElemId::by_numid(2);
        value.values[0] = 2;
        assert_eq!(ctl.elem_write(&mut value), Err(Errno::EINVAL));
        value.id = ElemId::by_numid(9);
        assert_eq!(ctl.elem_write(&mut value), Err(Errno::ENOENT));
    }

    #[test]
    fn enumerates_one_pcm() {
        let mut ctl = NullCtl::open("default", 3).unwrap();
        let mut device = -1;
        ctl.pcm_next_device(&mut device).unwrap();
        assert_eq!(device, 0);
        ctl.pcm_next_device(&mut device).unwrap();
        assert_eq!(device, -1);
        ctl.hwdep_next_device(&mut device).unwrap();
        assert_eq!(device, -1);

        let mut info = PcmInfo::new_zeroed();
        ctl.pcm_info(&mut info).unwrap();
        assert!(info.is_pcm());
        assert_eq!(info.card, 3);
    }
}
