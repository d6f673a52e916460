use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

use aserver_api::pcm::{
    ChannelInfo, ChannelParams, ChannelSetup, MmapRegion, PcmFormat, PcmInfo, PcmParams,
    PcmParamsInfo, PcmSetup, PcmState, PcmStatus,
};
use aserver_api::{DeviceKind, Stream};
use memfd::{Memfd, MemfdOptions};
use nix::errno::Errno;
use nix::poll::PollFlags;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use zerocopy::FromZeroes;

use crate::device::{DevResult, PcmDevice};
use crate::log;

const FORMATS: [PcmFormat; 7] = [
    PcmFormat::S8,
    PcmFormat::U8,
    PcmFormat::S16Le,
    PcmFormat::S16Be,
    PcmFormat::S32Le,
    PcmFormat::FloatLe,
    PcmFormat::Float64Le,
];
const MIN_RATE: u32 = 4000;
const MAX_RATE: u32 = 192_000;
const MAX_CHANNELS: u32 = 32;
const MIN_PERIOD: u32 = 16;
const MAX_BUFFER: u32 = 1 << 20;

/// Hardware configuration a null device starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NullPcmSettings {
    pub format: PcmFormat,
    pub rate: u32,
    pub channels: u32,
    pub period_size: u32,
    pub buffer_size: u32,
}

impl Default for NullPcmSettings {
    fn default() -> Self {
        NullPcmSettings {
            format: PcmFormat::S16Le,
            rate: 48000,
            channels: 2,
            period_size: 1024,
            buffer_size: 4096,
        }
    }
}

fn now_ns() -> u64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// A sound card that plays into the void and records silence.
///
/// A periodic timer stands in for the interrupt: every period the hardware
/// pointer advances by `period_size` frames, and the timer descriptor is what
/// the server polls while a client waits for room or data.
pub struct NullPcm {
    name: String,
    stream: Stream,
    format: PcmFormat,
    params: PcmParams,
    channels_enabled: Vec<bool>,
    state: PcmState,
    timer: TimerFd,
    hw_ptr: u64,
    appl_ptr: u64,
    avail_max: u64,
    avail_min: u64,
    trigger_ns: u64,
    buffer: Option<Memfd>,
    async_owner: Option<(i32, i32)>,
}

impl NullPcm {
    pub fn open(name: &str, settings: NullPcmSettings, stream: Stream) -> DevResult<Self> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        let mut params = PcmParams::new_zeroed();
        params.format = settings.format as u32;
        params.rate = settings.rate;
        params.channels = settings.channels;
        params.period_size = settings.period_size;
        params.buffer_size = settings.buffer_size;
        let mut pcm = NullPcm {
            name: name.to_owned(),
            stream,
            format: settings.format,
            params,
            channels_enabled: Vec::new(),
            state: PcmState::Open,
            timer,
            hw_ptr: 0,
            appl_ptr: 0,
            avail_max: 0,
            avail_min: 0,
            trigger_ns: 0,
            buffer: None,
            async_owner: None,
        };
        pcm.params(&mut params)?;
        Ok(pcm)
    }

    fn buffer_size(&self) -> u64 {
        self.params.buffer_size as u64
    }

    fn period_size(&self) -> u64 {
        self.params.period_size as u64
    }

    fn period(&self) -> Duration {
        Duration::from_nanos(self.period_size() * 1_000_000_000 / self.params.rate as u64)
    }

    fn arm(&mut self) -> DevResult<()> {
        let period = TimeSpec::from(self.period());
        self.timer
            .set(Expiration::Interval(period), TimerSetTimeFlags::empty())
    }

    fn disarm(&mut self) {
        if let Err(e) = self.timer.unset() {
            log::warn!("null pcm {}: disarming timer: {}", self.name, e);
        }
        self.drain_timer();
    }

    /// Number of timer periods elapsed since the last call.
    fn drain_timer(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        match nix::unistd::read(self.timer.as_fd().as_raw_fd(), &mut buf) {
            Ok(8) => u64::from_ne_bytes(buf),
            _ => 0,
        }
    }

    /// Advances the hardware pointer by the periods that have elapsed.
    fn update(&mut self) {
        if self.state != PcmState::Running {
            return;
        }
        let frames = self.drain_timer() * self.period_size();
        match self.stream {
            Stream::Playback => {
                self.hw_ptr = (self.hw_ptr + frames).min(self.appl_ptr);
            }
            Stream::Capture => {
                self.hw_ptr += frames;
                // overrun: the oldest frames are lost
                let oldest = self.hw_ptr.saturating_sub(self.buffer_size());
                self.appl_ptr = self.appl_ptr.max(oldest);
            }
        }
        self.avail_max = self.avail_max.max(self.avail());
    }

    fn avail(&self) -> u64 {
        match self.stream {
            Stream::Playback => self.buffer_size() - (self.appl_ptr - self.hw_ptr),
            Stream::Capture => self.hw_ptr - self.appl_ptr,
        }
    }

    /// Common prologue of every transfer: auto-start, then measure room.
    fn transfer_room(&mut self) -> DevResult<u64> {
        match self.state {
            PcmState::Prepared => self.start()?,
            PcmState::Running => {}
            PcmState::Xrun => return Err(Errno::EPIPE),
            _ => return Err(Errno::EBADFD),
        }
        self.update();
        match self.avail() {
            0 => Err(Errno::EAGAIN),
            avail => Ok(avail),
        }
    }

    fn whole_frames(&self, len: usize) -> DevResult<u64> {
        let fb = self.frame_bytes();
        if fb == 0 || len % fb != 0 {
            return Err(Errno::EINVAL);
        }
        Ok((len / fb) as u64)
    }

    fn silence(&self) -> u8 {
        match self.format {
            PcmFormat::U8 => 0x80,
            _ => 0,
        }
    }
}

impl PcmDevice for NullPcm {
    fn stream(&self) -> Stream {
        self.stream
    }

    fn info(&mut self, info: &mut PcmInfo) -> DevResult<()> {
        info.kind = DeviceKind::Pcm as u32;
        info.card = 0;
        info.device = 0;
        info.subdevice = 0;
        info.stream = self.stream as u32;
        info.flags = 0;
        info.subdevices_count = 1;
        info.subdevices_avail = 0;
        aserver_api::set_name(&mut info.id, "null");
        aserver_api::set_name(&mut info.name, &self.name);
        Ok(())
    }

    fn params_info(&mut self, info: &mut PcmParamsInfo) -> DevResult<()> {
        info.formats = FORMATS.iter().fold(0, |mask, f| mask | f.mask());
        info.min_rate = MIN_RATE;
        info.max_rate = MAX_RATE;
        info.min_channels = 1;
        info.max_channels = MAX_CHANNELS;
        info.min_period_size = MIN_PERIOD;
        info.max_period_size = MAX_BUFFER / 2;
        info.min_buffer_size = 2 * MIN_PERIOD;
        info.max_buffer_size = MAX_BUFFER;
        Ok(())
    }

    fn params(&mut self, params: &mut PcmParams) -> DevResult<()> {
        if matches!(
            self.state,
            PcmState::Running | PcmState::Draining | PcmState::Paused
        ) {
            return Err(Errno::EBADFD);
        }
        let format = PcmFormat::from_raw(params.format).ok_or(Errno::EINVAL)?;
        if !(MIN_RATE..=MAX_RATE).contains(&params.rate)
            || !(1..=MAX_CHANNELS).contains(&params.channels)
            || params.period_size < MIN_PERIOD
            || params.buffer_size < 2 * params.period_size
            || params.buffer_size > MAX_BUFFER
            || params.avail_min > params.buffer_size
        {
            return Err(Errno::EINVAL);
        }
        self.format = format;
        self.params = *params;
        self.avail_min = match params.avail_min {
            0 => params.period_size as u64,
            n => n as u64,
        };
        self.channels_enabled = vec![true; params.channels as usize];
        self.buffer = None;
        self.hw_ptr = 0;
        self.appl_ptr = 0;
        self.avail_max = 0;
        self.state = PcmState::Setup;
        Ok(())
    }

    fn setup(&mut self, setup: &mut PcmSetup) -> DevResult<()> {
        setup.format = self.params.format;
        setup.rate = self.params.rate;
        setup.channels = self.params.channels;
        setup.period_size = self.params.period_size;
        setup.buffer_size = self.params.buffer_size;
        setup.frame_bits = (self.frame_bytes() * 8) as u32;
        setup.avail_min = self.avail_min as u32;
        setup.state = self.state as u32;
        Ok(())
    }

    fn channel_info(&mut self, info: &mut ChannelInfo) -> DevResult<()> {
        if info.channel >= self.params.channels {
            return Err(Errno::EINVAL);
        }
        let sample_bits = self.format.sample_bytes() as u32 * 8;
        info.first = info.channel * sample_bits;
        info.step = self.params.channels * sample_bits;
        Ok(())
    }

    fn channel_params(&mut self, params: &mut ChannelParams) -> DevResult<()> {
        let enabled = self
            .channels_enabled
            .get_mut(params.channel as usize)
            .ok_or(Errno::EINVAL)?;
        *enabled = params.enabled != 0;
        Ok(())
    }

    fn channel_setup(&mut self, setup: &mut ChannelSetup) -> DevResult<()> {
        let mut info = ChannelInfo::new_zeroed();
        info.channel = setup.channel;
        self.channel_info(&mut info)?;
        setup.enabled = self.channels_enabled[setup.channel as usize] as u32;
        setup.first = info.first;
        setup.step = info.step;
        Ok(())
    }

    fn status(&mut self, status: &mut PcmStatus) -> DevResult<()> {
        self.update();
        status.state = self.state as u32;
        status.trigger_ns = self.trigger_ns;
        status.tstamp_ns = now_ns();
        status.delay = self.delay()?;
        status.avail = self.avail();
        status.avail_max = self.avail_max;
        status.hw_ptr = self.hw_ptr;
        status.appl_ptr = self.appl_ptr;
        Ok(())
    }

    fn state(&mut self) -> PcmState {
        self.update();
        self.state
    }

    fn delay(&mut self) -> DevResult<i64> {
        self.update();
        Ok(match self.stream {
            Stream::Playback => (self.appl_ptr - self.hw_ptr) as i64,
            Stream::Capture => (self.hw_ptr - self.appl_ptr) as i64,
        })
    }

    fn avail_update(&mut self) -> DevResult<u64> {
        self.update();
        Ok(self.avail())
    }

    fn prepare(&mut self) -> DevResult<()> {
        if self.state == PcmState::Open {
            return Err(Errno::EBADFD);
        }
        self.disarm();
        self.hw_ptr = 0;
        self.appl_ptr = 0;
        self.avail_max = 0;
        self.state = PcmState::Prepared;
        Ok(())
    }

    fn start(&mut self) -> DevResult<()> {
        if self.state != PcmState::Prepared {
            return Err(Errno::EBADFD);
        }
        self.arm()?;
        self.trigger_ns = now_ns();
        self.state = PcmState::Running;
        Ok(())
    }

    fn drop_frames(&mut self) -> DevResult<()> {
        if self.state < PcmState::Prepared {
            return Err(Errno::EBADFD);
        }
        self.disarm();
        self.state = PcmState::Setup;
        Ok(())
    }

    fn drain(&mut self) -> DevResult<()> {
        if self.state < PcmState::Prepared {
            return Err(Errno::EBADFD);
        }
        // nothing audible is pending, so everything written has "played"
        if self.stream == Stream::Playback {
            self.hw_ptr = self.appl_ptr;
        }
        self.disarm();
        self.state = PcmState::Setup;
        Ok(())
    }

    fn pause(&mut self, enable: bool) -> DevResult<()> {
        match (enable, self.state) {
            (true, PcmState::Running) => {
                self.update();
                self.disarm();
                self.state = PcmState::Paused;
            }
            (false, PcmState::Paused) => {
                self.arm()?;
                self.state = PcmState::Running;
            }
            _ => return Err(Errno::EBADFD),
        }
        Ok(())
    }

    fn rewind(&mut self, frames: u64) -> DevResult<u64> {
        if self.state < PcmState::Prepared {
            return Err(Errno::EBADFD);
        }
        self.update();
        let rewindable = match self.stream {
            Stream::Playback => self.appl_ptr - self.hw_ptr,
            Stream::Capture => (self.buffer_size() - self.avail()).min(self.appl_ptr),
        };
        let n = frames.min(rewindable);
        self.appl_ptr -= n;
        Ok(n)
    }

    fn frame_bytes(&self) -> usize {
        self.format.sample_bytes() * self.params.channels as usize
    }

    fn writei(&mut self, buf: &[u8]) -> DevResult<u64> {
        if self.stream != Stream::Playback {
            return Err(Errno::EINVAL);
        }
        let frames = self.whole_frames(buf.len())?;
        if frames == 0 {
            return Ok(0);
        }
        let n = frames.min(self.transfer_room()?);
        self.appl_ptr += n;
        Ok(n)
    }

    fn readi(&mut self, buf: &mut [u8]) -> DevResult<u64> {
        if self.stream != Stream::Capture {
            return Err(Errno::EINVAL);
        }
        let frames = self.whole_frames(buf.len())?;
        if frames == 0 {
            return Ok(0);
        }
        let n = frames.min(self.transfer_room()?);
        let fill = self.silence();
        buf[..n as usize * self.frame_bytes()].fill(fill);
        self.appl_ptr += n;
        Ok(n)
    }

    fn mmap_count(&mut self) -> DevResult<u32> {
        Ok(1)
    }

    fn mmap_region(&mut self, region: &mut MmapRegion) -> DevResult<BorrowedFd<'_>> {
        if region.index != 0 {
            return Err(Errno::EINVAL);
        }
        let size = self.buffer_size() * self.frame_bytes() as u64;
        let memfd = match self.buffer.take() {
            Some(memfd) => memfd,
            None => {
                let memfd = MemfdOptions::default()
                    .close_on_exec(true)
                    .create(format!("null-pcm-{}", self.name))
                    .map_err(|_| Errno::ENOMEM)?;
                memfd
                    .as_file()
                    .set_len(size)
                    .map_err(|e| e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO))?;
                memfd
            }
        };
        region.offset = 0;
        region.size = size;
        Ok(self.buffer.insert(memfd).as_file().as_fd())
    }

    fn munmap(&mut self) -> DevResult<()> {
        self.buffer = None;
        Ok(())
    }

    fn mmap_forward(&mut self, frames: u64) -> DevResult<u64> {
        if frames == 0 {
            return Ok(0);
        }
        let n = frames.min(self.transfer_room()?);
        self.appl_ptr += n;
        Ok(n)
    }

    fn set_avail_min(&mut self, frames: u64) -> DevResult<()> {
        if frames == 0 || frames > self.buffer_size() {
            return Err(Errno::EINVAL);
        }
        self.avail_min = frames;
        Ok(())
    }

    fn set_async(&mut self, sig: i32, pid: i32) -> DevResult<()> {
        if sig < 0 {
            return Err(Errno::EINVAL);
        }
        self.async_owner = (sig != 0).then_some((sig, pid));
        Ok(())
    }

    fn poll_descriptor(&self) -> BorrowedFd<'_> {
        self.timer.as_fd()
    }

    fn poll_events(&self) -> PollFlags {
        PollFlags::POLLIN
    }

    fn close(&mut self) -> DevResult<()> {
        self.disarm();
        self.buffer = None;
        self.state = PcmState::Open;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small() -> NullPcmSettings {
        NullPcmSettings {
            format: PcmFormat::S16Le,
            rate: 8000,
            channels: 2,
            period_size: 800,
            buffer_size: 3200,
        }
    }

    #[test]
    fn opens_in_setup_with_defaults() {
        let mut pcm = NullPcm::open("default", NullPcmSettings::default(), Stream::Playback).unwrap();
        assert_eq!(pcm.state(), PcmState::Setup);
        assert_eq!(pcm.frame_bytes(), 4);

        let mut setup = PcmSetup::new_zeroed();
        pcm.setup(&mut setup).unwrap();
        assert_eq!(setup.frame_bits, 32);
        assert_eq!(setup.buffer_size, 4096);
        assert_eq!(setup.avail_min, 1024);
    }

    #[test]
    fn params_are_validated() {
        let mut pcm = NullPcm::open("p", small(), Stream::Playback).unwrap();
        let mut params = pcm.params;
        params.rate = 1;
        assert_eq!(pcm.params(&mut params), Err(Errno::EINVAL));
        params.rate = 44100;
        params.format = 99;
        assert_eq!(pcm.params(&mut params), Err(Errno::EINVAL));
        params.format = PcmFormat::FloatLe as u32;
        params.channels = 6;
        pcm.params(&mut params).unwrap();
        assert_eq!(pcm.frame_bytes(), 24);
    }

    #[test]
    fn playback_fills_then_blocks() {
        let mut pcm = NullPcm::open("p", small(), Stream::Playback).unwrap();
        let buf = vec![0u8; 2400 * 4];
        assert_eq!(pcm.writei(&buf), Err(Errno::EBADFD));

        pcm.prepare().unwrap();
        assert_eq!(pcm.writei(&buf), Ok(2400));
        assert_eq!(pcm.state(), PcmState::Running);
        assert_eq!(pcm.writei(&buf), Ok(800));
        assert_eq!(pcm.writei(&buf), Err(Errno::EAGAIN));
        assert_eq!(pcm.delay(), Ok(3200));

        // one period at 8kHz is 100ms
        thread::sleep(Duration::from_millis(250));
        assert!(pcm.avail_update().unwrap() >= 800);
        assert!(pcm.writei(&buf).unwrap() >= 800);
    }

    #[test]
    fn capture_produces_silence_in_periods() {
        let mut settings = small();
        settings.format = PcmFormat::U8;
        let mut pcm = NullPcm::open("c", settings, Stream::Capture).unwrap();
        pcm.prepare().unwrap();
        let mut buf = vec![1u8; 800 * 2];
        assert_eq!(pcm.readi(&mut buf), Err(Errno::EAGAIN));
        assert_eq!(pcm.state(), PcmState::Running);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(pcm.readi(&mut buf), Ok(800));
        assert!(buf.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn partial_frames_are_refused() {
        let mut pcm = NullPcm::open("p", small(), Stream::Playback).unwrap();
        pcm.prepare().unwrap();
        assert_eq!(pcm.writei(&[0u8; 6]), Err(Errno::EINVAL));
    }

    #[test]
    fn pause_and_rewind() {
        let mut pcm = NullPcm::open("p", small(), Stream::Playback).unwrap();
        pcm.prepare().unwrap();
        assert_eq!(pcm.pause(true), Err(Errno::EBADFD));
        pcm.writei(&vec![0u8; 480 * 4]).unwrap();
        pcm.pause(true).unwrap();
        assert_eq!(pcm.state(), PcmState::Paused);
        let rewound = pcm.rewind(10_000).unwrap();
        assert!(rewound <= 480);
        pcm.pause(false).unwrap();
        pcm.drop_frames().unwrap();
        assert_eq!(pcm.state(), PcmState::Setup);
    }

    #[test]
    fn mmap_region_is_buffer_sized() {
        let mut pcm = NullPcm::open("p", small(), Stream::Playback).unwrap();
        assert_eq!(pcm.mmap_count(), Ok(1));
        let mut region = MmapRegion::new_zeroed();
        pcm.mmap_region(&mut region).unwrap();
        assert_eq!(region.size, 3200 * 4);
        region.index = 1;
        assert!(pcm.mmap_region(&mut region).is_err());
    }
}
