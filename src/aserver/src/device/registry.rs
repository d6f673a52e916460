//! Logical device names and how to open them.
use aserver_api::{OpenMode, Stream};
use fnv::FnvHashMap;
use nix::errno::Errno;

use crate::config::{Backend, Config};
use crate::device::null::{NullCard, NullPcm, NullPcmSettings};
use crate::device::{CtlDevice, DevResult, PcmDevice};

pub type PcmFactory = Box<dyn Fn(Stream, OpenMode) -> DevResult<Box<dyn PcmDevice>> + Send>;
pub type CtlFactory = Box<dyn Fn(OpenMode) -> DevResult<Box<dyn CtlDevice>> + Send>;

#[derive(Default)]
pub struct DeviceRegistry {
    pcm: FnvHashMap<String, PcmFactory>,
    ctl: FnvHashMap<String, CtlFactory>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let mut registry = DeviceRegistry::new();
        for entry in &config.pcm {
            let name = entry.name.clone();
            let settings = NullPcmSettings {
                format: entry.format.into(),
                rate: entry.rate,
                channels: entry.channels,
                period_size: entry.period_size,
                buffer_size: entry.buffer_size,
            };
            match entry.backend {
                Backend::Null => registry.register_pcm(&entry.name, move |stream, _mode| {
                    Ok(Box::new(NullPcm::open(&name, settings, stream)?) as Box<dyn PcmDevice>)
                }),
            }
        }
        for entry in &config.ctl {
            match entry.backend {
                Backend::Null => {
                    // every session on this name sees the same card
                    let card = NullCard::new(&entry.name, entry.card);
                    registry.register_ctl(&entry.name, move |_mode| {
                        Ok(Box::new(card.open()?) as Box<dyn CtlDevice>)
                    })
                }
            }
        }
        registry
    }

    pub fn register_pcm<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(Stream, OpenMode) -> DevResult<Box<dyn PcmDevice>> + Send + 'static,
    {
        self.pcm.insert(name.to_owned(), Box::new(factory));
    }

    pub fn register_ctl<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(OpenMode) -> DevResult<Box<dyn CtlDevice>> + Send + 'static,
    {
        self.ctl.insert(name.to_owned(), Box::new(factory));
    }

    pub fn open_pcm(&self, name: &str, stream: Stream, mode: OpenMode) -> DevResult<Box<dyn PcmDevice>> {
        let factory = self.pcm.get(name).ok_or(Errno::ENOENT)?;
        factory(stream, mode)
    }

    pub fn open_ctl(&self, name: &str, mode: OpenMode) -> DevResult<Box<dyn CtlDevice>> {
        let factory = self.ctl.get(name).ok_or(Errno::ENOENT)?;
        factory(mode)
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty() && self.ctl.is_empty()
    }
}
