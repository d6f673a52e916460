#![allow(dead_code)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use aserver::config::{Backend, CtlDeviceConfig, PcmDeviceConfig, SampleFormat};
use aserver::{Config, DeviceRegistry, Server};
use libaserver::ServerAddr;

pub fn socket_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("aserver-test-{}-{}.sock", tag, std::process::id()))
}

/// A server with a 48 kHz "default" pcm, a slow 8 kHz mono "capture" pcm
/// whose period is 10 ms, and a "default" mixer.
pub fn config(tag: &str, inet: bool) -> Config {
    let mut config = Config::default();
    config.server.socket = Some(socket_path(tag));
    if inet {
        config.server.port = Some(0);
    }
    config.server.poll_interval_ms = 20;
    config.server.pending_timeout_ms = 500;
    config.pcm.push(PcmDeviceConfig {
        name: "default".to_owned(),
        backend: Backend::Null,
        format: SampleFormat::S16Le,
        rate: 48000,
        channels: 2,
        period_size: 1024,
        buffer_size: 4096,
    });
    config.pcm.push(PcmDeviceConfig {
        name: "capture".to_owned(),
        backend: Backend::Null,
        format: SampleFormat::U8,
        rate: 8000,
        channels: 1,
        period_size: 80,
        buffer_size: 320,
    });
    config.ctl.push(CtlDeviceConfig {
        name: "default".to_owned(),
        backend: Backend::Null,
        card: 0,
    });
    config
}

pub struct TestServer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
    pub local: ServerAddr,
    pub inet: Option<ServerAddr>,
}

impl TestServer {
    pub fn start(tag: &str, inet: bool) -> Self {
        let config = config(tag, inet);
        let registry = DeviceRegistry::from_config(&config);
        let mut server = Server::new(&config, registry).unwrap();
        let inet = server.inet_addr().map(|addr| ServerAddr::Inet {
            host: "127.0.0.1".to_owned(),
            port: addr.port(),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || server.mainloop(&flag));
        TestServer {
            stop,
            handle: Some(handle),
            local: ServerAddr::Local(socket_path(tag)),
            inet,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

/// Polls `cond` until it holds or two seconds pass.
pub fn eventually<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
