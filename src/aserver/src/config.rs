use std::fs;
use std::path::{Path, PathBuf};

use aserver_api::pcm::PcmFormat;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Filesystem path of the local listener.
    pub socket: Option<PathBuf>,
    /// TCP port of the network listener.
    pub port: Option<u16>,
    #[serde(default = "ServerConfig::default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "ServerConfig::default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "ServerConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "ServerConfig::default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,
}

impl ServerConfig {
    fn default_max_pending() -> usize {
        4
    }

    fn default_max_clients() -> usize {
        16
    }

    fn default_poll_interval_ms() -> u64 {
        1000
    }

    fn default_pending_timeout_ms() -> u64 {
        5000
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            socket: None,
            port: None,
            max_pending: Self::default_max_pending(),
            max_clients: Self::default_max_clients(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            pending_timeout_ms: Self::default_pending_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    S8,
    U8,
    #[default]
    S16Le,
    S16Be,
    S32Le,
    FloatLe,
    Float64Le,
}

impl From<SampleFormat> for PcmFormat {
    fn from(f: SampleFormat) -> Self {
        match f {
            SampleFormat::S8 => PcmFormat::S8,
            SampleFormat::U8 => PcmFormat::U8,
            SampleFormat::S16Le => PcmFormat::S16Le,
            SampleFormat::S16Be => PcmFormat::S16Be,
            SampleFormat::S32Le => PcmFormat::S32Le,
            SampleFormat::FloatLe => PcmFormat::FloatLe,
            SampleFormat::Float64Le => PcmFormat::Float64Le,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PcmDeviceConfig {
    pub name: String,
    pub backend: Backend,
    #[serde(default)]
    pub format: SampleFormat,
    #[serde(default = "PcmDeviceConfig::default_rate")]
    pub rate: u32,
    #[serde(default = "PcmDeviceConfig::default_channels")]
    pub channels: u32,
    #[serde(default = "PcmDeviceConfig::default_period_size")]
    pub period_size: u32,
    #[serde(default = "PcmDeviceConfig::default_buffer_size")]
    pub buffer_size: u32,
}

impl PcmDeviceConfig {
    fn default_rate() -> u32 {
        48000
    }

    fn default_channels() -> u32 {
        2
    }

    fn default_period_size() -> u32 {
        1024
    }

    fn default_buffer_size() -> u32 {
        4096
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CtlDeviceConfig {
    pub name: String,
    pub backend: Backend,
    #[serde(default)]
    pub card: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "Config::default_log_level")]
    pub log_level: String,
    pub log_file: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pcm: Vec<PcmDeviceConfig>,
    #[serde(default)]
    pub ctl: Vec<CtlDeviceConfig>,
}

impl Config {
    fn default_log_level() -> String {
        "info".to_owned()
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.socket.is_none() && self.server.port.is_none() {
            anyhow::bail!("neither server.socket nor server.port is configured");
        }
        // a session is paired from two pending connections
        if self.server.max_pending < 2 {
            anyhow::bail!("server.max_pending must be at least 2");
        }
        if self.server.max_clients == 0 {
            anyhow::bail!("server.max_clients must be at least 1");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: Self::default_log_level(),
            log_file: None,
            server: ServerConfig::default(),
            pcm: Vec::new(),
            ctl: Vec::new(),
        }
    }
}
