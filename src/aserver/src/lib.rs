//! An audio device server: clients open named playback, capture or mixer
//! devices and drive them through a shared-memory control block.
pub use tracing as log;

pub mod config;
pub mod device;
pub mod logging;
pub mod pending;
pub mod server;
pub mod session;
pub mod transport;

pub use config::Config;
pub use device::DeviceRegistry;
pub use server::Server;
