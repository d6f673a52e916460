//! Client stubs for the audio server. Every operation fills the shared
//! control block, signals the server over the control socket and waits for
//! its answer.
pub use tracing as log;

mod channel;
mod connect;
pub mod ctl;
pub mod error;
pub mod pcm;

pub use connect::ServerAddr;
pub use ctl::CtlClient;
pub use error::Error;
pub use pcm::{MmapArea, PcmClient};

pub use aserver_api::{OpenMode, Stream};
