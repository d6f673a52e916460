//! Software devices with no hardware behind them. They keep real time with
//! kernel timers so blocking and readiness behave like a sound card's.
pub mod ctl;
pub mod pcm;

pub use ctl::{NullCard, NullCtl};
pub use pcm::{NullPcm, NullPcmSettings};
