use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;
use nix::sys::signal;

use aserver::log;
use aserver::{logging, Config, DeviceRegistry, Server};

#[derive(Debug, Clone, Parser)]
#[command(name = "aserver", about = "Audio device server")]
struct Opts {
    /// Server config path
    #[arg(short, long, default_value = "aserver.toml")]
    config: PathBuf,
    /// Local listener path, overrides the config
    #[arg(long)]
    socket: Option<PathBuf>,
    /// TCP listener port, overrides the config
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    no_ansi: bool,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(sig: i32) {
    assert_eq!(sig, signal::SIGINT as i32);
    TERMINATE.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let mut config = Config::from_path(&opts.config)?;
    if opts.socket.is_some() {
        config.server.socket = opts.socket;
    }
    if opts.port.is_some() {
        config.server.port = opts.port;
    }

    // keep the guard alive so buffered file output is flushed on exit
    let _guard = logging::init_log(&config, !opts.no_ansi)?;

    let registry = DeviceRegistry::from_config(&config);
    let mut server = Server::new(&config, registry)?;

    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_sigint),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal::SIGINT, &sig_action) }
        .expect("failed to register sighandler");

    log::info!("aserver started");
    server.mainloop(&TERMINATE)
}
