//! `devmem`: helper, goodput server and goodput client for device-memory TCP.

mod client;
mod helper;
mod output;
mod server;
mod setup;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Device-memory TCP zero-copy tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create, fill and bind RX/TX regions, then hold them until Enter
    Helper(helper::HelperArgs),
    /// Accept one client and measure receive goodput
    Server(server::ServerArgs),
    /// Connect to a server and measure send goodput
    Client(client::ClientArgs),
}

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_interrupt(_signal: libc::c_int) {
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

fn main() -> Result<()> {
    init_tracing();
    let shutdown = Arc::clone(SHUTDOWN.get_or_init(|| Arc::new(AtomicBool::new(false))));
    install_interrupt_handler();

    match Args::parse().command {
        Command::Helper(args) => helper::run(args),
        Command::Server(args) => server::run(args, &shutdown),
        Command::Client(args) => client::run(args, &shutdown),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Ignore error if already set (e.g., during tests).
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Ctrl+C stops new transfers; the running loop then drains and reports.
fn install_interrupt_handler() {
    let handler = on_interrupt as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        tracing::warn!("could not install Ctrl+C handler");
    }
}
