use crate::output::print_summary;
use crate::setup::{bind_rx_region, destroy_region, open_binder, parse_size};
use anyhow::{Context, Result};
use clap::Args;
use devmem_engine::{
    run_receiver, ArcStatsSink, EngineConfig, RecvMode, TcpDevmemSocket, TransferEngine,
};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// TCP port to listen on
    #[arg(default_value_t = 5201)]
    port: u16,

    /// Measurement duration in seconds
    #[arg(default_value_t = 10)]
    duration: u64,

    /// Network interface holding the RX queue
    #[arg(default_value = "eth1")]
    ifname: String,

    /// RX queue to bind the region to
    #[arg(default_value_t = 15)]
    queue: u32,

    /// RX region size (bytes, or with K/M/G suffix)
    #[arg(default_value = "16MiB", value_parser = parse_size)]
    size: usize,

    /// Receive through device memory (1) or by copy (0)
    #[arg(
        default_value = "1",
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    zerocopy: bool,

    /// Print the final report as one JSON line
    #[arg(long)]
    json: bool,
}

pub fn run(args: ServerArgs, shutdown: &Arc<AtomicBool>) -> Result<()> {
    // Declared first so the engine, and the binding it holds, drop before the region.
    let mut rx_region = None;
    let mut engine = TransferEngine::new(EngineConfig::default(), ArcStatsSink::default());

    // Bind before accepting so the queue is ready when data arrives.
    let mode = if args.zerocopy {
        match open_binder()
            .and_then(|mut binder| bind_rx_region(&mut binder, &args.ifname, args.queue, args.size))
        {
            Ok((region, binding)) => {
                engine.hold_binding(binding);
                rx_region = Some(region);
                RecvMode::ZeroCopy
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "devmem RX unavailable; receiving by copy");
                RecvMode::Copy
            }
        }
    } else {
        RecvMode::Copy
    };

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, args.port))
        .with_context(|| format!("failed to listen on port {}", args.port))?;
    println!("devmem TCP goodput server listening on port {}", args.port);
    println!("Measurement duration: {} seconds", args.duration);
    println!("Receive mode: {mode:?}");

    let (stream, peer) = listener.accept().context("accept failed")?;
    println!("Client connected from {peer}");
    engine.attach(TcpDevmemSocket::new(stream))?;

    info!("starting measurement");
    let summary = run_receiver(
        &mut engine,
        mode,
        Duration::from_secs(args.duration),
        shutdown,
        |line| println!("{line}"),
    )
    .context("receive loop failed")?;

    if let Some(region) = rx_region {
        destroy_region(region, engine.ledger())?;
    }
    print_summary(
        "server",
        "Measurement Results",
        mode == RecvMode::ZeroCopy,
        &summary,
        args.json,
    )
}
