use crate::output::print_summary;
use crate::setup::{bind_tx_region, destroy_region, open_binder, page_aligned, parse_size};
use anyhow::{Context, Result};
use clap::Args;
use devmem_engine::{
    run_sender, ArcStatsSink, EngineConfig, SendPlan, TcpDevmemSocket, TransferEngine, TxFragment,
};
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server address
    #[arg(default_value = "127.0.0.1")]
    server: String,

    /// Server port
    #[arg(default_value_t = 5201)]
    port: u16,

    /// Bytes per send (or with K/M/G suffix)
    #[arg(default_value = "1MiB", value_parser = parse_size)]
    size: usize,

    /// Test duration in seconds
    #[arg(default_value_t = 10)]
    duration: u64,

    /// Send from a bound device-memory region (1) or by copy (0)
    #[arg(
        default_value = "0",
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    zerocopy: bool,

    /// Interface the TX region is bound to
    #[arg(default_value = "eth1")]
    ifname: String,

    /// Print the final report as one JSON line
    #[arg(long)]
    json: bool,
}

pub fn run(args: ClientArgs, shutdown: &Arc<AtomicBool>) -> Result<()> {
    println!("devmem TCP goodput client");
    println!("Server: {}:{}", args.server, args.port);
    println!("Data size per send: {} bytes", args.size);
    println!("Test duration: {} seconds", args.duration);
    println!("Zero-copy: {}", if args.zerocopy { "Yes" } else { "No" });
    println!("Interface: {}", args.ifname);

    let stream = TcpStream::connect((args.server.as_str(), args.port))
        .with_context(|| format!("connect to {}:{} failed", args.server, args.port))?;
    let socket = TcpDevmemSocket::new(stream);
    println!("Connected to server");

    // Declared first so the engine, and the binding it holds, drop before the region.
    let mut tx_region = None;
    let mut engine = TransferEngine::new(EngineConfig::default(), ArcStatsSink::default());
    let duration = Duration::from_secs(args.duration);

    let summary = if args.zerocopy {
        socket.enable_zerocopy().context("enabling SO_ZEROCOPY")?;
        if let Err(err) = socket.bind_to_device(&args.ifname) {
            warn!(%err, ifname = %args.ifname, "SO_BINDTODEVICE failed; continuing unpinned");
        }

        let mut binder = open_binder()?;
        let (region, binding) = bind_tx_region(&mut binder, &args.ifname, page_aligned(args.size))?;
        let dmabuf_id = binding.dmabuf_id().unwrap_or_else(|| {
            warn!("TX dma-buf id not reported; sending with id 0");
            0
        });
        let frag = TxFragment::within(&region, dmabuf_id, 0, args.size)?;
        tx_region = Some(region);
        engine.hold_binding(binding);
        engine.attach(socket)?;

        info!("starting zero-copy transmission");
        let summary = run_sender(
            &mut engine,
            SendPlan::ZeroCopy(frag),
            duration,
            shutdown,
            |line| println!("{line}"),
        )
        .context("zero-copy send failed; the TX binding may not have taken effect")?;
        if let Some(region) = tx_region.take() {
            destroy_region(region, &0usize)?;
        }
        summary
    } else {
        let data: Vec<u8> = (0..args.size).map(|i| i as u8).collect();
        engine.attach(socket)?;

        info!("starting copy transmission");
        run_sender(
            &mut engine,
            SendPlan::Copy(&data),
            duration,
            shutdown,
            |line| println!("{line}"),
        )
        .context("send loop failed")?
    };

    print_summary(
        "client",
        "Transmission Results",
        args.zerocopy,
        &summary,
        args.json,
    )
}
