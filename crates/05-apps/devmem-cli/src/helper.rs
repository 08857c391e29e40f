use crate::setup::{bind_rx_region, bind_tx_region, destroy_region, open_binder, parse_size};
use anyhow::{bail, Context, Result};
use clap::Args;
use std::io::BufRead;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct HelperArgs {
    /// Network interface to bind
    #[arg(default_value = "eth1")]
    ifname: String,

    /// RX queue index
    #[arg(default_value_t = 15)]
    queue: u32,

    /// Size of each region (bytes, or with K/M/G suffix)
    #[arg(default_value = "16MiB", value_parser = parse_size)]
    size: usize,
}

pub fn run(args: HelperArgs) -> Result<()> {
    let HelperArgs { ifname, queue, size } = args;
    println!("Interface: {ifname}");
    println!("RX queue: {queue}");
    println!("Region size: {size} bytes");

    let mut binder = open_binder()?;
    let rx = keep_if_bound("RX", bind_rx_region(&mut binder, &ifname, queue, size));
    let tx = keep_if_bound("TX", bind_tx_region(&mut binder, &ifname, size));
    if rx.is_none() && tx.is_none() {
        bail!("neither the RX nor the TX region could be bound on {ifname}");
    }

    for (label, bound) in [("RX", &rx), ("TX", &tx)] {
        let Some((region, binding)) = bound else {
            println!("{label} region: not bound");
            continue;
        };
        println!(
            "{label} region: {} ({} bytes, {:?} backend), binding {:?}",
            region.handle(),
            region.len(),
            region.backend(),
            binding.state()
        );
    }

    println!("Regions are bound. Press Enter to release them.");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("waiting for Enter")?;

    for (region, mut binding) in [rx, tx].into_iter().flatten() {
        binding.unbind();
        destroy_region(region, &0usize)?;
    }
    info!("helper released all regions");
    Ok(())
}

/// A failed direction is reported and skipped so the other can still be held.
fn keep_if_bound<T>(label: &str, bound: Result<T>) -> Option<T> {
    match bound {
        Ok(bound) => Some(bound),
        Err(err) => {
            warn!(direction = label, error = ?err, "bind failed; continuing without it");
            None
        }
    }
}
