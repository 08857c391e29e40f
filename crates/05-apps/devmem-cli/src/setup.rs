use anyhow::{Context, Result};
use dmabuf::{page_size, DmaRegion, LoanTracker, RegionConfig};
use netdev_bind::{
    resolve_interface, BindState, BinderConfig, Binding, NetlinkSocket, QueueBinder,
};
use tracing::{info, warn};

/// Parses sizes such as `16777216`, `16M`, `16MiB` or `4k`.
pub fn parse_size(raw: &str) -> Result<usize, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    let value: usize = digits
        .parse()
        .map_err(|_| format!("invalid size {raw:?}"))?;
    let shift = match suffix.to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        _ => return Err(format!("unknown size suffix {suffix:?}")),
    };
    value
        .checked_mul(1usize << shift)
        .filter(|&size| size > 0)
        .ok_or_else(|| format!("size {raw:?} out of range"))
}

/// Rounds `len` up to a whole number of pages.
pub fn page_aligned(len: usize) -> usize {
    len.div_ceil(page_size()) * page_size()
}

pub fn open_binder() -> Result<QueueBinder> {
    let mut channel = NetlinkSocket::open().context("opening generic netlink socket")?;
    QueueBinder::resolve(&mut channel, BinderConfig::default())
        .context("resolving the netdev genl family")
}

/// Creates an RX region of `size` bytes and binds it to `queue` of `ifname`.
pub fn bind_rx_region(
    binder: &mut QueueBinder,
    ifname: &str,
    queue: u32,
    size: usize,
) -> Result<(DmaRegion, Binding<NetlinkSocket>)> {
    let ifindex = resolve_interface(ifname)?;
    let region = DmaRegion::create(size, RegionConfig::default())
        .with_context(|| format!("creating {size}-byte RX region"))?;
    let channel = NetlinkSocket::open().context("opening RX bind channel")?;
    let binding = binder
        .bind_rx(channel, ifindex, queue, region.handle())
        .with_context(|| format!("binding RX region to {ifname} queue {queue}"))?;
    log_binding("rx", &binding);
    Ok((region, binding))
}

/// Creates a TX region of `size` bytes, fills it with the test pattern and
/// binds it to `ifname`.
pub fn bind_tx_region(
    binder: &mut QueueBinder,
    ifname: &str,
    size: usize,
) -> Result<(DmaRegion, Binding<NetlinkSocket>)> {
    let ifindex = resolve_interface(ifname)?;
    let mut region = DmaRegion::create(size, RegionConfig::default())
        .with_context(|| format!("creating {size}-byte TX region"))?;
    region
        .fill_test_pattern()
        .context("filling TX region with the test pattern")?;
    let channel = NetlinkSocket::open().context("opening TX bind channel")?;
    let binding = binder
        .bind_tx(channel, ifindex, region.handle())
        .with_context(|| format!("binding TX region to {ifname}"))?;
    log_binding("tx", &binding);
    Ok((region, binding))
}

fn log_binding(direction: &str, binding: &Binding<NetlinkSocket>) {
    match binding.state() {
        BindState::Confirmed { dmabuf_id } => info!(direction, dmabuf_id, "region bound"),
        BindState::Unconfirmed => warn!(
            direction,
            "bind not acknowledged yet; the first transfer will confirm it"
        ),
    }
}

/// Destroys `region` once nothing in `loans` still references it.
pub fn destroy_region<L: LoanTracker + ?Sized>(region: DmaRegion, loans: &L) -> Result<()> {
    let handle = region.handle();
    region
        .destroy(loans)
        .with_context(|| format!("destroying region {handle}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_accept_plain_and_binary_suffixes() {
        assert_eq!(parse_size("1048576"), Ok(1 << 20));
        assert_eq!(parse_size("16M"), Ok(16 << 20));
        assert_eq!(parse_size("16MiB"), Ok(16 << 20));
        assert_eq!(parse_size("4k"), Ok(4096));
    }

    #[test]
    fn sizes_reject_junk_and_zero() {
        assert!(parse_size("").is_err());
        assert!(parse_size("0").is_err());
        assert!(parse_size("12parsecs").is_err());
        assert!(parse_size("M").is_err());
    }

    #[test]
    fn page_alignment_rounds_up() {
        let page = page_size();
        assert_eq!(page_aligned(1), page);
        assert_eq!(page_aligned(page), page);
        assert_eq!(page_aligned(page + 1), 2 * page);
    }
}
