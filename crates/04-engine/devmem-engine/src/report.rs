use crate::TransferStats;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

const MIB: f64 = 1024.0 * 1024.0;

/// Final numbers for a finished run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GoodputReport {
    pub duration_secs: f64,
    pub total_bytes: u64,
    pub transfers: u64,
    pub fragments: u64,
    pub dma_bytes: u64,
    pub linear_bytes: u64,
    pub dma_percent: f64,
    pub linear_percent: f64,
    pub bits_per_sec: f64,
    /// Mebibits per second (bytes / T / 2^20 * 8).
    pub goodput_mbps: f64,
    pub transfer_rate: f64,
    pub average_transfer_size: f64,
}

impl GoodputReport {
    pub fn from_stats(stats: &TransferStats, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let bytes = stats.bytes as f64;
        let per_sec = |value: f64| if secs > 0.0 { value / secs } else { 0.0 };
        let percent = |part: u64| {
            if stats.bytes > 0 {
                part as f64 * 100.0 / bytes
            } else {
                0.0
            }
        };

        Self {
            duration_secs: secs,
            total_bytes: stats.bytes,
            transfers: stats.transfers,
            fragments: stats.fragments,
            dma_bytes: stats.dma_bytes,
            linear_bytes: stats.linear_bytes,
            dma_percent: percent(stats.dma_bytes),
            linear_percent: percent(stats.linear_bytes),
            bits_per_sec: per_sec(bytes * 8.0),
            goodput_mbps: per_sec(bytes) / MIB * 8.0,
            transfer_rate: per_sec(stats.transfers as f64),
            average_transfer_size: if stats.transfers > 0 {
                bytes / stats.transfers as f64
            } else {
                0.0
            },
        }
    }
}

impl fmt::Display for GoodputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Duration: {:.3} seconds", self.duration_secs)?;
        writeln!(f, "Total bytes: {} bytes", self.total_bytes)?;
        writeln!(f, "Total transfers: {}", self.transfers)?;
        if self.fragments > 0 {
            writeln!(
                f,
                "Device memory bytes: {} bytes ({:.1}%)",
                self.dma_bytes, self.dma_percent
            )?;
            writeln!(
                f,
                "Linear buffer bytes: {} bytes ({:.1}%)",
                self.linear_bytes, self.linear_percent
            )?;
        }
        writeln!(f, "Goodput: {:.2} Mbps", self.goodput_mbps)?;
        writeln!(f, "Transfer rate: {:.2} transfers/sec", self.transfer_rate)?;
        write!(f, "Average transfer size: {:.1} bytes", self.average_transfer_size)
    }
}

/// One periodic progress sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressLine {
    pub elapsed: Duration,
    pub goodput_mbps: f64,
    pub transfers: u64,
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Elapsed: {:.1}s, Goodput: {:.2} Mbps, Transfers: {}",
            self.elapsed.as_secs_f64(),
            self.goodput_mbps,
            self.transfers
        )
    }
}

/// Rate limiter for progress output: at most one line per interval.
#[derive(Clone, Copy, Debug)]
pub struct ProgressTicker {
    interval: Duration,
    started: Instant,
    last: Instant,
}

impl ProgressTicker {
    pub fn new(interval: Duration, started: Instant) -> Self {
        Self {
            interval,
            started,
            last: started,
        }
    }

    pub fn poll(&mut self, now: Instant, stats: &TransferStats) -> Option<ProgressLine> {
        if now.saturating_duration_since(self.last) < self.interval {
            return None;
        }
        self.last = now;
        let elapsed = now.saturating_duration_since(self.started);
        Some(ProgressLine {
            elapsed,
            goodput_mbps: GoodputReport::from_stats(stats, elapsed).goodput_mbps,
            transfers: stats.transfers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(bytes: u64, transfers: u64) -> TransferStats {
        TransferStats {
            bytes,
            transfers,
            ..Default::default()
        }
    }

    #[test]
    fn throughput_is_bytes_times_eight_over_time() {
        let sizes = [1000u64, 2500, 500];
        let stats = stats(sizes.iter().sum(), sizes.len() as u64);
        let report = GoodputReport::from_stats(&stats, Duration::from_secs(2));
        assert_eq!(report.bits_per_sec, 4000.0 * 8.0 / 2.0);
        assert_eq!(report.average_transfer_size, 4000.0 / 3.0);
        assert_eq!(report.transfer_rate, 1.5);
    }

    #[test]
    fn mbps_uses_mebibits() {
        let report = GoodputReport::from_stats(&stats(1 << 20, 1), Duration::from_secs(1));
        assert_eq!(report.goodput_mbps, 8.0);
    }

    #[test]
    fn zero_totals_do_not_divide_by_zero() {
        let report = GoodputReport::from_stats(&TransferStats::default(), Duration::ZERO);
        assert_eq!(report.bits_per_sec, 0.0);
        assert_eq!(report.dma_percent, 0.0);
        assert_eq!(report.average_transfer_size, 0.0);
        assert!(report.to_string().contains("Goodput: 0.00 Mbps"));
    }

    #[test]
    fn path_split_percentages() {
        let stats = TransferStats {
            bytes: 400,
            transfers: 2,
            fragments: 4,
            dma_bytes: 300,
            linear_bytes: 100,
            ..Default::default()
        };
        let report = GoodputReport::from_stats(&stats, Duration::from_secs(1));
        assert_eq!(report.dma_percent, 75.0);
        assert_eq!(report.linear_percent, 25.0);
    }

    #[test]
    fn report_serializes_as_one_json_object() {
        let report = GoodputReport::from_stats(&stats(10, 1), Duration::from_secs(1));
        let json = serde_json::to_value(report).expect("serialize");
        assert_eq!(json["total_bytes"], 10);
        assert_eq!(json["transfers"], 1);
    }

    #[test]
    fn ticker_emits_once_per_interval() {
        let start = Instant::now();
        let mut ticker = ProgressTicker::new(Duration::from_secs(1), start);
        let s = stats(1 << 20, 4);
        assert!(ticker.poll(start + Duration::from_millis(500), &s).is_none());
        let line = ticker.poll(start + Duration::from_secs(1), &s).expect("first line");
        assert_eq!(line.transfers, 4);
        assert_eq!(line.goodput_mbps, 8.0);
        assert!(ticker.poll(start + Duration::from_millis(1500), &s).is_none());
        assert!(ticker.poll(start + Duration::from_secs(2), &s).is_some());
    }
}
