use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Monotonic transfer counters.
///
/// A transfer is one accepted send or receive call as the application sees
/// it: a send completed over several partial writes still counts once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub bytes: u64,
    pub transfers: u64,
    pub fragments: u64,
    pub dma_bytes: u64,
    pub dma_fragments: u64,
    pub linear_bytes: u64,
    pub linear_fragments: u64,
    pub would_block: u64,
}

/// Shared handle the engine writes counters through.
pub trait StatsSink: Clone + Send + 'static {
    fn with_stats<R>(&self, f: impl FnOnce(&mut TransferStats) -> R) -> R;

    fn snapshot(&self) -> TransferStats {
        self.with_stats(|stats| *stats)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ArcStatsSink(pub Arc<Mutex<TransferStats>>);

impl ArcStatsSink {
    pub fn new(stats: Arc<Mutex<TransferStats>>) -> Self {
        Self(stats)
    }
}

impl StatsSink for ArcStatsSink {
    fn with_stats<R>(&self, f: impl FnOnce(&mut TransferStats) -> R) -> R {
        let mut guard = self.0.lock();
        f(&mut guard)
    }
}

impl StatsSink for Arc<Mutex<TransferStats>> {
    fn with_stats<R>(&self, f: impl FnOnce(&mut TransferStats) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }
}
