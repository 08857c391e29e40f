use crate::cmsg::{cmsg_space, DMABUF_CMSG_LEN};
use std::time::Duration;

/// Buffer sizes and pacing for a transfer engine.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Sleep between attempts when the socket would block.
    pub retry_backoff: Duration,
    /// Linear iov buffer for receives; also the copy-mode receive buffer.
    pub recv_buffer_len: usize,
    /// Ancillary buffer for receive metadata.
    pub control_buffer_len: usize,
    /// Spacing between progress lines.
    pub report_interval: Duration,
}

impl EngineConfig {
    /// Fragments one receive can describe before metadata is truncated.
    pub fn max_fragments_per_recv(&self) -> usize {
        self.control_buffer_len / cmsg_space(DMABUF_CMSG_LEN)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(1),
            recv_buffer_len: 64 * 1024,
            control_buffer_len: 256 * cmsg_space(DMABUF_CMSG_LEN),
            report_interval: Duration::from_secs(1),
        }
    }
}
