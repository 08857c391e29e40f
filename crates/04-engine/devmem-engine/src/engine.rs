use crate::cmsg::{self, Delivery};
use crate::socket::DevmemSocket;
use crate::{EngineConfig, EngineError, EngineResult, StatsSink};
use dmabuf::{DmaRegion, RegionResult};
use frag_ledger::{FragmentLedger, FragmentLoan};
use netdev_bind::{Binding, ControlChannel};
use smallvec::SmallVec;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Connected,
    Transferring,
    /// Close requested with loans outstanding; only releases are accepted.
    Draining,
    Closed,
}

/// A byte range of the TX region to send by reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxFragment {
    pub dmabuf_id: u32,
    pub offset: u64,
    pub len: usize,
}

impl TxFragment {
    /// Checks that `offset..offset + len` lies inside `region`.
    pub fn within(
        region: &DmaRegion,
        dmabuf_id: u32,
        offset: usize,
        len: usize,
    ) -> RegionResult<Self> {
        region.slice(offset, len)?;
        Ok(Self {
            dmabuf_id,
            offset: offset as u64,
            len,
        })
    }
}

/// Fragments produced by one receive.
#[derive(Debug, Default)]
pub struct RxBatch {
    /// Payload bytes across both paths.
    pub bytes: usize,
    /// Device-memory fragments, each on loan until released.
    pub loans: SmallVec<[FragmentLoan; 8]>,
    /// Bytes copied into the linear buffer, readable via
    /// [`TransferEngine::linear_payload`] until the next receive.
    pub linear_bytes: usize,
    pub linear_fragments: usize,
}

/// Outcome of a receive attempt.
#[derive(Debug)]
pub enum RxEvent {
    Delivered(RxBatch),
    /// The peer shut down in an orderly way.
    EndOfStream,
    DeadlineReached,
    /// The cancel flag was raised while waiting for data.
    Cancelled,
}

/// Something torn down when the engine closes or fails.
pub trait Teardown {
    fn teardown(&mut self);
}

impl<C: ControlChannel> Teardown for Binding<C> {
    fn teardown(&mut self) {
        self.unbind();
    }
}

/// Drives one connection through sends and receives.
///
/// The engine owns the socket, the fragment ledger and any bindings handed
/// to it. Fatal errors release every outstanding fragment and tear down
/// bindings before they are returned.
pub struct TransferEngine<S, T> {
    config: EngineConfig,
    state: EngineState,
    socket: Option<S>,
    ledger: FragmentLedger,
    stats: T,
    bindings: Vec<Box<dyn Teardown>>,
    deadline: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
    linear: Vec<u8>,
    control: Vec<u8>,
}

impl<S, T> TransferEngine<S, T>
where
    S: DevmemSocket,
    T: StatsSink,
{
    pub fn new(config: EngineConfig, stats: T) -> Self {
        Self {
            linear: vec![0; config.recv_buffer_len],
            control: vec![0; config.control_buffer_len],
            config,
            state: EngineState::Idle,
            socket: None,
            ledger: FragmentLedger::new(),
            stats,
            bindings: Vec::new(),
            deadline: None,
            cancel: None,
        }
    }

    /// Hands the engine a connected socket.
    pub fn attach(&mut self, socket: S) -> EngineResult<()> {
        if self.state != EngineState::Idle {
            return Err(EngineError::Closing(self.state));
        }
        self.socket = Some(socket);
        self.transition(EngineState::Connected);
        Ok(())
    }

    /// Keeps `binding` alive for the connection and tears it down on close.
    pub fn hold_binding(&mut self, binding: impl Teardown + 'static) {
        self.bindings.push(Box::new(binding));
    }

    /// Transfers stop retrying once `deadline` passes.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Transfers stop retrying once `cancel` is raised.
    pub fn set_cancel(&mut self, cancel: Option<Arc<AtomicBool>>) {
        self.cancel = cancel;
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &FragmentLedger {
        &self.ledger
    }

    pub fn stats(&self) -> &T {
        &self.stats
    }

    pub fn socket(&self) -> Option<&S> {
        self.socket.as_ref()
    }

    /// Linear bytes from the most recent receive.
    pub fn linear_payload(&self, batch: &RxBatch) -> &[u8] {
        &self.linear[..batch.linear_bytes.min(self.linear.len())]
    }

    /// Sends `frag` from the TX region without copying.
    ///
    /// Partial sends continue with the remainder; the whole call counts as one
    /// transfer. Returns the bytes accepted, which is short of `frag.len` only
    /// when the deadline passed or the cancel flag was raised first.
    pub fn send_zero_copy(&mut self, frag: &TxFragment) -> EngineResult<usize> {
        let control = cmsg::encode_tx_dmabuf(frag.dmabuf_id);
        let mut offset = frag.offset;
        self.send_loop(frag.len, |socket, sent, remaining| {
            let n = socket.send_devmem(&control, offset, remaining)?;
            offset += n as u64;
            trace!(sent, n, "zero-copy send progress");
            Ok(n)
        })
    }

    /// Conventional send of `buf`, with the same retry and accounting rules.
    pub fn send_copy(&mut self, buf: &[u8]) -> EngineResult<usize> {
        self.send_loop(buf.len(), |socket, sent, _| socket.send_bytes(&buf[sent..]))
    }

    fn send_loop<F>(&mut self, len: usize, mut attempt: F) -> EngineResult<usize>
    where
        F: FnMut(&mut S, usize, usize) -> io::Result<usize>,
    {
        self.ensure_open()?;
        let mut sent = 0usize;
        let mut would_block = 0u64;

        while sent < len {
            if self.deadline_passed() || self.cancelled() {
                break;
            }
            let socket = self.socket.as_mut().ok_or(EngineError::NotConnected)?;
            match attempt(socket, sent, len - sent) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes");
                    return Err(self.fail(err.into()));
                }
                Ok(n) => sent += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    would_block += 1;
                    thread::sleep(self.config.retry_backoff);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(self.fail(err.into())),
            }
        }

        self.stats.with_stats(|stats| {
            stats.would_block += would_block;
            if sent > 0 {
                stats.bytes += sent as u64;
                stats.transfers += 1;
                stats.fragments += 1;
            }
        });
        Ok(sent)
    }

    /// One receive through the devmem path.
    ///
    /// Every device-memory fragment is recorded in the ledger and handed out
    /// as a loan. Would-block is retried until data, end of stream, the
    /// deadline or cancellation.
    pub fn receive_zero_copy(&mut self) -> EngineResult<RxEvent> {
        self.ensure_open()?;
        let mut would_block = 0u64;
        let meta = loop {
            if self.deadline_passed() {
                self.stats.with_stats(|stats| stats.would_block += would_block);
                return Ok(RxEvent::DeadlineReached);
            }
            if self.cancelled() {
                self.stats.with_stats(|stats| stats.would_block += would_block);
                return Ok(RxEvent::Cancelled);
            }
            let socket = self.socket.as_mut().ok_or(EngineError::NotConnected)?;
            match socket.recv_devmem(&mut self.linear, &mut self.control) {
                Ok(meta) => break meta,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    would_block += 1;
                    thread::sleep(self.config.retry_backoff);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(self.fail(err.into())),
            }
        };
        self.stats.with_stats(|stats| stats.would_block += would_block);

        if meta.bytes == 0 {
            info!("peer closed the stream");
            return Ok(RxEvent::EndOfStream);
        }
        if meta.truncated {
            let capacity = self.control.len();
            return Err(self.fail(EngineError::ControlTruncated { capacity }));
        }

        let control_len = meta.control_len.min(self.control.len());
        let deliveries = match cmsg::parse_rx(&self.control[..control_len]) {
            Ok(deliveries) => deliveries,
            Err(err) => return Err(self.fail(err)),
        };

        let mut batch = RxBatch {
            bytes: meta.bytes,
            ..RxBatch::default()
        };
        let mut dma_bytes = 0u64;
        for (idx, delivery) in deliveries.iter().enumerate() {
            match *delivery {
                Delivery::Dma(frag) => {
                    debug!(token = frag.token, offset = frag.offset, len = frag.len, "dma fragment");
                    dma_bytes += u64::from(frag.len);
                    match self.ledger.record_fragment(frag) {
                        Ok(loan) => batch.loans.push(loan),
                        // Loans already in `batch` are in the ledger; fail() releases them.
                        Err(err) => {
                            self.release_unrecorded(&deliveries[idx + 1..]);
                            return Err(self.fail(err.into()));
                        }
                    }
                }
                Delivery::Linear { len } => {
                    debug!(len, "linear fragment");
                    batch.linear_bytes += len as usize;
                    batch.linear_fragments += 1;
                }
            }
        }

        let dma_fragments = batch.loans.len() as u64;
        let linear_fragments = batch.linear_fragments as u64;
        let linear_bytes = batch.linear_bytes as u64;
        self.stats.with_stats(|stats| {
            stats.bytes += meta.bytes as u64;
            stats.transfers += 1;
            stats.fragments += dma_fragments + linear_fragments;
            stats.dma_bytes += dma_bytes;
            stats.dma_fragments += dma_fragments;
            stats.linear_bytes += linear_bytes;
            stats.linear_fragments += linear_fragments;
        });
        Ok(RxEvent::Delivered(batch))
    }

    /// Conventional receive into the engine's linear buffer.
    pub fn receive_copy(&mut self) -> EngineResult<RxEvent> {
        self.ensure_open()?;
        let mut would_block = 0u64;
        let received = loop {
            if self.deadline_passed() {
                self.stats.with_stats(|stats| stats.would_block += would_block);
                return Ok(RxEvent::DeadlineReached);
            }
            if self.cancelled() {
                self.stats.with_stats(|stats| stats.would_block += would_block);
                return Ok(RxEvent::Cancelled);
            }
            let socket = self.socket.as_mut().ok_or(EngineError::NotConnected)?;
            match socket.recv_bytes(&mut self.linear) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    would_block += 1;
                    thread::sleep(self.config.retry_backoff);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(self.fail(err.into())),
            }
        };
        self.stats.with_stats(|stats| {
            stats.would_block += would_block;
            if received > 0 {
                stats.bytes += received as u64;
                stats.transfers += 1;
            }
        });

        if received == 0 {
            info!("peer closed the stream");
            return Ok(RxEvent::EndOfStream);
        }
        Ok(RxEvent::Delivered(RxBatch {
            bytes: received,
            linear_bytes: received,
            ..RxBatch::default()
        }))
    }

    /// Hands loans back to the kernel. Allowed while draining; the last
    /// release of a drain closes the engine.
    pub fn release<I>(&mut self, loans: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = FragmentLoan>,
    {
        let socket = self.socket.as_mut().ok_or(EngineError::NotConnected)?;
        if let Err(err) = self.ledger.release_loans(socket, loans) {
            return Err(self.fail(err.into()));
        }
        if self.state == EngineState::Draining && self.ledger.outstanding_count() == 0 {
            self.close();
        }
        Ok(())
    }

    /// Stops new transfers. Closes at once when nothing is on loan, otherwise
    /// enters [`EngineState::Draining`].
    pub fn begin_close(&mut self) -> EngineState {
        match self.state {
            EngineState::Closed | EngineState::Draining => {}
            _ if self.ledger.outstanding_count() > 0 => {
                info!(
                    outstanding = self.ledger.outstanding_count(),
                    "draining outstanding fragments"
                );
                self.transition(EngineState::Draining);
            }
            _ => self.close(),
        }
        self.state
    }

    /// Forces a drain by releasing every outstanding fragment, then closes.
    pub fn drain(&mut self) -> EngineResult<()> {
        if self.state == EngineState::Closed {
            return Ok(());
        }
        if self.state != EngineState::Draining {
            self.begin_close();
        }
        if self.state == EngineState::Draining {
            let socket = self.socket.as_mut().ok_or(EngineError::NotConnected)?;
            let released = match self.ledger.release_all(socket) {
                Ok(released) => released,
                Err(err) => return Err(self.fail(err.into())),
            };
            debug!(released, "drained ledger");
            self.close();
        }
        Ok(())
    }

    /// Hands back fragments of an abandoned batch that never reached the
    /// ledger. Tokens the ledger already holds are left to `fail()`.
    fn release_unrecorded(&mut self, rest: &[Delivery]) {
        let mut tokens: Vec<u32> = rest
            .iter()
            .filter_map(|delivery| match delivery {
                Delivery::Dma(frag) if !self.ledger.is_live(frag.token) => Some(frag.token),
                _ => None,
            })
            .collect();
        tokens.sort_unstable();
        tokens.dedup();
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        if tokens.is_empty() {
            return;
        }
        let requested = tokens.len();
        match frag_ledger::release_untracked(socket, &mut tokens) {
            Ok(freed) if freed < requested => {
                warn!(requested, freed, "kernel freed fewer abandoned fragments than requested")
            }
            Ok(_) => debug!(requested, "released abandoned fragments"),
            Err(err) => warn!(error = %err, "releasing abandoned fragments"),
        }
    }

    fn ensure_open(&mut self) -> EngineResult<()> {
        match self.state {
            EngineState::Connected => {
                self.transition(EngineState::Transferring);
                Ok(())
            }
            EngineState::Transferring => Ok(()),
            EngineState::Idle => Err(EngineError::NotConnected),
            state @ (EngineState::Draining | EngineState::Closed) => Err(EngineError::Closing(state)),
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|cancel| cancel.load(Ordering::Relaxed))
    }

    fn transition(&mut self, next: EngineState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "engine state");
            self.state = next;
        }
    }

    fn close(&mut self) {
        for binding in &mut self.bindings {
            binding.teardown();
        }
        if let Some(socket) = self.socket.as_mut() {
            if let Err(err) = socket.shutdown() {
                debug!(%err, "socket shutdown");
            }
        }
        self.transition(EngineState::Closed);
    }

    /// Fatal path: give back every fragment, unbind, close.
    fn fail(&mut self, err: EngineError) -> EngineError {
        warn!(error = %err, outstanding = self.ledger.outstanding_count(), "transfer failed");
        if let Some(socket) = self.socket.as_mut() {
            if self.ledger.outstanding_count() > 0 {
                if let Err(release_err) = self.ledger.release_all(socket) {
                    warn!(error = %release_err, "releasing fragments after failure");
                }
            }
        }
        self.close();
        err
    }
}

impl<S, T> Drop for TransferEngine<S, T> {
    fn drop(&mut self) {
        if self.ledger.outstanding_count() > 0 {
            warn!(
                outstanding = self.ledger.outstanding_count(),
                "engine dropped with fragments on loan"
            );
        }
    }
}
