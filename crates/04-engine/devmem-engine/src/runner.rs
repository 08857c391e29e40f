//! Duration-bounded transfer loops.

use crate::report::{GoodputReport, ProgressLine, ProgressTicker};
use crate::socket::DevmemSocket;
use crate::{EngineResult, RxEvent, StatsSink, TransferEngine, TransferStats, TxFragment};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Why a loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    DeadlineReached,
    EndOfStream,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunSummary {
    pub end: RunEnd,
    pub elapsed: Duration,
    pub stats: TransferStats,
}

impl RunSummary {
    pub fn report(&self) -> GoodputReport {
        GoodputReport::from_stats(&self.stats, self.elapsed)
    }
}

/// What the sender pushes on every iteration.
#[derive(Clone, Copy, Debug)]
pub enum SendPlan<'a> {
    ZeroCopy(TxFragment),
    Copy(&'a [u8]),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvMode {
    ZeroCopy,
    Copy,
}

/// Sends `plan` repeatedly until `duration` elapses or `cancel` is set, then
/// closes the engine. A raised `cancel` also cuts short a send that is
/// retrying on a full socket.
pub fn run_sender<S, T, P>(
    engine: &mut TransferEngine<S, T>,
    plan: SendPlan<'_>,
    duration: Duration,
    cancel: &Arc<AtomicBool>,
    mut progress: P,
) -> EngineResult<RunSummary>
where
    S: DevmemSocket,
    T: StatsSink,
    P: FnMut(ProgressLine),
{
    let started = Instant::now();
    let deadline = started + duration;
    engine.set_deadline(Some(deadline));
    engine.set_cancel(Some(Arc::clone(cancel)));
    let mut ticker = ProgressTicker::new(engine.config().report_interval, started);

    let end = loop {
        if cancel.load(Ordering::Relaxed) {
            break RunEnd::Cancelled;
        }
        if Instant::now() >= deadline {
            break RunEnd::DeadlineReached;
        }
        match plan {
            SendPlan::ZeroCopy(frag) => engine.send_zero_copy(&frag)?,
            SendPlan::Copy(buf) => engine.send_copy(buf)?,
        };
        if let Some(line) = ticker.poll(Instant::now(), &engine.stats().snapshot()) {
            progress(line);
        }
    };

    finish(engine, started, end)
}

/// Receives until the peer closes, `duration` elapses or `cancel` is set.
/// Every device-memory fragment is handed back as soon as it arrives, and
/// an idle wait notices `cancel` within one retry interval.
pub fn run_receiver<S, T, P>(
    engine: &mut TransferEngine<S, T>,
    mode: RecvMode,
    duration: Duration,
    cancel: &Arc<AtomicBool>,
    mut progress: P,
) -> EngineResult<RunSummary>
where
    S: DevmemSocket,
    T: StatsSink,
    P: FnMut(ProgressLine),
{
    let started = Instant::now();
    let deadline = started + duration;
    engine.set_deadline(Some(deadline));
    engine.set_cancel(Some(Arc::clone(cancel)));
    let mut ticker = ProgressTicker::new(engine.config().report_interval, started);

    let end = loop {
        if cancel.load(Ordering::Relaxed) {
            break RunEnd::Cancelled;
        }
        let event = match mode {
            RecvMode::ZeroCopy => engine.receive_zero_copy()?,
            RecvMode::Copy => engine.receive_copy()?,
        };
        match event {
            RxEvent::Delivered(batch) => engine.release(batch.loans)?,
            RxEvent::EndOfStream => break RunEnd::EndOfStream,
            RxEvent::DeadlineReached => break RunEnd::DeadlineReached,
            RxEvent::Cancelled => break RunEnd::Cancelled,
        }
        if let Some(line) = ticker.poll(Instant::now(), &engine.stats().snapshot()) {
            progress(line);
        }
    };

    finish(engine, started, end)
}

fn finish<S, T>(
    engine: &mut TransferEngine<S, T>,
    started: Instant,
    end: RunEnd,
) -> EngineResult<RunSummary>
where
    S: DevmemSocket,
    T: StatsSink,
{
    let elapsed = started.elapsed();
    engine.set_deadline(None);
    engine.set_cancel(None);
    engine.drain()?;
    let stats = engine.stats().snapshot();
    info!(?end, bytes = stats.bytes, transfers = stats.transfers, "run finished");
    Ok(RunSummary {
        end,
        elapsed,
        stats,
    })
}
