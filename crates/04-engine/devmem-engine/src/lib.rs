//! Zero-copy transfer engine for device-memory TCP.
//!
//! Sends reference byte ranges of a TX-bound dma-buf; receives yield loans on
//! byte ranges of an RX-bound dma-buf. Fragment metadata travels as ancillary
//! data next to the stream ([`cmsg`]), loans are tracked by a
//! [`frag_ledger::FragmentLedger`], and counters go to a shared [`StatsSink`].

pub mod cmsg;
mod config;
mod engine;
mod error;
mod report;
mod runner;
mod socket;
mod stats;

pub use config::EngineConfig;
pub use engine::{EngineState, RxBatch, RxEvent, Teardown, TransferEngine, TxFragment};
pub use error::{EngineError, EngineResult};
pub use report::{GoodputReport, ProgressLine, ProgressTicker};
pub use runner::{run_receiver, run_sender, RecvMode, RunEnd, RunSummary, SendPlan};
pub use socket::{DevmemSocket, RecvMeta, TcpDevmemSocket};
pub use stats::{ArcStatsSink, StatsSink, TransferStats};
