//! DMA-capable memory regions for the devmem TCP data path.
//!
//! This crate owns the first link of the zero-copy chain:
//! * [`DmaRegion`] – a memfd-backed buffer registered through `/dev/udmabuf`
//!   and mapped into the process.
//! * [`RegionHandle`] – the dma-buf descriptor handed to the control plane.
//! * [`LoanTracker`] – what a region asks of the fragment bookkeeping before it
//!   agrees to be torn down.
//! * [`RegionError`] – allocation/registration/mapping failures.

mod error;
mod region;
mod udmabuf;

pub use error::{RegionBusy, RegionError, RegionResult};
pub use region::{
    page_size, DmaRegion, LoanTracker, RegionBackend, RegionConfig, RegionHandle,
};
