//! Error surface for region creation and teardown.
//!
//! Every creation failure is fatal to that attempt; callers abort rather than
//! retry. Teardown has a single refusal: the region still has fragments on
//! loan.

use std::io;
use thiserror::Error;

use crate::DmaRegion;

/// Convenience result alias for fallible region operations.
pub type RegionResult<T, E = RegionError> = Result<T, E>;

/// Errors surfaced while creating or accessing a [`DmaRegion`].
#[derive(Debug, Error)]
pub enum RegionError {
    /// Requested length is zero or not a multiple of the page size.
    #[error("region length {requested} must be a positive multiple of the {page_size}-byte page")]
    InvalidLength { requested: usize, page_size: usize },

    /// The backing memfd could not be created or sized.
    #[error("failed to allocate {len} bytes of backing memory: {source}")]
    Allocation {
        len: usize,
        #[source]
        source: io::Error,
    },

    /// The kernel refused to turn the memfd into a dma-buf.
    #[error("dma-buf registration rejected: {source}")]
    Registration {
        #[source]
        source: io::Error,
    },

    /// The dma-buf exists but could not be mapped into the process.
    #[error("failed to map {len}-byte region: {source}")]
    Mapping {
        len: usize,
        #[source]
        source: io::Error,
    },

    /// A byte range fell outside the region.
    #[error("range {offset}+{len} exceeds region of {region_len} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },
}

/// Returned by [`DmaRegion::destroy`] when fragments are still on loan.
///
/// The region travels back to the caller untouched so it can drain and retry.
#[derive(Debug, Error)]
#[error("region {handle} still has {outstanding} outstanding fragments", handle = .region.handle())]
pub struct RegionBusy {
    pub region: DmaRegion,
    pub outstanding: usize,
}
