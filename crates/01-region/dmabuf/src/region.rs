//! Memory mapping helpers for dma-buf regions.
//!
//! A region starts life as an anonymous memfd. On the `Udmabuf` backend the
//! memfd is handed to `/dev/udmabuf`, which returns a dma-buf descriptor that a
//! NIC queue can be bound to; that descriptor is what we map. The `Anonymous`
//! backend skips registration and maps the memfd directly, which is enough for
//! simulated transfers and tests. Either way the unsafe surface stays inside
//! this module.

use crate::error::RegionBusy;
use crate::udmabuf;
use crate::{RegionError, RegionResult};
use memmap2::{MmapMut, MmapOptions};
use std::fmt;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, info};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Returns the system page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

/// Selects how a [`DmaRegion`] is backed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RegionBackend {
    /// memfd registered through `/dev/udmabuf`; bindable to a NIC queue.
    #[default]
    Udmabuf,
    /// Plain memfd mapping with no kernel registration.
    Anonymous,
}

/// Creation parameters for [`DmaRegion::create`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RegionConfig {
    pub backend: RegionBackend,
}

/// Opaque identifier naming a region in control-plane messages.
///
/// This is the descriptor of the mapped dma-buf; it is only meaningful while
/// the owning [`DmaRegion`] is alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionHandle(RawFd);

impl RegionHandle {
    pub fn raw_fd(self) -> RawFd {
        self.0
    }
}

impl fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Reports how many fragments of a region are still on loan to the kernel.
pub trait LoanTracker {
    fn outstanding(&self) -> usize;
}

impl LoanTracker for usize {
    fn outstanding(&self) -> usize {
        *self
    }
}

/// A mapped, DMA-capable buffer.
///
/// Dropping a region unmaps it unconditionally, which mirrors what process
/// exit does. Orderly shutdown goes through [`DmaRegion::destroy`], which
/// refuses while fragments are outstanding.
pub struct DmaRegion {
    len: usize,
    backend: RegionBackend,
    map: MmapMut,
    file: File,
}

impl DmaRegion {
    /// Allocates, registers and maps a region of `len` bytes.
    pub fn create(len: usize, config: RegionConfig) -> RegionResult<Self> {
        let page_size = page_size();
        if len == 0 || len % page_size != 0 {
            return Err(RegionError::InvalidLength {
                requested: len,
                page_size,
            });
        }

        let memfd = udmabuf::create_memfd(c"devmem_region", len)?;
        let file = match config.backend {
            RegionBackend::Udmabuf => udmabuf::register(&memfd, len)?,
            RegionBackend::Anonymous => memfd,
        };

        // SAFETY: the descriptor is exclusively ours and sized to `len`; the
        // mapping is dropped before `file` because of field order.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|source| RegionError::Mapping { len, source })?;

        info!(
            len,
            backend = ?config.backend,
            fd = file.as_raw_fd(),
            "dma region created"
        );

        Ok(Self {
            len,
            backend: config.backend,
            map,
            file,
        })
    }

    /// Total number of bytes in the region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Regions are never empty; kept for clippy parity with `len`.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn backend(&self) -> RegionBackend {
        self.backend
    }

    /// Handle used when binding the region to a queue.
    pub fn handle(&self) -> RegionHandle {
        RegionHandle(self.file.as_raw_fd())
    }

    /// Base address of the mapping inside this process.
    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    /// View the full region as an immutable slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// View the full region as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> RegionResult<&[u8]> {
        let end = self.checked_end(offset, len)?;
        Ok(&self.map[offset..end])
    }

    /// Mutably borrow `len` bytes starting at `offset`.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> RegionResult<&mut [u8]> {
        let end = self.checked_end(offset, len)?;
        Ok(&mut self.map[offset..end])
    }

    fn checked_end(&self, offset: usize, len: usize) -> RegionResult<usize> {
        offset
            .checked_add(len)
            .filter(|end| *end <= self.len)
            .ok_or(RegionError::OutOfBounds {
                offset,
                len,
                region_len: self.len,
            })
    }

    /// Writes `byte[i] = i mod 256` over the whole region and flushes it so
    /// DMA readers observe the pattern.
    pub fn fill_test_pattern(&mut self) -> std::io::Result<()> {
        for (i, byte) in self.map.iter_mut().enumerate() {
            *byte = i as u8;
        }
        self.map.flush()?;
        debug!(len = self.len, "test pattern written");
        Ok(())
    }

    /// Unmaps and closes the region once nothing is on loan.
    pub fn destroy<L: LoanTracker + ?Sized>(self, loans: &L) -> Result<(), RegionBusy> {
        let outstanding = loans.outstanding();
        if outstanding > 0 {
            return Err(RegionBusy {
                region: self,
                outstanding,
            });
        }
        info!(handle = %self.handle(), len = self.len, "dma region destroyed");
        drop(self);
        Ok(())
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("len", &self.len)
            .field("backend", &self.backend)
            .field("handle", &self.handle())
            .field("base", &self.map.as_ptr())
            .finish()
    }
}
