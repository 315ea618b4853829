// Author: Lukas Bower
// Purpose: Physical allocation pools and the reference-counted allocation handle.

//! Physical memory allocation.
//!
//! A [`MemoryPool`] fronts one private [`FreeListPool`] and falls back to a
//! [`PageProvider`] when the carve-out is exhausted. Every successful
//! allocation is an [`Allocation`]: a shared handle whose last drop returns
//! the block to the pool that produced it.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

use crate::hal::{align_up, PageProvider, PAGE_SIZE};

mod freelist;
mod pages;

pub use freelist::FreeListPool;
pub use pages::PagePool;

/// Allocation failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Zero-sized request.
    #[error("zero-sized allocation")]
    InvalidSize,
    /// Alignment is not a power of two.
    #[error("alignment {0:#x} is not a power of two")]
    InvalidAlignment(u64),
    /// Nothing could satisfy the request.
    #[error("out of memory for {size:#x} bytes")]
    OutOfMemory {
        /// Rounded request size.
        size: u64,
    },
}

/// A source of physical blocks.
pub trait Pool: Send + Sync + fmt::Debug {
    /// Carve `size` bytes aligned to `align`; both are already page rounded.
    fn alloc(&self, size: u64, align: u64) -> Result<u64, PoolError>;
    /// Return a block produced by [`Pool::alloc`].
    fn free(&self, start: u64, size: u64);
    /// Tear the pool down once no allocation refers to it.
    fn free_pool(&self) {}
    /// Offset used when the block is mapped into user space.
    fn offset(&self, start: u64) -> u64 {
        start
    }
}

struct Block {
    start: u64,
    size: u64,
    pool: Arc<dyn Pool>,
}

impl Drop for Block {
    fn drop(&mut self) {
        debug!(
            target: "xrp-pool",
            "[pool] release {start:#x}+{size:#x}",
            start = self.start,
            size = self.size
        );
        self.pool.free(self.start, self.size);
    }
}

/// Shared handle to a physical block.
///
/// Cloning takes another reference; the block returns to its pool when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Allocation(Arc<Block>);

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("start", &format_args!("{:#x}", self.0.start))
            .field("size", &format_args!("{:#x}", self.0.size))
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl PartialEq for Allocation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Allocation {}

impl Allocation {
    pub(crate) fn new(start: u64, size: u64, pool: Arc<dyn Pool>) -> Self {
        Self(Arc::new(Block { start, size, pool }))
    }

    /// Physical base.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.0.start
    }

    /// Size in bytes, page rounded.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.0.size
    }

    /// One past the last byte.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.0.start + self.0.size
    }

    /// Offset to pass when mapping the block into user space.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.0.pool.offset(self.0.start)
    }

    /// Live handles to this block.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Give up this handle without ever returning the block.
    ///
    /// Used when the DSP may still be accessing the memory.
    pub fn leak(self) {
        warn!(
            target: "xrp-pool",
            "[pool] leaking {start:#x}+{size:#x}",
            start = self.start(),
            size = self.size()
        );
        std::mem::forget(self);
    }
}

/// Allocation front end: private pool first, page provider second.
#[derive(Clone, Default)]
pub struct MemoryPool {
    primary: Option<Arc<FreeListPool>>,
    pages: Option<Arc<dyn PageProvider>>,
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("primary", &self.primary)
            .field("page_fallback", &self.pages.is_some())
            .finish()
    }
}

impl MemoryPool {
    /// Build from an optional carve-out and an optional page provider.
    #[must_use]
    pub fn new(primary: Option<Arc<FreeListPool>>, pages: Option<Arc<dyn PageProvider>>) -> Self {
        Self { primary, pages }
    }

    /// The private free-list pool, if configured.
    #[must_use]
    pub fn primary(&self) -> Option<&Arc<FreeListPool>> {
        self.primary.as_ref()
    }

    /// Allocate `size` bytes aligned to `align`; `align == 0` means 1.
    pub fn allocate(&self, size: u64, align: u64) -> Result<Allocation, PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }
        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(PoolError::InvalidAlignment(align));
        }
        let size = align_up(size, PAGE_SIZE);
        let align = align_up(align, PAGE_SIZE);

        if let Some(primary) = &self.primary {
            match primary.alloc(size, align) {
                Ok(start) => {
                    let pool: Arc<dyn Pool> = primary.clone();
                    return Ok(Allocation::new(start, size, pool));
                }
                Err(PoolError::OutOfMemory { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        match &self.pages {
            Some(pages) => pages::allocate_from_pages(pages, size, align),
            None => {
                debug!(target: "xrp-pool", "[pool] exhausted for {size:#x} bytes");
                Err(PoolError::OutOfMemory { size })
            }
        }
    }
}
