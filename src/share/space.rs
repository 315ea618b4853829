// Author: Lukas Bower
// Purpose: The caller address space as seen by the buffer sharing layer.

use crate::error::XrpError;
use crate::pool::Allocation;
use crate::registry::FileId;

/// What backs a virtual memory area.
#[derive(Debug, Clone)]
pub enum VmaKind {
    /// Mapping of a pool allocation made through a driver file.
    Driver {
        /// File the mapping was created through.
        file: FileId,
        /// Allocation the mapping keeps alive.
        allocation: Allocation,
    },
    /// Raw page-frame or I/O mapping.
    Io,
    /// Ordinary pageable memory.
    Anonymous,
}

/// One virtual memory area.
#[derive(Debug, Clone)]
pub struct Vma {
    /// First address.
    pub start: u64,
    /// One past the last address.
    pub end: u64,
    /// Backing.
    pub kind: VmaKind,
    /// Mapped cacheable, so the range needs cache maintenance.
    pub cached: bool,
}

impl Vma {
    /// Returns true when `[addr, addr + len)` lies inside this area.
    #[must_use]
    pub fn covers(&self, addr: u64, len: u64) -> bool {
        addr >= self.start && addr.checked_add(len).is_some_and(|end| end <= self.end)
    }
}

/// Memory management operations of the process a request comes from.
pub trait AddressSpace: Send + Sync {
    /// First area whose end lies above `addr`.
    fn find_vma(&self, addr: u64) -> Option<Vma>;
    /// Physical address of the page holding `addr` in an I/O area.
    fn follow_pfn(&self, addr: u64) -> Option<u64>;
    /// Pin up to `n_pages` pages starting at the page holding `addr`.
    ///
    /// Returns the physical base of every page pinned, which may be fewer
    /// than requested.
    fn pin_user_pages(&self, addr: u64, n_pages: u64) -> Vec<u64>;
    /// Drop pins taken by [`AddressSpace::pin_user_pages`].
    fn unpin_pages(&self, pages: &[u64]);
    /// Mark a pinned page as written.
    fn set_page_dirty(&self, page: u64);
    /// Copy user memory into `buf`.
    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), XrpError>;
    /// Copy `data` into user memory.
    fn copy_to_user(&self, addr: u64, data: &[u8]) -> Result<(), XrpError>;
    /// Map a pool allocation through a driver file; the area holds a reference.
    fn map_driver(&self, file: FileId, allocation: Allocation, cached: bool)
        -> Result<u64, XrpError>;
    /// Map a physical range as an I/O area.
    fn map_pfn(&self, phys: u64, size: u64, cached: bool) -> Result<u64, XrpError>;
    /// Remove the area starting at `addr`.
    fn unmap(&self, addr: u64) -> Result<(), XrpError>;
}

/// Address space of a request that only carries kernel payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUserSpace;

impl AddressSpace for NoUserSpace {
    fn find_vma(&self, _addr: u64) -> Option<Vma> {
        None
    }

    fn follow_pfn(&self, _addr: u64) -> Option<u64> {
        None
    }

    fn pin_user_pages(&self, _addr: u64, _n_pages: u64) -> Vec<u64> {
        Vec::new()
    }

    fn unpin_pages(&self, _pages: &[u64]) {}

    fn set_page_dirty(&self, _page: u64) {}

    fn copy_from_user(&self, addr: u64, _buf: &mut [u8]) -> Result<(), XrpError> {
        Err(XrpError::Fault { addr })
    }

    fn copy_to_user(&self, addr: u64, _data: &[u8]) -> Result<(), XrpError> {
        Err(XrpError::Fault { addr })
    }

    fn map_driver(
        &self,
        _file: FileId,
        _allocation: Allocation,
        _cached: bool,
    ) -> Result<u64, XrpError> {
        Err(XrpError::Fault { addr: 0 })
    }

    fn map_pfn(&self, phys: u64, _size: u64, _cached: bool) -> Result<u64, XrpError> {
        Err(XrpError::Fault { addr: phys })
    }

    fn unmap(&self, addr: u64) -> Result<(), XrpError> {
        Err(XrpError::Fault { addr })
    }
}
