// Author: Lukas Bower
// Purpose: Hardware seams consumed by the driver core.

//! Hardware abstraction layer.
//!
//! Everything the driver needs from the platform is expressed as a trait
//! here: the page allocator behind the pool fallback, cache maintenance, the
//! DSP control registers and doorbells. [`phys`] provides the physical memory
//! model the rest of the crate reads and writes through.

use thiserror::Error;

pub mod cache;
pub mod phys;
pub mod simple;

pub use cache::{sync_for_cpu, sync_for_device};
pub use phys::{IoRegion, PhysMemory};
pub use simple::SimpleHw;

/// Host page size.
pub const PAGE_SIZE: u64 = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Round `value` down to a multiple of the power-of-two `align`.
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Round `value` up to a multiple of the power-of-two `align`.
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    value.saturating_add(align - 1) & !(align - 1)
}

/// Number of pages touched by `[vaddr, vaddr + size)`.
#[must_use]
pub const fn pages_spanned(vaddr: u64, size: u64) -> u64 {
    (align_up(vaddr + size, PAGE_SIZE) - align_down(vaddr, PAGE_SIZE)) >> PAGE_SHIFT
}

/// Errors raised by hardware and physical memory access.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HalError {
    /// The range is not backed by any physical region.
    #[error("physical range {addr:#x}+{len:#x} is not backed")]
    Unbacked {
        /// Start of the access.
        addr: u64,
        /// Length of the access.
        len: u64,
    },
    /// Word access at an address that is not 4-byte aligned.
    #[error("misaligned word access at {0:#x}")]
    Misaligned(u64),
    /// A new region would overlap an existing one.
    #[error("region {base:#x}+{size:#x} overlaps existing memory")]
    Overlap {
        /// Base of the rejected region.
        base: u64,
        /// Size of the rejected region.
        size: u64,
    },
    /// A platform operation reported failure.
    #[error("hardware operation {0} failed")]
    Operation(&'static str),
}

/// Physically contiguous page allocator used when the pool is exhausted.
pub trait PageProvider: Send + Sync {
    /// Allocate `1 << order` contiguous pages, returning their physical base.
    fn alloc_pages(&self, order: u32) -> Option<u64>;
    /// Return pages obtained from [`PageProvider::alloc_pages`].
    fn free_pages(&self, phys: u64, order: u32);
    /// Orders at or above this value are never satisfied.
    fn max_order(&self) -> u32;
}

/// Cache maintenance primitives for memory shared with the DSP.
pub trait CacheOps: Send + Sync {
    /// Write dirty lines of the range back to memory.
    fn clean(&self, phys: u64, len: u64);
    /// Discard cached lines of the range.
    fn invalidate(&self, phys: u64, len: u64);
    /// Returns true when maintenance on the range can be performed.
    fn cacheable(&self, phys: u64, len: u64) -> bool;
}

/// Control surface of one DSP core.
///
/// Every method has a no-op default so platforms only implement what their
/// integration actually wires up.
pub trait DspHardware: Send + Sync {
    /// Power and clock the core.
    fn enable(&self) -> Result<(), HalError> {
        Ok(())
    }
    /// Remove power and clocks.
    fn disable(&self) {}
    /// Stall the core.
    fn halt(&self) {}
    /// Let the core run.
    fn release(&self) {}
    /// Pulse the core reset.
    fn reset(&self) {}
    /// Program the address the core starts from after reset.
    fn set_reset_vector(&self, _addr: u32) {}
    /// Ring the device doorbell.
    fn send_irq(&self) {}
    /// Acknowledge the host interrupt.
    fn ack_irq(&self) {}
    /// Returns true when the host interrupt line is raised by this core.
    fn irq_pending(&self) -> bool {
        true
    }
    /// Host physical base of the interrupt register block, if any.
    fn mmio_base(&self) -> Option<u64> {
        None
    }
    /// Record the DSP-visible address of the interrupt register block.
    fn set_device_mmio_base(&self, _dsp_addr: u32) {}
    /// Hardware description blob handed to the firmware during the handshake.
    fn sync_data(&self) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers_round_to_pages() {
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_down(PAGE_SIZE + 7, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(pages_spanned(PAGE_SIZE - 1, 2), 2);
        assert_eq!(pages_spanned(0, PAGE_SIZE), 1);
    }
}
