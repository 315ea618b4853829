// Author: Lukas Bower
// Purpose: Synthetic one-block pools carved straight from the page provider.

use std::fmt;
use std::sync::Arc;

use log::debug;

use super::{Allocation, Pool, PoolError};
use crate::hal::{PageProvider, PAGE_SHIFT};

/// Pool wrapping exactly one physically contiguous page run.
pub struct PagePool {
    provider: Arc<dyn PageProvider>,
    order: u32,
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool").field("order", &self.order).finish()
    }
}

impl PagePool {
    /// Order of the page run backing this pool.
    #[must_use]
    pub fn order(&self) -> u32 {
        self.order
    }
}

impl Pool for PagePool {
    fn alloc(&self, size: u64, _align: u64) -> Result<u64, PoolError> {
        Err(PoolError::OutOfMemory { size })
    }

    fn free(&self, start: u64, size: u64) {
        debug!(
            target: "xrp-pool",
            "[pool] return page run {start:#x}+{size:#x} order={order}",
            order = self.order
        );
        self.provider.free_pages(start, self.order);
    }
}

/// Smallest order whose run covers `size` bytes.
pub(crate) fn order_for(size: u64) -> u32 {
    let pages = size.div_ceil(1 << PAGE_SHIFT).max(1);
    pages.next_power_of_two().trailing_zeros()
}

pub(super) fn allocate_from_pages(
    provider: &Arc<dyn PageProvider>,
    size: u64,
    align: u64,
) -> Result<Allocation, PoolError> {
    let order = order_for(size);
    if order >= provider.max_order() {
        debug!(
            target: "xrp-pool",
            "[pool] page fallback refuses order {order} (max {max})",
            max = provider.max_order()
        );
        return Err(PoolError::OutOfMemory { size });
    }
    let start = provider
        .alloc_pages(order)
        .ok_or(PoolError::OutOfMemory { size })?;
    if start % align != 0 {
        provider.free_pages(start, order);
        return Err(PoolError::OutOfMemory { size });
    }
    debug!(target: "xrp-pool", "[pool] page fallback {start:#x}+{size:#x} order={order}");
    let pool: Arc<dyn Pool> = Arc::new(PagePool {
        provider: Arc::clone(provider),
        order,
    });
    Ok(Allocation::new(start, size, pool))
}
