// Author: Lukas Bower
// Purpose: A process address space backed by simulated physical memory.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;

use super::SimPageProvider;
use crate::error::XrpError;
use crate::hal::{align_down, pages_spanned, PageProvider, PhysMemory, PAGE_SIZE};
use crate::pool::Allocation;
use crate::registry::FileId;
use crate::share::{AddressSpace, Vma, VmaKind};

const USER_BASE: u64 = 0x4000_0000;

#[derive(Debug)]
enum Backing {
    /// Pages owned by the area, one physical base per virtual page.
    Pages {
        pages: Vec<u64>,
        runs: Vec<(u64, u32)>,
    },
    /// A physically linear range starting at the given address.
    Linear(u64),
}

#[derive(Debug)]
struct Area {
    vma: Vma,
    backing: Backing,
}

impl Area {
    fn phys(&self, vaddr: u64) -> u64 {
        let offset = vaddr - self.vma.start;
        match &self.backing {
            Backing::Pages { pages, .. } => {
                pages[(offset / PAGE_SIZE) as usize] + offset % PAGE_SIZE
            }
            Backing::Linear(base) => base + offset,
        }
    }
}

#[derive(Debug, Default)]
struct SpaceState {
    areas: BTreeMap<u64, Area>,
    next: u64,
    pins: BTreeMap<u64, u32>,
    dirty: BTreeSet<u64>,
}

impl SpaceState {
    fn area(&self, vaddr: u64) -> Option<&Area> {
        self.areas
            .range(..=vaddr)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| vaddr < area.vma.end)
    }

    fn reserve(&mut self, size: u64) -> u64 {
        let start = self.next;
        self.next += align_down(size + PAGE_SIZE - 1, PAGE_SIZE) + PAGE_SIZE;
        start
    }
}

/// User address space of one simulated process.
#[derive(Debug)]
pub struct SimAddressSpace {
    memory: Arc<PhysMemory>,
    pages: Arc<SimPageProvider>,
    state: Mutex<SpaceState>,
}

impl SimAddressSpace {
    /// Empty address space drawing anonymous memory from `pages`.
    #[must_use]
    pub fn new(memory: Arc<PhysMemory>, pages: Arc<SimPageProvider>) -> Arc<Self> {
        Arc::new(Self {
            memory,
            pages,
            state: Mutex::new(SpaceState {
                next: USER_BASE,
                ..SpaceState::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, SpaceState> {
        self.state.lock().expect("poisoned address space lock")
    }

    fn insert(&self, size: u64, kind: VmaKind, cached: bool, backing: Backing) -> u64 {
        let mut state = self.state();
        let start = state.reserve(size);
        let vma = Vma {
            start,
            end: start + size,
            kind,
            cached,
        };
        trace!(target: "xrp-sim", "[space] map {start:#x}+{size:#x}");
        state.areas.insert(start, Area { vma, backing });
        start
    }

    /// Map `size` bytes of zeroed anonymous memory.
    ///
    /// Contiguous memory comes from one page run; otherwise every page is
    /// allocated on its own and the pages are laid out in descending
    /// physical order so no two neighbours are adjacent.
    pub fn alloc_anonymous(&self, size: u64, contiguous: bool) -> Result<u64, XrpError> {
        if size == 0 {
            return Err(XrpError::invalid("empty anonymous mapping"));
        }
        let n_pages = pages_spanned(0, size);
        let mut runs = Vec::new();
        let mut pages = Vec::with_capacity(n_pages as usize);
        let result = if contiguous {
            let order = n_pages.next_power_of_two().trailing_zeros();
            self.pages.alloc_pages(order).map(|base| {
                runs.push((base, order));
                pages.extend((0..n_pages).map(|idx| base + idx * PAGE_SIZE));
            })
        } else {
            (0..n_pages)
                .map(|_| {
                    self.pages.alloc_pages(0).map(|page| {
                        runs.push((page, 0));
                        pages.push(page);
                    })
                })
                .collect::<Option<()>>()
                .map(|()| pages.reverse())
        };
        if result.is_none() {
            for (base, order) in runs {
                self.pages.free_pages(base, order);
            }
            return Err(XrpError::OutOfMemory { size });
        }
        for &page in &pages {
            self.memory.fill(page, PAGE_SIZE, 0)?;
        }
        Ok(self.insert(
            size,
            VmaKind::Anonymous,
            true,
            Backing::Pages { pages, runs },
        ))
    }

    /// Pins currently held on the page at physical `page`.
    #[must_use]
    pub fn pin_count(&self, page: u64) -> u32 {
        self.state().pins.get(&page).copied().unwrap_or(0)
    }

    /// Returns true once the page at physical `page` has been marked written.
    #[must_use]
    pub fn is_dirty(&self, page: u64) -> bool {
        self.state().dirty.contains(&page)
    }

    /// Number of mapped areas.
    #[must_use]
    pub fn area_count(&self) -> usize {
        self.state().areas.len()
    }

    /// Physical address behind `vaddr`.
    #[must_use]
    pub fn resolve(&self, vaddr: u64) -> Option<u64> {
        self.state().area(vaddr).map(|area| area.phys(vaddr))
    }

    fn walk(&self, addr: u64, len: usize, mut f: impl FnMut(u64, usize, usize) -> Result<(), XrpError>) -> Result<(), XrpError> {
        let state = self.state();
        let mut done = 0;
        while done < len {
            let vaddr = addr + done as u64;
            let area = state.area(vaddr).ok_or(XrpError::Fault { addr: vaddr })?;
            let page_left = (PAGE_SIZE - vaddr % PAGE_SIZE) as usize;
            let chunk = page_left.min(len - done);
            f(area.phys(vaddr), done, chunk)?;
            done += chunk;
        }
        Ok(())
    }
}

impl AddressSpace for SimAddressSpace {
    fn find_vma(&self, addr: u64) -> Option<Vma> {
        self.state()
            .areas
            .values()
            .find(|area| area.vma.end > addr)
            .map(|area| area.vma.clone())
    }

    fn follow_pfn(&self, addr: u64) -> Option<u64> {
        let state = self.state();
        let area = state.area(addr)?;
        match area.backing {
            Backing::Linear(_) => Some(align_down(area.phys(addr), PAGE_SIZE)),
            Backing::Pages { .. } => None,
        }
    }

    fn pin_user_pages(&self, addr: u64, n_pages: u64) -> Vec<u64> {
        let mut state = self.state();
        let first = align_down(addr, PAGE_SIZE);
        let mut pinned = Vec::new();
        for idx in 0..n_pages {
            let vaddr = first + idx * PAGE_SIZE;
            let page = match state.area(vaddr) {
                Some(area) if matches!(area.backing, Backing::Pages { .. }) => area.phys(vaddr),
                _ => break,
            };
            pinned.push(page);
        }
        for &page in &pinned {
            *state.pins.entry(page).or_insert(0) += 1;
        }
        pinned
    }

    fn unpin_pages(&self, pages: &[u64]) {
        let mut state = self.state();
        for page in pages {
            if let Some(count) = state.pins.get_mut(page) {
                *count -= 1;
                if *count == 0 {
                    state.pins.remove(page);
                }
            }
        }
    }

    fn set_page_dirty(&self, page: u64) {
        self.state().dirty.insert(page);
    }

    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), XrpError> {
        let len = buf.len();
        self.walk(addr, len, |phys, at, chunk| {
            self.memory
                .read(phys, &mut buf[at..at + chunk])
                .map_err(|_| XrpError::Fault { addr })
        })
    }

    fn copy_to_user(&self, addr: u64, data: &[u8]) -> Result<(), XrpError> {
        self.walk(addr, data.len(), |phys, at, chunk| {
            self.memory
                .write(phys, &data[at..at + chunk])
                .map_err(|_| XrpError::Fault { addr })
        })
    }

    fn map_driver(
        &self,
        file: FileId,
        allocation: Allocation,
        cached: bool,
    ) -> Result<u64, XrpError> {
        let size = allocation.size();
        let base = allocation.offset();
        Ok(self.insert(
            size,
            VmaKind::Driver { file, allocation },
            cached,
            Backing::Linear(base),
        ))
    }

    fn map_pfn(&self, phys: u64, size: u64, cached: bool) -> Result<u64, XrpError> {
        if size == 0 {
            return Err(XrpError::invalid("empty pfn mapping"));
        }
        Ok(self.insert(size, VmaKind::Io, cached, Backing::Linear(phys)))
    }

    fn unmap(&self, addr: u64) -> Result<(), XrpError> {
        let area = self
            .state()
            .areas
            .remove(&addr)
            .ok_or_else(|| XrpError::invalid(format!("no mapping at {addr:#x}")))?;
        trace!(target: "xrp-sim", "[space] unmap {addr:#x}");
        if let Backing::Pages { runs, .. } = area.backing {
            for (base, order) in runs {
                self.pages.free_pages(base, order);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    #[test]
    fn scattered_memory_is_not_physically_contiguous() {
        let platform = SimPlatform::new();
        let space = SimAddressSpace::new(platform.memory(), platform.pages());
        let vaddr = space.alloc_anonymous(3 * PAGE_SIZE, false).unwrap();
        let first = space.resolve(vaddr).unwrap();
        let second = space.resolve(vaddr + PAGE_SIZE).unwrap();
        assert_ne!(second, first + PAGE_SIZE);

        space.copy_to_user(vaddr + PAGE_SIZE - 2, b"span").unwrap();
        let mut back = [0u8; 4];
        space.copy_from_user(vaddr + PAGE_SIZE - 2, &mut back).unwrap();
        assert_eq!(&back, b"span");

        assert!(space.follow_pfn(vaddr).is_none());
        assert_eq!(space.pin_user_pages(vaddr, 3).len(), 3);
        space.unmap(vaddr).unwrap();
        assert_eq!(space.area_count(), 0);
        assert!(matches!(
            space.copy_from_user(vaddr, &mut back),
            Err(XrpError::Fault { .. })
        ));
    }
}
