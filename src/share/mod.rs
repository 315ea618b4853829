// Author: Lukas Bower
// Purpose: Make caller buffers visible to the DSP and take them back afterwards.

//! Buffer sharing.
//!
//! [`Sharer::share`] classifies a virtual range and returns the physical
//! address the DSP should use plus a [`Mapping`] describing how it was
//! obtained. Classification order:
//!
//! 1. a driver mapping of this file, or of another open driver file whose
//!    range the DSP can reach: native, only a reference is taken;
//! 2. an I/O or page-frame mapping resolved page by page: alien, pfn-mapped;
//! 3. pinned user pages: alien, pinned;
//! 4. a bounce buffer from the pool: alien, shadow copy.
//!
//! Cases 2 and 3 must be physically contiguous, translatable and, when the
//! area is cached, manageable by the platform cache operations.
//! [`Sharer::unshare`] reverses a mapping and writes results back.

use std::fmt;
use std::sync::Arc;

use log::{debug, trace};
use xrp_wire::BufferFlags;

use crate::address_map::AddressMap;
use crate::error::XrpError;
use crate::hal::{
    align_down, pages_spanned, sync_for_cpu, sync_for_device, CacheOps, PhysMemory, PAGE_SIZE,
};
use crate::pool::{Allocation, MemoryPool};
use crate::registry::{FileId, Registry};

mod space;

pub use space::{AddressSpace, NoUserSpace, Vma, VmaKind};

const SHADOW_MIN_ALIGN: u64 = 16;

/// Memory resources of one device.
pub struct DeviceMemory {
    /// Physical memory.
    pub phys: Arc<PhysMemory>,
    /// Allocation front end.
    pub pool: MemoryPool,
    /// Host to DSP translation.
    pub map: AddressMap,
    /// Cache maintenance.
    pub cache: Arc<dyn CacheOps>,
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("pool", &self.pool)
            .field("map", &self.map)
            .finish()
    }
}

impl DeviceMemory {
    /// DSP address of `phys`.
    pub fn translate(&self, phys: u64) -> Result<u32, XrpError> {
        Ok(self.map.translate(phys)?)
    }

    /// Hand `[phys, phys + len)` to the DSP.
    pub fn sync_for_device(&self, phys: u64, len: u64, flags: BufferFlags) {
        sync_for_device(self.cache.as_ref(), phys, len, flags);
    }

    /// Take `[phys, phys + len)` back from the DSP.
    pub fn sync_for_cpu(&self, phys: u64, len: u64, flags: BufferFlags) {
        sync_for_cpu(self.cache.as_ref(), phys, len, flags);
    }
}

/// Who owns the memory behind an alien mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Caller user memory.
    User,
    /// Driver-internal buffer; `vaddr` holds its physical address.
    Kernel,
}

/// How an alien range was made visible.
#[derive(Debug)]
pub enum AlienKind {
    /// User pages pinned in place.
    Pinned {
        /// Physical base of every pinned page.
        pages: Vec<u64>,
    },
    /// Contiguous page-frame run of an I/O area.
    PfnMapped,
    /// Bounce buffer holding a copy of the range.
    ShadowCopy {
        /// Pool block backing the copy.
        allocation: Allocation,
    },
}

/// Memory not allocated by this driver, made visible to the DSP.
#[derive(Debug)]
pub struct AlienMapping {
    /// Start of the caller range.
    pub vaddr: u64,
    /// Physical address handed to the DSP.
    pub paddr: u64,
    /// Range length.
    pub size: u64,
    /// Owner of the caller range.
    pub origin: Origin,
    /// Strategy used.
    pub kind: AlienKind,
}

/// Result of sharing one buffer. Must be passed to [`Sharer::unshare`].
#[derive(Debug)]
#[must_use]
pub enum Mapping {
    /// Nothing to undo.
    None,
    /// Range inside a driver pool allocation.
    Native {
        /// Reference held for the duration of the request.
        allocation: Allocation,
        /// Start of the caller range.
        vaddr: u64,
    },
    /// Foreign memory.
    Alien(AlienMapping),
    /// Translatable driver-internal buffer used in place.
    NativeKernelOwned {
        /// Physical address.
        paddr: u64,
        /// Length.
        size: u64,
    },
}

impl Mapping {
    /// Short name of the variant, for logs and assertions.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Native { .. } => "native",
            Self::Alien(alien) => match alien.kind {
                AlienKind::Pinned { .. } => "alien-pinned",
                AlienKind::PfnMapped => "alien-pfn",
                AlienKind::ShadowCopy { .. } => "alien-copy",
            },
            Self::NativeKernelOwned { .. } => "kernel",
        }
    }

    /// Abandon the mapping without releasing what it holds.
    ///
    /// Used when the DSP may still access the memory and recovery is impossible.
    pub fn leak(self) {
        match self {
            Self::Native { allocation, .. } => allocation.leak(),
            Self::Alien(AlienMapping {
                kind: AlienKind::ShadowCopy { allocation },
                ..
            }) => allocation.leak(),
            Self::Alien(_) | Self::None | Self::NativeKernelOwned { .. } => {}
        }
    }
}

/// Sharing operations on behalf of one caller.
pub struct Sharer<'a> {
    mem: &'a DeviceMemory,
    registry: &'a Registry,
    file: Option<FileId>,
    space: &'a dyn AddressSpace,
}

impl<'a> Sharer<'a> {
    /// Sharer for requests arriving through `file` from `space`.
    #[must_use]
    pub fn new(
        mem: &'a DeviceMemory,
        registry: &'a Registry,
        file: Option<FileId>,
        space: &'a dyn AddressSpace,
    ) -> Self {
        Self {
            mem,
            registry,
            file,
            space,
        }
    }

    /// Device memory this sharer works on.
    #[must_use]
    pub fn memory(&self) -> &'a DeviceMemory {
        self.mem
    }

    /// Address space requests are resolved in.
    #[must_use]
    pub fn space(&self) -> &'a dyn AddressSpace {
        self.space
    }

    fn region_vma_count(&self, vaddr: u64, size: u64, vma: &Vma) -> usize {
        let Some(end) = vaddr.checked_add(size) else {
            return 0;
        };
        if vma.start > vaddr {
            return 0;
        }
        if vma.covers(vaddr, size) {
            return 1;
        }
        let mut current = vma.end;
        let mut count = 1;
        loop {
            let Some(next) = self.space.find_vma(current) else {
                return 0;
            };
            if next.start != current {
                return 0;
            }
            count += 1;
            if end <= next.end {
                return count;
            }
            current = next.end;
        }
    }

    fn share_native(&self, vaddr: u64, size: u64, vma: &Vma) -> Option<(u64, Mapping)> {
        let VmaKind::Driver { file, allocation } = &vma.kind else {
            return None;
        };
        let own = Some(*file) == self.file;
        if !own && !self.registry.is_known_file(*file) {
            return None;
        }
        let phys = allocation.offset() + (vaddr - vma.start);
        if !own && !self.mem.map.covers(phys, size) {
            debug!(target: "xrp-share", "[share] foreign driver range {phys:#x} is untranslatable");
            return None;
        }
        trace!(target: "xrp-share", "[share] native {vaddr:#x} -> {phys:#x}");
        Some((
            phys,
            Mapping::Native {
                allocation: allocation.clone(),
                vaddr,
            },
        ))
    }

    fn pfn_virt_to_phys(&self, vaddr: u64, size: u64) -> Result<AlienMapping, XrpError> {
        let n_pages = pages_spanned(vaddr, size);
        let first_page = align_down(vaddr, PAGE_SIZE);
        let mut pfn = self
            .space
            .follow_pfn(first_page)
            .ok_or(XrpError::Fault { addr: vaddr })?;
        let paddr = pfn + (vaddr - first_page);
        let entry = *self
            .mem
            .map
            .lookup_entry(paddr)
            .ok_or(XrpError::Untranslatable(paddr))?;
        for idx in 1..n_pages {
            let page = first_page + idx * PAGE_SIZE;
            let next = self
                .space
                .follow_pfn(page)
                .ok_or(XrpError::Fault { addr: page })?;
            if next != pfn + PAGE_SIZE {
                return Err(XrpError::invalid("non-contiguous physical memory"));
            }
            if !entry.contains(next) {
                return Err(XrpError::Untranslatable(next));
            }
            pfn = next;
        }
        Ok(AlienMapping {
            vaddr,
            paddr,
            size,
            origin: Origin::User,
            kind: AlienKind::PfnMapped,
        })
    }

    fn check_pinned(&self, pages: &[u64], n_pages: u64, vaddr: u64) -> Result<(), XrpError> {
        if (pages.len() as u64) < n_pages || pages.is_empty() {
            return Err(XrpError::Fault { addr: vaddr });
        }
        let entry = *self
            .mem
            .map
            .lookup_entry(pages[0])
            .ok_or(XrpError::Untranslatable(pages[0]))?;
        for pair in pages.windows(2) {
            if pair[1] != pair[0] + PAGE_SIZE {
                return Err(XrpError::invalid("non-contiguous physical memory"));
            }
            if !entry.contains(pair[1]) {
                return Err(XrpError::Untranslatable(pair[1]));
            }
        }
        Ok(())
    }

    fn pin_virt_to_phys(&self, vaddr: u64, size: u64) -> Result<AlienMapping, XrpError> {
        let n_pages = pages_spanned(vaddr, size);
        let pages = self.space.pin_user_pages(vaddr, n_pages);
        let checked = self.check_pinned(&pages, n_pages, vaddr);
        if let Err(err) = checked {
            self.space.unpin_pages(&pages);
            return Err(err);
        }
        Ok(AlienMapping {
            vaddr,
            paddr: pages[0] + (vaddr - align_down(vaddr, PAGE_SIZE)),
            size,
            origin: Origin::User,
            kind: AlienKind::Pinned { pages },
        })
    }

    fn release_alien(&self, alien: AlienMapping) {
        match alien.kind {
            AlienKind::Pinned { pages } => self.space.unpin_pages(&pages),
            AlienKind::ShadowCopy { allocation } => drop(allocation),
            AlienKind::PfnMapped => {}
        }
    }

    fn shadow_copy(
        &self,
        flags: BufferFlags,
        vaddr: u64,
        size: u64,
        origin: Origin,
    ) -> Result<AlienMapping, XrpError> {
        let align = (vaddr & vaddr.wrapping_neg()).clamp(SHADOW_MIN_ALIGN, PAGE_SIZE);
        let offset = vaddr & (align - 1);
        let allocation = self.mem.pool.allocate(size + align, align)?;
        let mut paddr = (allocation.start() & align.wrapping_neg()) | offset;
        if paddr < allocation.start() {
            paddr += align;
        }
        if flags.contains(BufferFlags::READ) {
            let mut data = vec![0u8; size as usize];
            match origin {
                Origin::User => self.space.copy_from_user(vaddr, &mut data)?,
                Origin::Kernel => self.mem.phys.read(vaddr, &mut data)?,
            }
            self.mem.phys.write(paddr, &data)?;
        }
        debug!(target: "xrp-share", "[share] shadow copy {vaddr:#x}+{size:#x} at {paddr:#x}");
        Ok(AlienMapping {
            vaddr,
            paddr,
            size,
            origin,
            kind: AlienKind::ShadowCopy { allocation },
        })
    }

    /// Make `[vaddr, vaddr + size)` of the caller visible to the DSP.
    pub fn share(
        &self,
        vaddr: u64,
        size: u64,
        flags: BufferFlags,
    ) -> Result<(u64, Mapping), XrpError> {
        let vma = self
            .space
            .find_vma(vaddr)
            .ok_or_else(|| XrpError::invalid(format!("no area for {vaddr:#x}")))?;
        let vma = match self.region_vma_count(vaddr, size, &vma) {
            0 => {
                return Err(XrpError::invalid(format!(
                    "bad area for {vaddr:#x}+{size:#x}"
                )))
            }
            1 => Some(vma),
            _ => {
                debug!(target: "xrp-share", "[share] {vaddr:#x}+{size:#x} spans several areas");
                None
            }
        };

        if let Some(vma) = &vma {
            if let Some((phys, mapping)) = self.share_native(vaddr, size, vma) {
                if vma.cached {
                    self.mem.sync_for_device(phys, size, flags);
                }
                return Ok((phys, mapping));
            }
        }

        let n_pages = pages_spanned(vaddr, size);
        let needs_cache = vma.as_ref().map_or(true, |v| v.cached);
        let attempt = match &vma {
            Some(v) if !matches!(v.kind, VmaKind::Anonymous) => self.pfn_virt_to_phys(vaddr, size),
            _ => self.pin_virt_to_phys(vaddr, size),
        };
        let attempt = attempt.and_then(|alien| {
            let page = align_down(alien.paddr, PAGE_SIZE);
            if needs_cache && !self.mem.cache.cacheable(page, n_pages * PAGE_SIZE) {
                self.release_alien(alien);
                return Err(XrpError::invalid("range needs unsupported cache maintenance"));
            }
            Ok(alien)
        });

        let (alien, do_cache) = match attempt {
            Ok(alien) => (alien, needs_cache),
            Err(err) => {
                debug!(target: "xrp-share", "[share] direct share of {vaddr:#x} failed: {err}");
                let alien = self
                    .shadow_copy(flags, vaddr, size, Origin::User)
                    .map_err(|err| {
                        debug!(target: "xrp-share", "[share] shadow copy failed: {err}");
                        XrpError::ShareFailed { vaddr, size }
                    })?;
                (alien, false)
            }
        };
        let phys = alien.paddr;
        if do_cache {
            self.mem.sync_for_device(phys, size, flags);
        }
        Ok((phys, Mapping::Alien(alien)))
    }

    /// Make a driver-internal buffer at physical `phys` visible to the DSP.
    pub fn share_kernel(
        &self,
        phys: u64,
        size: u64,
        flags: BufferFlags,
    ) -> Result<(u64, Mapping), XrpError> {
        if self.mem.map.translate(phys).is_ok() {
            self.mem.sync_for_device(phys, size, flags);
            return Ok((phys, Mapping::NativeKernelOwned { paddr: phys, size }));
        }
        debug!(target: "xrp-share", "[share] kernel buffer {phys:#x} untranslatable, shadowing");
        let alien = self.shadow_copy(flags, phys, size, Origin::Kernel)?;
        Ok((alien.paddr, Mapping::Alien(alien)))
    }

    fn writeback(&self, alien: &AlienMapping, flags: BufferFlags) -> Result<(), XrpError> {
        match &alien.kind {
            AlienKind::Pinned { pages } => {
                self.mem.sync_for_cpu(alien.paddr, alien.size, flags);
                for &page in pages {
                    self.space.set_page_dirty(page);
                }
                Ok(())
            }
            AlienKind::ShadowCopy { .. } => {
                let data = self.mem.phys.read_vec(alien.paddr, alien.size as usize)?;
                match alien.origin {
                    Origin::User => self.space.copy_to_user(alien.vaddr, &data),
                    Origin::Kernel => Ok(self.mem.phys.write(alien.vaddr, &data)?),
                }
            }
            AlienKind::PfnMapped => Ok(()),
        }
    }

    /// Reverse `mapping`, writing DSP output back when `flags` has WRITE.
    pub fn unshare(&self, mapping: Mapping, flags: BufferFlags) -> Result<(), XrpError> {
        let write = flags.contains(BufferFlags::WRITE);
        match mapping {
            Mapping::None => Ok(()),
            Mapping::Native { allocation, .. } => {
                if write {
                    self.mem
                        .sync_for_cpu(allocation.start(), allocation.size(), flags);
                }
                drop(allocation);
                Ok(())
            }
            Mapping::NativeKernelOwned { paddr, size } => {
                if write {
                    self.mem.sync_for_cpu(paddr, size, flags);
                }
                Ok(())
            }
            Mapping::Alien(alien) => {
                let result = if write {
                    self.writeback(&alien, flags)
                } else {
                    Ok(())
                };
                self.release_alien(alien);
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimAddressSpace, SimPlatform};

    fn setup() -> (SimPlatform, Arc<SimAddressSpace>) {
        let platform = SimPlatform::new();
        let space = SimAddressSpace::new(platform.memory(), platform.pages());
        (platform, space)
    }

    #[test]
    fn contiguous_anonymous_memory_is_pinned_in_place() {
        let (platform, space) = setup();
        let mem = platform.device_memory();
        let registry = Registry::new();
        let vaddr = space.alloc_anonymous(0x2000, true).unwrap();
        let sharer = Sharer::new(&mem, &registry, None, space.as_ref());
        let (phys, mapping) = sharer.share(vaddr + 8, 0x100, BufferFlags::READ).unwrap();
        assert_eq!(mapping.kind_name(), "alien-pinned");
        assert_eq!(phys & 0xfff, 8);
        assert_eq!(space.pin_count(align_down(phys, PAGE_SIZE)), 1);
        sharer.unshare(mapping, BufferFlags::READ).unwrap();
        assert_eq!(space.pin_count(align_down(phys, PAGE_SIZE)), 0);
    }

    #[test]
    fn native_share_holds_a_pool_reference_until_unshared() {
        let (platform, space) = setup();
        let mem = platform.device_memory();
        let registry = Registry::new();
        let file = registry.register_file();
        let allocation = mem.pool.allocate(0x1000, 0).unwrap();
        let held = allocation.clone();
        let vaddr = space.map_driver(file, allocation, true).unwrap();
        let before = held.ref_count();

        let sharer = Sharer::new(&mem, &registry, Some(file), space.as_ref());
        let (_, mapping) = sharer.share(vaddr + 0x10, 0x100, BufferFlags::READ_WRITE).unwrap();
        assert_eq!(mapping.kind_name(), "native");
        assert_eq!(held.ref_count(), before + 1);

        sharer.unshare(mapping, BufferFlags::READ_WRITE).unwrap();
        assert_eq!(held.ref_count(), before);
    }

    #[test]
    fn kernel_buffers_in_the_map_are_used_in_place() {
        let (platform, space) = setup();
        let mem = platform.device_memory();
        let registry = Registry::new();
        let buffer = mem.pool.allocate(64, 0).unwrap();
        let sharer = Sharer::new(&mem, &registry, None, space.as_ref());
        let (phys, mapping) = sharer
            .share_kernel(buffer.start(), 64, BufferFlags::READ)
            .unwrap();
        assert_eq!(phys, buffer.start());
        assert_eq!(mapping.kind_name(), "kernel");
        sharer.unshare(mapping, BufferFlags::READ).unwrap();
    }

    #[test]
    fn missing_area_is_an_invalid_argument() {
        let (platform, space) = setup();
        let mem = platform.device_memory();
        let registry = Registry::new();
        let sharer = Sharer::new(&mem, &registry, None, space.as_ref());
        assert!(matches!(
            sharer.share(0x10, 0x10, BufferFlags::READ),
            Err(XrpError::InvalidArgument(_))
        ));
    }
}
