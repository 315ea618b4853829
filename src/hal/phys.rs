// Author: Lukas Bower
// Purpose: Word-addressed physical memory shared between the host and the DSP.

//! Physical memory model.
//!
//! Memory is a sparse set of regions, each an array of atomic 32-bit words,
//! so the host and a DSP running on another thread can access the same
//! bytes concurrently. Word accesses are the unit of ordering, the way
//! `readl`/`writel` are on real hardware; byte accesses are composed from
//! them.

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;

use super::HalError;

struct PhysRegion {
    base: u64,
    words: Box<[AtomicU32]>,
}

impl PhysRegion {
    fn new(base: u64, size: u64) -> Self {
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self { base, words }
    }

    fn size(&self) -> u64 {
        self.words.len() as u64 * 4
    }

    fn end(&self) -> u64 {
        self.base + self.size()
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.base && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }

    fn load_word(&self, offset: u64) -> u32 {
        self.words[(offset / 4) as usize].load(Ordering::Acquire)
    }

    fn store_word(&self, offset: u64, value: u32) {
        self.words[(offset / 4) as usize].store(value, Ordering::Release);
    }

    fn load_byte(&self, offset: u64) -> u8 {
        let shift = (offset % 4) * 8;
        (self.load_word(offset) >> shift) as u8
    }

    fn store_byte(&self, offset: u64, value: u8) {
        let shift = (offset % 4) * 8;
        let word = &self.words[(offset / 4) as usize];
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let next = (current & !(0xff << shift)) | (u32::from(value) << shift);
            match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        let mut off = offset;
        let mut idx = 0;
        while idx < buf.len() {
            if off % 4 == 0 && buf.len() - idx >= 4 {
                buf[idx..idx + 4].copy_from_slice(&self.load_word(off).to_le_bytes());
                idx += 4;
                off += 4;
            } else {
                buf[idx] = self.load_byte(off);
                idx += 1;
                off += 1;
            }
        }
    }

    fn write(&self, offset: u64, data: &[u8]) {
        let mut off = offset;
        let mut idx = 0;
        while idx < data.len() {
            if off % 4 == 0 && data.len() - idx >= 4 {
                let word = [data[idx], data[idx + 1], data[idx + 2], data[idx + 3]];
                self.store_word(off, u32::from_le_bytes(word));
                idx += 4;
                off += 4;
            } else {
                self.store_byte(off, data[idx]);
                idx += 1;
                off += 1;
            }
        }
    }
}

/// Sparse physical address space.
#[derive(Default)]
pub struct PhysMemory {
    regions: RwLock<Vec<Arc<PhysRegion>>>,
}

impl std::fmt::Debug for PhysMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let regions = self.regions.read().expect("poisoned phys memory lock");
        f.debug_list()
            .entries(regions.iter().map(|r| (r.base, r.size())))
            .finish()
    }
}

impl PhysMemory {
    /// Empty address space.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Back `[base, base + size)` with zeroed memory.
    pub fn add_region(&self, base: u64, size: u64) -> Result<(), HalError> {
        if base % 4 != 0 || size == 0 {
            return Err(HalError::Misaligned(base));
        }
        let mut regions = self.regions.write().expect("poisoned phys memory lock");
        let end = base.checked_add(size).ok_or(HalError::Overlap { base, size })?;
        if regions.iter().any(|r| base < r.end() && r.base < end) {
            return Err(HalError::Overlap { base, size });
        }
        debug!(target: "xrp-phys", "[phys] add region {base:#x}+{size:#x}");
        let pos = regions.partition_point(|r| r.base < base);
        regions.insert(pos, Arc::new(PhysRegion::new(base, size)));
        Ok(())
    }

    /// Drop the region starting at `base`. Outstanding views keep its words alive.
    pub fn remove_region(&self, base: u64) -> bool {
        let mut regions = self.regions.write().expect("poisoned phys memory lock");
        let before = regions.len();
        regions.retain(|r| r.base != base);
        before != regions.len()
    }

    fn region_for(&self, addr: u64, len: u64) -> Result<Arc<PhysRegion>, HalError> {
        let regions = self.regions.read().expect("poisoned phys memory lock");
        regions
            .iter()
            .find(|r| r.contains(addr, len.max(1)))
            .cloned()
            .ok_or(HalError::Unbacked { addr, len })
    }

    /// Returns true when the whole range lies inside one region.
    #[must_use]
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        self.region_for(addr, len).is_ok()
    }

    /// Copy bytes out of physical memory.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), HalError> {
        let region = self.region_for(addr, buf.len() as u64)?;
        region.read(addr - region.base, buf);
        Ok(())
    }

    /// Read `len` bytes into a fresh vector.
    pub fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>, HalError> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Copy bytes into physical memory.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), HalError> {
        let region = self.region_for(addr, data.len() as u64)?;
        region.write(addr - region.base, data);
        Ok(())
    }

    /// Fill a range with `byte`.
    pub fn fill(&self, addr: u64, len: u64, byte: u8) -> Result<(), HalError> {
        let region = self.region_for(addr, len)?;
        let chunk = [byte; 256];
        let mut done = 0;
        while done < len {
            let step = (len - done).min(chunk.len() as u64);
            region.write(addr - region.base + done, &chunk[..step as usize]);
            done += step;
        }
        Ok(())
    }

    /// Copy between two physical ranges.
    pub fn copy(&self, src: u64, dst: u64, len: u64) -> Result<(), HalError> {
        let data = self.read_vec(src, len as usize)?;
        self.write(dst, &data)
    }

    /// Read one aligned little-endian word.
    pub fn read_u32(&self, addr: u64) -> Result<u32, HalError> {
        if addr % 4 != 0 {
            return Err(HalError::Misaligned(addr));
        }
        let region = self.region_for(addr, 4)?;
        Ok(region.load_word(addr - region.base))
    }

    /// Write one aligned little-endian word.
    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), HalError> {
        if addr % 4 != 0 {
            return Err(HalError::Misaligned(addr));
        }
        let region = self.region_for(addr, 4)?;
        region.store_word(addr - region.base, value);
        Ok(())
    }

    /// Map `[addr, addr + len)` as an I/O view.
    pub fn map_io(&self, addr: u64, len: u64) -> Result<IoRegion, HalError> {
        if addr % 4 != 0 {
            return Err(HalError::Misaligned(addr));
        }
        let region = self.region_for(addr, len)?;
        Ok(IoRegion {
            offset: addr - region.base,
            region,
            base: addr,
            len,
        })
    }
}

/// Mapped view of a physical range, the analogue of an `ioremap` cookie.
///
/// Offsets are relative to the start of the view. Accesses past the end of
/// the view are programming errors and panic like slice indexing does.
#[derive(Clone)]
pub struct IoRegion {
    region: Arc<PhysRegion>,
    offset: u64,
    base: u64,
    len: u64,
}

impl std::fmt::Debug for IoRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

impl IoRegion {
    /// Physical address of the first byte.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the view.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true for an empty view.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> u64 {
        let end = offset as u64 + len as u64;
        assert!(end <= self.len, "I/O access {offset:#x}+{len:#x} beyond {:#x}", self.len);
        self.offset + offset as u64
    }

    /// Sub-view starting `offset` bytes in.
    #[must_use]
    pub fn slice(&self, offset: usize, len: u64) -> IoRegion {
        let start = self.check(offset, len as usize);
        IoRegion {
            region: Arc::clone(&self.region),
            offset: start,
            base: self.base + offset as u64,
            len,
        }
    }

    /// Read the word at `offset`.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let at = self.check(offset, 4);
        debug_assert!(at % 4 == 0);
        self.region.load_word(at)
    }

    /// Write the word at `offset`.
    pub fn write_u32(&self, offset: usize, value: u32) {
        let at = self.check(offset, 4);
        debug_assert!(at % 4 == 0);
        self.region.store_word(at, value);
    }

    /// Copy bytes out of the view.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let at = self.check(offset, buf.len());
        self.region.read(at, buf);
    }

    /// Read `len` bytes into a fresh vector.
    #[must_use]
    pub fn read_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read(offset, &mut buf);
        buf
    }

    /// Copy bytes into the view.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let at = self.check(offset, data.len());
        self.region.write(at, data);
    }

    /// Zero `len` bytes at `offset`.
    pub fn clear(&self, offset: usize, len: usize) {
        self.write(offset, &vec![0u8; len]);
    }
}

/// Full barrier between host accesses to shared memory.
pub fn barrier() {
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_byte_access_round_trips() {
        let mem = PhysMemory::new();
        mem.add_region(0x1000, 0x100).unwrap();
        mem.write(0x1003, b"hello").unwrap();
        assert_eq!(mem.read_vec(0x1003, 5).unwrap(), b"hello");
        assert_eq!(mem.read_u32(0x1004).unwrap(), u32::from_le_bytes(*b"ello"));
    }

    #[test]
    fn accesses_outside_regions_fail() {
        let mem = PhysMemory::new();
        mem.add_region(0x1000, 0x100).unwrap();
        assert!(matches!(
            mem.read_u32(0x10fe),
            Err(HalError::Misaligned(0x10fe))
        ));
        assert!(mem.write(0x10fc, &[0; 8]).is_err());
        assert!(matches!(
            mem.add_region(0x1080, 0x100),
            Err(HalError::Overlap { .. })
        ));
    }

    #[test]
    fn io_views_share_words_with_memory() {
        let mem = PhysMemory::new();
        mem.add_region(0x2000, 0x1000).unwrap();
        let io = mem.map_io(0x2100, 0x80).unwrap();
        io.write_u32(4, 0xabcd_0123);
        assert_eq!(mem.read_u32(0x2104).unwrap(), 0xabcd_0123);
        let sub = io.slice(0x40, 0x40);
        sub.write(0, b"xy");
        assert_eq!(mem.read_vec(0x2140, 2).unwrap(), b"xy");
    }
}
