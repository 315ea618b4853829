// Author: Lukas Bower
// Purpose: Host-physical to DSP-visible address windows.

//! Address translation between host physical memory and the DSP's view of it.
//!
//! The map is built once from configuration and never changes afterwards, so
//! lookups take no lock.

use log::debug;
use thiserror::Error;

use crate::config::MapEntryConfig;

/// Translation failures and rejected map layouts.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No window covers the address.
    #[error("no DSP translation for {0:#x}")]
    NoTranslation(u64),
    /// A window has zero size.
    #[error("address map entry at {0:#x} has zero size")]
    EmptyEntry(u64),
    /// Two windows overlap on the host side.
    #[error("address map entries at {0:#x} and {1:#x} overlap")]
    Overlap(u64, u64),
    /// The DSP side of a window runs past 4 GiB.
    #[error("address map entry at {0:#x} overflows the DSP address space")]
    DspOverflow(u64),
}

/// One translation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    /// Host physical base.
    pub src: u64,
    /// DSP-visible base.
    pub dst: u32,
    /// Window length.
    pub size: u64,
}

impl MapEntry {
    /// Returns true when `addr` lies in `[src, src + size)`.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.src && addr - self.src < self.size
    }

    fn contains_dsp(&self, addr: u32) -> bool {
        addr >= self.dst && u64::from(addr - self.dst) < self.size
    }
}

/// Immutable table of translation windows sorted by host address.
#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    entries: Vec<MapEntry>,
}

impl AddressMap {
    /// Validate and sort the configured windows.
    pub fn new(config: &[MapEntryConfig]) -> Result<Self, MapError> {
        let mut entries: Vec<MapEntry> = config
            .iter()
            .map(|c| MapEntry {
                src: c.src,
                dst: c.dst,
                size: c.size,
            })
            .collect();
        for entry in &entries {
            if entry.size == 0 {
                return Err(MapError::EmptyEntry(entry.src));
            }
            if u64::from(entry.dst) + entry.size > 1 << 32 {
                return Err(MapError::DspOverflow(entry.src));
            }
        }
        entries.sort_by_key(|e| e.src);
        for pair in entries.windows(2) {
            if pair[0].src + pair[0].size > pair[1].src {
                return Err(MapError::Overlap(pair[0].src, pair[1].src));
            }
        }
        for entry in &entries {
            debug!(
                target: "xrp-map",
                "[map] {src:#x}+{size:#x} -> {dst:#x}",
                src = entry.src,
                size = entry.size,
                dst = entry.dst
            );
        }
        Ok(Self { entries })
    }

    /// Window covering `phys`, if any.
    #[must_use]
    pub fn lookup_entry(&self, phys: u64) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.contains(phys))
    }

    /// DSP address of `phys`.
    pub fn translate(&self, phys: u64) -> Result<u32, MapError> {
        self.lookup_entry(phys)
            .map(|e| (phys - e.src + u64::from(e.dst)) as u32)
            .ok_or(MapError::NoTranslation(phys))
    }

    /// Host physical address of the DSP address `dsp`.
    pub fn translate_to_host(&self, dsp: u32) -> Result<u64, MapError> {
        self.entries
            .iter()
            .find(|e| e.contains_dsp(dsp))
            .map(|e| u64::from(dsp - e.dst) + e.src)
            .ok_or(MapError::NoTranslation(u64::from(dsp)))
    }

    /// Returns true when `[phys, phys + len)` lies inside a single window.
    #[must_use]
    pub fn covers(&self, phys: u64, len: u64) -> bool {
        match self.lookup_entry(phys) {
            Some(e) => len == 0 || e.contains(phys + len - 1),
            None => false,
        }
    }

    /// Configured windows in host address order.
    #[must_use]
    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> AddressMap {
        AddressMap::new(&[
            MapEntryConfig {
                src: 0x1_0000_0000,
                dst: 0x4000_0000,
                size: 0x1000_0000,
            },
            MapEntryConfig {
                src: 0x8000_0000,
                dst: 0x8000_0000,
                size: 0x1000_0000,
            },
        ])
        .unwrap()
    }

    #[test]
    fn windows_translate_both_ways() {
        let map = map();
        assert_eq!(map.translate(0x8000_1234), Ok(0x8000_1234));
        assert_eq!(map.translate(0x1_0000_0010), Ok(0x4000_0010));
        assert_eq!(map.translate_to_host(0x4000_0010), Ok(0x1_0000_0010));
        assert_eq!(
            map.translate(0x9000_0000),
            Err(MapError::NoTranslation(0x9000_0000))
        );
    }

    #[test]
    fn cover_requires_a_single_window() {
        let map = map();
        assert!(map.covers(0x8000_0000, 0x1000_0000));
        assert!(!map.covers(0x8fff_f000, 0x2000));
    }

    #[test]
    fn rejects_overlap_and_dsp_overflow() {
        let overlap = AddressMap::new(&[
            MapEntryConfig { src: 0x1000, dst: 0, size: 0x2000 },
            MapEntryConfig { src: 0x2000, dst: 0x10000, size: 0x1000 },
        ]);
        assert_eq!(overlap.unwrap_err(), MapError::Overlap(0x1000, 0x2000));
        let overflow = AddressMap::new(&[MapEntryConfig {
            src: 0,
            dst: 0xffff_f000,
            size: 0x2000,
        }]);
        assert_eq!(overflow.unwrap_err(), MapError::DspOverflow(0));
    }
}
