// Author: Lukas Bower
// Purpose: Fetch DSP firmware images and place their loadable segments in device memory.

//! Firmware loading.
//!
//! Images are 32-bit ELF files linked at DSP addresses. Every `PT_LOAD`
//! segment is reverse-translated through the address map to host physical
//! memory; the file-backed part is copied and the rest zeroed. The entry
//! point becomes the DSP reset vector.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;

use log::{debug, info};
use thiserror::Error;
use xmas_elf::header::Class;
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

use crate::address_map::AddressMap;
use crate::hal::{HalError, PhysMemory};

/// Errors raised while fetching or placing an image.
#[derive(Debug, Error)]
pub enum FirmwareError {
    /// No image with this name exists.
    #[error("firmware {0} not found")]
    NotFound(String),
    /// Reading the image failed.
    #[error("firmware read failed: {0}")]
    Io(#[from] io::Error),
    /// The image is not a usable ELF file.
    #[error("bad firmware image: {0}")]
    Elf(&'static str),
    /// A segment lies outside every address window.
    #[error("segment at DSP address {addr:#x}+{size:#x} is not host visible")]
    Untranslatable {
        /// DSP address of the segment.
        addr: u32,
        /// Segment size in memory.
        size: u64,
    },
    /// Writing the segment into memory failed.
    #[error(transparent)]
    Memory(#[from] HalError),
}

/// Somewhere firmware images come from.
pub trait FirmwareSource: Send + Sync {
    /// Read the image called `name`.
    fn fetch(&self, name: &str) -> Result<Vec<u8>, FirmwareError>;
}

/// Images stored as files in one directory.
#[derive(Debug, Clone)]
pub struct DirFirmware {
    dir: PathBuf,
}

impl DirFirmware {
    /// Source reading from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FirmwareSource for DirFirmware {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, FirmwareError> {
        if name.contains('/') || name.contains("..") {
            return Err(FirmwareError::NotFound(name.to_owned()));
        }
        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(image) => Ok(image),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(FirmwareError::NotFound(path.display().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Images held in memory, keyed by name.
#[derive(Debug, Default)]
pub struct MemFirmware {
    images: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemFirmware {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an image.
    pub fn insert(&self, name: impl Into<String>, image: Vec<u8>) {
        self.images
            .write()
            .expect("poisoned firmware store lock")
            .insert(name.into(), image);
    }
}

impl FirmwareSource for MemFirmware {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, FirmwareError> {
        self.images
            .read()
            .expect("poisoned firmware store lock")
            .get(name)
            .cloned()
            .ok_or_else(|| FirmwareError::NotFound(name.to_owned()))
    }
}

/// Place `image` into memory and return its entry point.
pub fn load_elf(image: &[u8], map: &AddressMap, phys: &PhysMemory) -> Result<u32, FirmwareError> {
    let elf = ElfFile::new(image).map_err(FirmwareError::Elf)?;
    if elf.header.pt1.class() != Class::ThirtyTwo {
        return Err(FirmwareError::Elf("not a 32-bit image"));
    }
    for ph in elf.program_iter() {
        if ph.get_type().map_err(FirmwareError::Elf)? != Type::Load || ph.mem_size() == 0 {
            continue;
        }
        let dsp = u32::try_from(ph.physical_addr())
            .map_err(|_| FirmwareError::Elf("segment address exceeds 32 bits"))?;
        let mem_size = ph.mem_size();
        let file_size = ph.file_size();
        if file_size > mem_size {
            return Err(FirmwareError::Elf("segment file size exceeds memory size"));
        }
        let host = map
            .translate_to_host(dsp)
            .ok()
            .filter(|&host| map.covers(host, mem_size))
            .ok_or(FirmwareError::Untranslatable {
                addr: dsp,
                size: mem_size,
            })?;
        let offset = ph.offset() as usize;
        let data = offset
            .checked_add(file_size as usize)
            .and_then(|end| image.get(offset..end))
            .ok_or(FirmwareError::Elf("segment data beyond end of file"))?;
        phys.write(host, data)?;
        if mem_size > file_size {
            phys.fill(host + file_size, mem_size - file_size, 0)?;
        }
        debug!(
            target: "xrp-fw",
            "[fw] segment dsp={dsp:#x} host={host:#x} file={file_size:#x} mem={mem_size:#x}"
        );
    }
    let entry = u32::try_from(elf.header.pt2.entry_point())
        .map_err(|_| FirmwareError::Elf("entry point exceeds 32 bits"))?;
    info!(target: "xrp-fw", "[fw] image loaded, entry {entry:#x}");
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapEntryConfig;
    use crate::sim::elf::{build_elf32, Segment};
    use tempfile::tempdir;

    fn target() -> (std::sync::Arc<PhysMemory>, AddressMap) {
        let mem = PhysMemory::new();
        mem.add_region(0x9000_0000, 0x10000).unwrap();
        mem.fill(0x9000_0000, 0x10000, 0xee).unwrap();
        let map = AddressMap::new(&[MapEntryConfig {
            src: 0x9000_0000,
            dst: 0x1000_0000,
            size: 0x10000,
        }])
        .unwrap();
        (mem, map)
    }

    #[test]
    fn copies_file_bytes_and_zeroes_bss() {
        let (mem, map) = target();
        let image = build_elf32(
            0x1000_0100,
            &[Segment {
                addr: 0x1000_0100,
                data: b"firmware".to_vec(),
                mem_size: 0x20,
            }],
        );
        let entry = load_elf(&image, &map, &mem).unwrap();
        assert_eq!(entry, 0x1000_0100);
        assert_eq!(mem.read_vec(0x9000_0100, 8).unwrap(), b"firmware");
        assert_eq!(mem.read_vec(0x9000_0108, 0x18).unwrap(), vec![0; 0x18]);
        assert_eq!(mem.read_vec(0x9000_0120, 4).unwrap(), vec![0xee; 4]);
    }

    #[test]
    fn rejects_segments_outside_the_map() {
        let (mem, map) = target();
        let image = build_elf32(
            0,
            &[Segment {
                addr: 0x2000_0000,
                data: vec![1; 4],
                mem_size: 4,
            }],
        );
        assert!(matches!(
            load_elf(&image, &map, &mem),
            Err(FirmwareError::Untranslatable { addr: 0x2000_0000, .. })
        ));
        assert!(matches!(
            load_elf(b"not an elf", &map, &mem),
            Err(FirmwareError::Elf(_))
        ));
    }

    #[test]
    fn directory_source_reads_named_files() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("xrp0.elf"), b"image").expect("write image");
        let source = DirFirmware::new(dir.path());
        assert_eq!(source.fetch("xrp0.elf").unwrap(), b"image");
        assert!(matches!(
            source.fetch("missing.elf"),
            Err(FirmwareError::NotFound(_))
        ));
        assert!(matches!(
            source.fetch("../xrp0.elf"),
            Err(FirmwareError::NotFound(_))
        ));
    }
}
