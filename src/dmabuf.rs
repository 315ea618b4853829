// Author: Lukas Bower
// Purpose: Reference-counted registry of imported DMA-buf attachments.

//! DMA-buf import.
//!
//! A buffer exported by another driver is attached once, mapped into the
//! importing address space and shared by every caller naming the same
//! handle. The attachment is owned by exactly one table entry; dropping the
//! last reference unmaps the buffer and detaches from the exporter.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use spin::Mutex as SpinMutex;
use xrp_wire::BufferFlags;

use crate::error::XrpError;
use crate::share::{AddressSpace, DeviceMemory};

/// Descriptor naming an exported buffer.
pub type DmaBufFd = u32;

/// Physically contiguous piece of an exported buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    /// Physical base.
    pub phys: u64,
    /// Length in bytes.
    pub len: u64,
}

/// Driver exporting DMA-bufs.
pub trait DmaBufExporter: Send + Sync {
    /// Attach to `fd` and return its scatter list.
    fn attach(&self, fd: DmaBufFd) -> Result<Vec<DmaSegment>, XrpError>;
    /// Drop an attachment made by [`DmaBufExporter::attach`].
    fn detach(&self, fd: DmaBufFd);
}

/// Live attachment; detaches when dropped.
pub struct Attachment {
    exporter: Arc<dyn DmaBufExporter>,
    fd: DmaBufFd,
    segments: Vec<DmaSegment>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("fd", &self.fd)
            .field("segments", &self.segments)
            .finish()
    }
}

impl Attachment {
    fn new(exporter: Arc<dyn DmaBufExporter>, fd: DmaBufFd) -> Result<Self, XrpError> {
        let segments = exporter.attach(fd)?;
        Ok(Self {
            exporter,
            fd,
            segments,
        })
    }

    /// Scatter list.
    #[must_use]
    pub fn segments(&self) -> &[DmaSegment] {
        &self.segments
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.exporter.detach(self.fd);
    }
}

#[derive(Debug)]
struct Imported {
    attachment: Attachment,
    vaddr: u64,
    refs: usize,
}

impl Imported {
    fn segment(&self) -> DmaSegment {
        self.attachment.segments[0]
    }
}

/// Buffers imported by one device.
pub struct DmaBufTable {
    exporter: Arc<dyn DmaBufExporter>,
    entries: SpinMutex<BTreeMap<DmaBufFd, Imported>>,
}

impl fmt::Debug for DmaBufTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBufTable")
            .field("imported", &self.entries.lock().len())
            .finish()
    }
}

impl DmaBufTable {
    /// Empty table importing from `exporter`.
    #[must_use]
    pub fn new(exporter: Arc<dyn DmaBufExporter>) -> Self {
        Self {
            exporter,
            entries: SpinMutex::new(BTreeMap::new()),
        }
    }

    /// Map `fd` into `space`, attaching on first use; returns the mapping address.
    pub fn import(
        &self,
        space: &dyn AddressSpace,
        fd: DmaBufFd,
        flags: BufferFlags,
    ) -> Result<u64, XrpError> {
        if let Some(entry) = self.entries.lock().get_mut(&fd) {
            entry.refs += 1;
            return Ok(entry.vaddr);
        }
        if !flags.intersects(BufferFlags::READ_WRITE) {
            return Err(XrpError::invalid("dma-buf import without access flags"));
        }
        let attachment = Attachment::new(Arc::clone(&self.exporter), fd)?;
        let [segment] = attachment.segments() else {
            warn!(
                target: "xrp-dmabuf",
                "[dmabuf] fd {fd} has {} segments, need one",
                attachment.segments().len()
            );
            return Err(XrpError::invalid("dma-buf is not physically contiguous"));
        };
        let vaddr = space.map_pfn(segment.phys, segment.len, true)?;
        debug!(
            target: "xrp-dmabuf",
            "[dmabuf] import fd {fd} phys={:#x} len={:#x} at {vaddr:#x}",
            segment.phys,
            segment.len
        );

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&fd) {
            entry.refs += 1;
            let existing = entry.vaddr;
            drop(entries);
            space.unmap(vaddr)?;
            return Ok(existing);
        }
        entries.insert(
            fd,
            Imported {
                attachment,
                vaddr,
                refs: 1,
            },
        );
        Ok(vaddr)
    }

    /// Drop one reference to `fd`; the last one unmaps and detaches.
    pub fn release(&self, space: &dyn AddressSpace, fd: DmaBufFd) -> Result<(), XrpError> {
        let removed = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(&fd)
                .ok_or(XrpError::Fault { addr: u64::from(fd) })?;
            entry.refs -= 1;
            if entry.refs > 0 {
                return Ok(());
            }
            entries.remove(&fd)
        };
        if let Some(entry) = removed {
            debug!(target: "xrp-dmabuf", "[dmabuf] release fd {fd}");
            space.unmap(entry.vaddr)?;
        }
        Ok(())
    }

    /// Hand `fd` to the CPU (READ), to the device (WRITE), or both.
    pub fn sync(&self, mem: &DeviceMemory, fd: DmaBufFd, flags: BufferFlags) -> Result<(), XrpError> {
        let segment = self
            .entries
            .lock()
            .get(&fd)
            .map(Imported::segment)
            .ok_or(XrpError::Fault { addr: u64::from(fd) })?;
        if flags.contains(BufferFlags::READ) {
            mem.sync_for_cpu(segment.phys, segment.len, flags);
        }
        if flags.contains(BufferFlags::WRITE) {
            mem.sync_for_device(segment.phys, segment.len, flags);
        }
        Ok(())
    }

    /// References held on `fd`.
    #[must_use]
    pub fn ref_count(&self, fd: DmaBufFd) -> usize {
        self.entries.lock().get(&fd).map_or(0, |e| e.refs)
    }
}
