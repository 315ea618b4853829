// Author: Lukas Bower
// Purpose: DMA-buf exporter handing out buffers carved from a simulator range.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;
use spin::Mutex as SpinMutex;

use crate::config::RegionConfig;
use crate::dmabuf::{DmaBufExporter, DmaBufFd, DmaSegment};
use crate::error::XrpError;
use crate::hal::{align_up, PhysMemory, PAGE_SIZE};

#[derive(Debug, Default)]
struct ExportState {
    next: u64,
    buffers: BTreeMap<DmaBufFd, Vec<DmaSegment>>,
}

/// Exporter standing in for a camera or display driver.
#[derive(Debug)]
pub struct SimDmaBufExporter {
    memory: Arc<PhysMemory>,
    region: RegionConfig,
    state: SpinMutex<ExportState>,
    next_fd: AtomicU32,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
}

impl SimDmaBufExporter {
    /// Exporter carving buffers from `region`.
    #[must_use]
    pub fn new(memory: Arc<PhysMemory>, region: RegionConfig) -> Self {
        Self {
            memory,
            region,
            state: SpinMutex::new(ExportState {
                next: region.base,
                buffers: BTreeMap::new(),
            }),
            next_fd: AtomicU32::new(3),
            attaches: AtomicUsize::new(0),
            detaches: AtomicUsize::new(0),
        }
    }

    /// Export a buffer of `segments` pieces of `segment_size` bytes each.
    ///
    /// Pieces are separated by a one-page hole so a multi-segment buffer is
    /// never physically contiguous.
    pub fn create(&self, segment_size: u64, segments: usize) -> Result<DmaBufFd, XrpError> {
        if segment_size == 0 || segments == 0 {
            return Err(XrpError::invalid("empty dma-buf"));
        }
        let stride = align_up(segment_size, PAGE_SIZE) + PAGE_SIZE;
        let mut state = self.state.lock();
        let end = state.next + stride * segments as u64;
        if end > self.region.base + self.region.size {
            return Err(XrpError::OutOfMemory {
                size: segment_size * segments as u64,
            });
        }
        let pieces: Vec<DmaSegment> = (0..segments as u64)
            .map(|idx| DmaSegment {
                phys: state.next + idx * stride,
                len: segment_size,
            })
            .collect();
        for piece in &pieces {
            self.memory.fill(piece.phys, piece.len, 0)?;
        }
        state.next = end;
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        trace!(target: "xrp-sim", "[exporter] fd {fd}: {pieces:x?}");
        state.buffers.insert(fd, pieces);
        Ok(fd)
    }

    /// Scatter list of `fd`.
    #[must_use]
    pub fn segments(&self, fd: DmaBufFd) -> Option<Vec<DmaSegment>> {
        self.state.lock().buffers.get(&fd).cloned()
    }

    /// `(attaches, detaches)` seen so far.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        (
            self.attaches.load(Ordering::Relaxed),
            self.detaches.load(Ordering::Relaxed),
        )
    }
}

impl DmaBufExporter for SimDmaBufExporter {
    fn attach(&self, fd: DmaBufFd) -> Result<Vec<DmaSegment>, XrpError> {
        let segments = self
            .segments(fd)
            .ok_or_else(|| XrpError::invalid(format!("unknown dma-buf fd {fd}")))?;
        self.attaches.fetch_add(1, Ordering::Relaxed);
        Ok(segments)
    }

    fn detach(&self, _fd: DmaBufFd) {
        self.detaches.fetch_add(1, Ordering::Relaxed);
    }
}
