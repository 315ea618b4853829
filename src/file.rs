// Author: Lukas Bower
// Purpose: Per-open handle: pool-backed allocations and command submission.

//! Driver files.
//!
//! Each open registers with the driver registry so buffers it maps can be
//! recognised as native when they come back in a request, and holds a
//! runtime power reference until it is closed.

use std::sync::Arc;

use log::debug;

use crate::device::Device;
use crate::error::XrpError;
use crate::registry::FileId;
use crate::request::QueueRequest;
use crate::share::{AddressSpace, Sharer, VmaKind};

/// One open of a device node.
#[derive(Debug)]
pub struct DeviceFile {
    device: Arc<Device>,
    id: FileId,
    open: bool,
}

impl DeviceFile {
    /// Open `device`, powering it up if this is the first user.
    pub fn open(device: Arc<Device>) -> Result<Self, XrpError> {
        let id = device.registry().register_file();
        if let Err(err) = device.pm_get() {
            device.registry().unregister_file(id);
            return Err(err);
        }
        debug!(target: "xrp-file", "[open] {} file {}", device.node_name(), id.raw());
        Ok(Self {
            device,
            id,
            open: true,
        })
    }

    /// Registry id of this file.
    #[must_use]
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Device behind the file.
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Allocate `size` bytes from the device pool and map them into `space`.
    pub fn alloc(&self, space: &dyn AddressSpace, size: u64) -> Result<u64, XrpError> {
        if size == 0 {
            return Err(XrpError::invalid("zero-sized allocation"));
        }
        let allocation = self.device.memory().pool.allocate(size, 0)?;
        let phys = allocation.start();
        let vaddr = space.map_driver(self.id, allocation, true)?;
        debug!(target: "xrp-file", "[mmap] {size:#x} bytes phys={phys:#x} at {vaddr:#x}");
        Ok(vaddr)
    }

    /// Unmap an allocation made by [`DeviceFile::alloc`].
    pub fn free(&self, space: &dyn AddressSpace, vaddr: u64) -> Result<(), XrpError> {
        match space.find_vma(vaddr) {
            Some(vma)
                if vma.start == vaddr
                    && matches!(vma.kind, VmaKind::Driver { file, .. } if file == self.id) =>
            {
                space.unmap(vaddr)
            }
            _ => Err(XrpError::invalid(format!(
                "{vaddr:#x} is not an allocation of this file"
            ))),
        }
    }

    /// Run `request` with its user buffers resolved in `space`.
    pub fn submit(&self, space: &dyn AddressSpace, request: &QueueRequest) -> Result<Vec<u8>, XrpError> {
        let sharer = Sharer::new(
            self.device.memory(),
            self.device.registry(),
            Some(self.id),
            space,
        );
        self.device.submit(&sharer, request)
    }

    /// Close the file, dropping its power reference.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.device.registry().unregister_file(self.id);
        self.device.pm_put();
        debug!(target: "xrp-file", "[release] file {}", self.id.raw());
    }
}

impl Drop for DeviceFile {
    fn drop(&mut self) {
        self.release();
    }
}
