// Author: Lukas Bower
// Purpose: Translate a caller request into what a command record can carry.

//! Request mapping.
//!
//! A [`QueueRequest`] names caller memory; [`MappedRequest::map`] shares
//! every piece of it with the DSP and keeps the resulting [`Mapping`]s so
//! [`MappedRequest::unmap`] (after a completed command) or
//! [`MappedRequest::unmap_nowb`] (after a failure) can reverse them. Payloads
//! of up to [`INLINE_DATA_SIZE`] bytes travel inside the record itself.

use log::{debug, trace};
use xrp_wire::{
    BufferFlags, DspBuffer, QueueFlags, INLINE_BUFFER_COUNT, INLINE_DATA_SIZE, NAMESPACE_ID_SIZE,
    NO_TRANSLATION,
};

use crate::error::XrpError;
use crate::pool::Allocation;
use crate::share::{Mapping, Sharer};

/// Input payload of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InData {
    /// Caller memory.
    User {
        /// User virtual address.
        addr: u64,
        /// Length.
        size: u32,
    },
    /// Bytes produced by the driver itself.
    Kernel(Vec<u8>),
}

impl InData {
    fn size(&self) -> u32 {
        match self {
            Self::User { size, .. } => *size,
            Self::Kernel(bytes) => bytes.len() as u32,
        }
    }
}

/// Output payload of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutData {
    /// Caller memory receiving the response.
    User {
        /// User virtual address.
        addr: u64,
        /// Length.
        size: u32,
    },
    /// Response returned to the driver.
    Kernel {
        /// Expected length.
        size: u32,
    },
}

impl OutData {
    fn size(&self) -> u32 {
        match self {
            Self::User { size, .. } | Self::Kernel { size } => *size,
        }
    }
}

/// One caller buffer attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    /// Access direction seen from the DSP.
    pub flags: BufferFlags,
    /// User virtual address.
    pub addr: u64,
    /// Length.
    pub size: u32,
}

/// A synchronous command as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRequest {
    /// Priority hint and namespace flag.
    pub flags: QueueFlags,
    /// Namespace the command is addressed to.
    pub nsid: Option<[u8; NAMESPACE_ID_SIZE]>,
    /// Input payload.
    pub in_data: InData,
    /// Output payload.
    pub out_data: OutData,
    /// Attached buffers.
    pub buffers: Vec<BufferSpec>,
}

impl QueueRequest {
    /// Request carrying driver-owned payloads to `nsid`.
    #[must_use]
    pub fn kernel(nsid: [u8; NAMESPACE_ID_SIZE], in_data: Vec<u8>, out_size: u32) -> Self {
        Self {
            flags: QueueFlags::NSID,
            nsid: Some(nsid),
            in_data: InData::Kernel(in_data),
            out_data: OutData::Kernel { size: out_size },
            buffers: Vec::new(),
        }
    }
}

/// A payload as it appears in the command record.
#[derive(Debug)]
pub(crate) enum Payload {
    /// Carried inside the record.
    Inline(Vec<u8>),
    /// Shared out of line.
    Shared {
        /// DSP address written into the record.
        dsp: u32,
        /// How the memory was shared.
        mapping: Mapping,
        /// Driver-owned backing for kernel payloads.
        backing: Option<Allocation>,
    },
}

impl Payload {
    fn take_mapping(&mut self) -> Mapping {
        match self {
            Self::Shared { mapping, .. } => std::mem::replace(mapping, Mapping::None),
            Self::Inline(_) => Mapping::None,
        }
    }
}

/// Out-of-line descriptor array for requests with several buffers.
#[derive(Debug)]
pub(crate) struct DescriptorTable {
    pub(crate) dsp: u32,
    backing: Allocation,
    mapping: Mapping,
}

/// A request whose memory has been shared with the DSP.
#[derive(Debug)]
pub struct MappedRequest {
    pub(crate) flags: QueueFlags,
    pub(crate) nsid: Option<[u8; NAMESPACE_ID_SIZE]>,
    pub(crate) in_size: u32,
    pub(crate) out_size: u32,
    pub(crate) in_payload: Payload,
    pub(crate) out_payload: Payload,
    out_target: OutData,
    pub(crate) buffers: Vec<DspBuffer>,
    buffer_mappings: Vec<Mapping>,
    pub(crate) descriptors: Option<DescriptorTable>,
}

fn dsp_address(sharer: &Sharer<'_>, phys: u64) -> u32 {
    sharer.memory().translate(phys).unwrap_or(NO_TRANSLATION)
}

impl MappedRequest {
    fn empty(request: &QueueRequest) -> Self {
        Self {
            flags: request.flags,
            nsid: request.nsid,
            in_size: request.in_data.size(),
            out_size: request.out_data.size(),
            in_payload: Payload::Inline(Vec::new()),
            out_payload: Payload::Inline(vec![0; request.out_data.size().min(INLINE_DATA_SIZE as u32) as usize]),
            out_target: request.out_data,
            buffers: Vec::with_capacity(request.buffers.len()),
            buffer_mappings: Vec::with_capacity(request.buffers.len()),
            descriptors: None,
        }
    }

    /// Share everything `request` names.
    ///
    /// On failure every piece shared so far is released again.
    pub fn map(sharer: &Sharer<'_>, request: &QueueRequest) -> Result<Self, XrpError> {
        if !request.flags.is_valid() {
            return Err(XrpError::invalid(format!(
                "invalid queue flags {:#x}",
                request.flags.bits()
            )));
        }
        if request.flags.contains(QueueFlags::NSID) && request.nsid.is_none() {
            return Err(XrpError::invalid("namespace flag without a namespace id"));
        }
        let mut mapped = Self::empty(request);
        match mapped.map_parts(sharer, request) {
            Ok(()) => Ok(mapped),
            Err(err) => {
                debug!(target: "xrp-queue", "[request] mapping failed: {err}");
                mapped.unmap_nowb(sharer);
                Err(err)
            }
        }
    }

    fn map_parts(&mut self, sharer: &Sharer<'_>, request: &QueueRequest) -> Result<(), XrpError> {
        self.in_payload = match &request.in_data {
            InData::User { addr, size } if *size as usize > INLINE_DATA_SIZE => {
                let (phys, mapping) = sharer.share(*addr, u64::from(*size), BufferFlags::READ)?;
                Payload::Shared {
                    dsp: dsp_address(sharer, phys),
                    mapping,
                    backing: None,
                }
            }
            InData::User { addr, size } => {
                let mut inline = vec![0u8; *size as usize];
                sharer.space().copy_from_user(*addr, &mut inline)?;
                Payload::Inline(inline)
            }
            InData::Kernel(bytes) if bytes.len() > INLINE_DATA_SIZE => {
                let backing = sharer.memory().pool.allocate(bytes.len() as u64, 0)?;
                sharer.memory().phys.write(backing.start(), bytes)?;
                let (phys, mapping) =
                    sharer.share_kernel(backing.start(), bytes.len() as u64, BufferFlags::READ)?;
                Payload::Shared {
                    dsp: dsp_address(sharer, phys),
                    mapping,
                    backing: Some(backing),
                }
            }
            InData::Kernel(bytes) => Payload::Inline(bytes.clone()),
        };

        match request.out_data {
            OutData::User { addr, size } if size as usize > INLINE_DATA_SIZE => {
                let (phys, mapping) = sharer.share(addr, u64::from(size), BufferFlags::WRITE)?;
                self.out_payload = Payload::Shared {
                    dsp: dsp_address(sharer, phys),
                    mapping,
                    backing: None,
                };
            }
            OutData::Kernel { size } if size as usize > INLINE_DATA_SIZE => {
                let backing = sharer.memory().pool.allocate(u64::from(size), 0)?;
                let (phys, mapping) =
                    sharer.share_kernel(backing.start(), u64::from(size), BufferFlags::WRITE)?;
                self.out_payload = Payload::Shared {
                    dsp: dsp_address(sharer, phys),
                    mapping,
                    backing: Some(backing),
                };
            }
            _ => {}
        }

        for (idx, spec) in request.buffers.iter().enumerate() {
            let (addr, mapping) = if spec.flags.intersects(BufferFlags::READ_WRITE) {
                let (phys, mapping) = sharer.share(spec.addr, u64::from(spec.size), spec.flags)?;
                (dsp_address(sharer, phys), mapping)
            } else {
                (NO_TRANSLATION, Mapping::None)
            };
            trace!(target: "xrp-queue", "[request] buffer {idx} -> {addr:#x} ({})", mapping.kind_name());
            self.buffer_mappings.push(mapping);
            self.buffers.push(DspBuffer {
                flags: spec.flags,
                size: spec.size,
                addr,
            });
        }

        if self.buffers.len() > INLINE_BUFFER_COUNT {
            let encoded = DspBuffer::encode_all(&self.buffers);
            let backing = sharer.memory().pool.allocate(encoded.len() as u64, 0)?;
            sharer.memory().phys.write(backing.start(), &encoded)?;
            let (phys, mapping) = sharer.share_kernel(
                backing.start(),
                encoded.len() as u64,
                BufferFlags::READ_WRITE,
            )?;
            self.descriptors = Some(DescriptorTable {
                dsp: dsp_address(sharer, phys),
                backing,
                mapping,
            });
        }
        Ok(())
    }

    /// Bytes of buffer descriptors announced in the record.
    #[must_use]
    pub fn buffer_bytes(&self) -> u32 {
        (self.buffers.len() * DspBuffer::SIZE) as u32
    }

    /// Descriptors as last seen by the host.
    #[must_use]
    pub fn buffers(&self) -> &[DspBuffer] {
        &self.buffers
    }

    /// Release everything without propagating DSP output.
    pub fn unmap_nowb(mut self, sharer: &Sharer<'_>) {
        let none = BufferFlags::empty();
        let _ = sharer.unshare(self.in_payload.take_mapping(), none);
        let _ = sharer.unshare(self.out_payload.take_mapping(), none);
        for mapping in self.buffer_mappings.drain(..) {
            let _ = sharer.unshare(mapping, none);
        }
        if let Some(table) = self.descriptors.take() {
            let _ = sharer.unshare(table.mapping, none);
        }
    }

    /// Release everything after a completed command and deliver its output.
    ///
    /// Returns the output payload for driver-owned requests; user output is
    /// written back to the caller and an empty vector is returned.
    pub fn unmap(mut self, sharer: &Sharer<'_>) -> Result<Vec<u8>, XrpError> {
        let mut result = Ok(());
        let _ = sharer.unshare(self.in_payload.take_mapping(), BufferFlags::READ);

        let mut output = Vec::new();
        match &mut self.out_payload {
            Payload::Shared {
                mapping, backing, ..
            } => {
                let mapping = std::mem::replace(mapping, Mapping::None);
                if let Err(err) = sharer.unshare(mapping, BufferFlags::WRITE) {
                    debug!(target: "xrp-queue", "[request] out_data could not be unshared: {err}");
                    result = result.and(Err(err));
                }
                if let Some(backing) = backing {
                    match sharer.memory().phys.read_vec(backing.start(), self.out_size as usize) {
                        Ok(bytes) => output = bytes,
                        Err(err) => {
                            debug!(target: "xrp-queue", "[request] out_data could not be read: {err}");
                            result = result.and(Err(err.into()));
                        }
                    }
                }
            }
            Payload::Inline(bytes) => match self.out_target {
                OutData::User { addr, .. } => {
                    if let Err(err) = sharer.space().copy_to_user(addr, bytes) {
                        debug!(target: "xrp-queue", "[request] out_data could not be copied");
                        result = result.and(Err(err));
                    }
                }
                OutData::Kernel { .. } => output = std::mem::take(bytes),
            },
        }

        if let Some(table) = self.descriptors.take() {
            let _ = sharer.unshare(table.mapping, BufferFlags::READ_WRITE);
            let decoded = sharer
                .memory()
                .phys
                .read_vec(table.backing.start(), self.buffer_bytes() as usize)
                .map_err(XrpError::from)
                .and_then(|raw| Ok(DspBuffer::decode_all(&raw, self.buffers.len())?));
            match decoded {
                Ok(buffers) => self.buffers = buffers,
                // Host-side flags still drive the unshare below.
                Err(err) => {
                    debug!(target: "xrp-queue", "[request] descriptors could not be read back: {err}");
                    result = result.and(Err(err));
                }
            }
        }

        for (idx, mapping) in self.buffer_mappings.drain(..).enumerate() {
            let flags = self.buffers.get(idx).map_or(BufferFlags::empty(), |b| b.flags);
            if let Err(err) = sharer.unshare(mapping, flags) {
                debug!(target: "xrp-queue", "[request] buffer {idx} could not be unshared: {err}");
                result = result.and(Err(err));
            }
        }
        result.map(|()| output)
    }

    /// Abandon every mapping; the DSP may still be using the memory.
    pub fn leak(mut self) {
        self.in_payload.take_mapping().leak();
        self.out_payload.take_mapping().leak();
        for payload in [&mut self.in_payload, &mut self.out_payload] {
            if let Payload::Shared { backing, .. } = payload {
                if let Some(backing) = backing.take() {
                    backing.leak();
                }
            }
        }
        for mapping in self.buffer_mappings.drain(..) {
            mapping.leak();
        }
        if let Some(table) = self.descriptors.take() {
            table.mapping.leak();
            table.backing.leak();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{align_down, PhysMemory, PAGE_SIZE};
    use crate::registry::Registry;
    use crate::share::DeviceMemory;
    use crate::sim::{SimAddressSpace, SimPlatform};

    #[test]
    fn failed_output_read_still_releases_every_buffer() {
        let platform = SimPlatform::new();
        let space = SimAddressSpace::new(platform.memory(), platform.pages());
        // Pool bookkeeping without memory behind it, so reading the output fails.
        let mem = DeviceMemory {
            phys: PhysMemory::new(),
            ..platform.device_memory()
        };
        let registry = Registry::new();
        let sharer = Sharer::new(&mem, &registry, None, space.as_ref());
        let buffer = space.alloc_anonymous(PAGE_SIZE, true).unwrap();
        let request = QueueRequest {
            flags: QueueFlags::empty(),
            nsid: None,
            in_data: InData::Kernel(Vec::new()),
            out_data: OutData::Kernel { size: 64 },
            buffers: vec![BufferSpec {
                flags: BufferFlags::READ_WRITE,
                addr: buffer,
                size: 0x100,
            }],
        };

        let mapped = MappedRequest::map(&sharer, &request).unwrap();
        let page = align_down(space.resolve(buffer).unwrap(), PAGE_SIZE);
        assert_eq!(space.pin_count(page), 1);

        assert!(matches!(mapped.unmap(&sharer), Err(XrpError::Hal(_))));
        assert_eq!(space.pin_count(page), 0);
        assert!(space.is_dirty(page));
    }
}
