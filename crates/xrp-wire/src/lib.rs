// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared-memory layout and codec primitives for the XRP host/DSP protocol.
//!
//! Everything here is plain byte layout: the host driver and the simulated
//! DSP firmware both encode and decode through these helpers, so the two
//! sides can never disagree on an offset.

use bitflags::bitflags;
use static_assertions::const_assert;

pub mod panic;
pub mod ps;
pub mod sync;

pub use sync::{DebugInfo, HwSyncData, IrqMode, SyncCode, Tlv, TlvReader, TlvType, TlvWriter};

/// Inline payload capacity of a command record, in bytes.
pub const INLINE_DATA_SIZE: usize = 16;
/// Number of buffer descriptors carried inline in a command record.
pub const INLINE_BUFFER_COUNT: usize = 1;
/// Size of the namespace identifier carried by a command record.
pub const NAMESPACE_ID_SIZE: usize = 16;
/// Distance between consecutive queue records in the communication area.
pub const CMD_STRIDE: usize = 128;

/// Sentinel returned by address translation when no window matches.
pub const NO_TRANSLATION: u32 = u32::MAX;

/// Byte offsets of the fields inside one command record.
pub mod cmd {
    /// Request/response flags word. Doubles as the sync word during handshake.
    pub const FLAGS: usize = 0;
    /// Input payload size.
    pub const IN_DATA_SIZE: usize = 4;
    /// Output payload size.
    pub const OUT_DATA_SIZE: usize = 8;
    /// Size in bytes of the buffer descriptor array.
    pub const BUFFER_SIZE: usize = 12;
    /// Inline input payload or its DSP address.
    pub const IN_DATA: usize = 16;
    /// Inline output payload or its DSP address.
    pub const OUT_DATA: usize = 32;
    /// Inline buffer descriptors or the DSP address of the descriptor array.
    pub const BUFFER_DATA: usize = 48;
    /// Namespace identifier.
    pub const NSID: usize = 64;
    /// Device-to-host command notification word.
    pub const CMD_FLAG: usize = 80;
    /// Pending report id, tagged with [`super::REPORT_TO_HOST_FLAG`].
    pub const REPORT_ID: usize = 84;
    /// DSP address of the report payload area.
    pub const REPORT_ADDR: usize = 88;
    /// Report payload capacity.
    pub const REPORT_BUFFER_SIZE: usize = 92;
    /// Report channel status, see [`super::ReportStatus`].
    pub const REPORT_STATUS: usize = 96;
    /// Total bytes used by one record.
    pub const RECORD_SIZE: usize = 100;
}

const_assert!(cmd::RECORD_SIZE <= CMD_STRIDE);
const_assert!(cmd::BUFFER_DATA + INLINE_BUFFER_COUNT * DspBuffer::SIZE <= cmd::NSID);

/// Bit set by the DSP in `cmd_flag` and `report_id` when the host has work.
pub const REPORT_TO_HOST_FLAG: u32 = 0x8000_0000;
/// Mask extracting the report id from the `report_id` word.
pub const REPORT_ID_MASK: u32 = 0xffff;

bitflags! {
    /// Flags word of a command record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CmdFlags: u32 {
        /// Host has published a request.
        const REQUEST_VALID = 0x0000_0001;
        /// DSP has published the response.
        const RESPONSE_VALID = 0x0000_0002;
        /// The namespace id field is meaningful.
        const REQUEST_NSID = 0x0000_0004;
        /// DSP could not deliver the request to a handler.
        const RESPONSE_DELIVERY_FAIL = 0x0000_0008;
    }
}

impl CmdFlags {
    /// Returns true when both request and response flags are present.
    #[must_use]
    pub fn is_complete(self) -> bool {
        self.contains(Self::REQUEST_VALID | Self::RESPONSE_VALID)
    }
}

bitflags! {
    /// Access direction of a shared buffer, from the DSP's point of view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// DSP reads the buffer.
        const READ = 0x1;
        /// DSP writes the buffer.
        const WRITE = 0x2;
        /// DSP both reads and writes the buffer.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

bitflags! {
    /// Submission flags accepted from callers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueueFlags: u32 {
        /// Carry the namespace id with the request.
        const NSID = 0x4;
        /// Priority hint field.
        const PRIO = 0xff00;
    }
}

/// Shift of the priority hint inside [`QueueFlags::PRIO`].
pub const QUEUE_FLAG_PRIO_SHIFT: u32 = 8;

impl QueueFlags {
    /// Build flags from a priority hint and namespace usage.
    #[must_use]
    pub fn with_priority(priority: u8, nsid: bool) -> Self {
        let mut flags =
            Self::from_bits_retain((u32::from(priority) << QUEUE_FLAG_PRIO_SHIFT) & Self::PRIO.bits());
        if nsid {
            flags |= Self::NSID;
        }
        flags
    }

    /// Priority hint carried by the flags.
    #[must_use]
    pub fn priority(self) -> u32 {
        (self.bits() & Self::PRIO.bits()) >> QUEUE_FLAG_PRIO_SHIFT
    }

    /// Returns true when no bits outside the accepted set are present.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.bits() & !Self::all().bits() == 0
    }
}

/// Status of the report channel published in queue 0's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReportStatus {
    /// No report buffer is registered.
    Invalid = 0,
    /// The DSP may post reports.
    Working = 1,
}

/// Buffer descriptor as seen by the DSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DspBuffer {
    /// Access direction.
    pub flags: BufferFlags,
    /// Size in bytes.
    pub size: u32,
    /// DSP-visible address.
    pub addr: u32,
}

impl DspBuffer {
    /// Encoded size of one descriptor.
    pub const SIZE: usize = 12;

    /// Encode into the little-endian wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.addr.to_le_bytes());
        out
    }

    /// Decode one descriptor from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let raw = take(bytes, 0, Self::SIZE)?;
        Ok(Self {
            flags: BufferFlags::from_bits_retain(read_u32(raw, 0)?),
            size: read_u32(raw, 4)?,
            addr: read_u32(raw, 8)?,
        })
    }

    /// Encode a descriptor array back to back.
    #[must_use]
    pub fn encode_all(buffers: &[DspBuffer]) -> Vec<u8> {
        buffers.iter().flat_map(|b| b.encode()).collect()
    }

    /// Decode `count` descriptors laid out back to back.
    pub fn decode_all(bytes: &[u8], count: usize) -> Result<Vec<DspBuffer>, WireError> {
        (0..count)
            .map(|idx| DspBuffer::decode(take(bytes, idx * Self::SIZE, Self::SIZE)?))
            .collect()
    }
}

/// Errors produced while encoding or decoding shared-memory records.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// Input was shorter than the structure being decoded.
    #[error("truncated record: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        /// Offset of the field being read.
        offset: usize,
        /// Bytes the field requires.
        needed: usize,
        /// Bytes available in the input.
        available: usize,
    },
    /// Encoded records do not fit in the space reserved for them.
    #[error("payload of {size} bytes exceeds capacity {capacity}")]
    Overflow {
        /// Size the encoder wanted to write.
        size: usize,
        /// Space available.
        capacity: usize,
    },
    /// A command word does not name a known common-namespace command.
    #[error("unknown command {0}")]
    UnknownCommand(u32),
    /// A field carried a value outside its enumeration.
    #[error("invalid value {value:#x} for {field}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Value observed.
        value: u32,
    },
}

pub(crate) fn take(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8], WireError> {
    offset
        .checked_add(len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(WireError::Truncated {
            offset,
            needed: len,
            available: bytes.len(),
        })
}

/// Read a little-endian `u32` at `offset`.
pub fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, WireError> {
    let raw = take(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Read a little-endian `u64` at `offset`.
pub fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, WireError> {
    let lo = read_u32(bytes, offset)?;
    let hi = read_u32(bytes, offset + 4)?;
    Ok(u64::from(lo) | (u64::from(hi) << 32))
}

/// Round `len` up to the 4-byte granularity used by TLV values.
#[must_use]
pub const fn align4(len: usize) -> usize {
    (len + 3) & !3
}
