// Author: Lukas Bower
// Purpose: Handshake sync words, TLV records and the hardware description blob.

//! Startup handshake encoding.
//!
//! The sync word lives at offset 0 of the communication area (overlapping
//! queue 0's flags word). Protocol v1 places the hardware blob directly after
//! it; protocol v2 reserves three words and then carries a TLV list.

use crate::{align4, read_u32, take, WireError, CMD_STRIDE};

/// Offset of the v1 inline hardware blob.
pub const V1_DATA_OFFSET: usize = 4;
/// Offset of the first v2 TLV.
pub const V2_DATA_OFFSET: usize = 16;
/// Bytes available to the v2 TLV list before it would run into queue 1.
pub const V2_CAPACITY: usize = CMD_STRIDE - V2_DATA_OFFSET;
/// Size of a TLV record header.
pub const TLV_HEADER: usize = 8;
/// Most queues whose priorities still fit the v2 TLV list, next to the
/// hardware blob, the debug info and the terminating record.
pub const V2_MAX_QUEUES: usize =
    (V2_CAPACITY - 4 * TLV_HEADER - HwSyncData::SIZE - DebugInfo::SIZE) / 4;

/// Values exchanged through the sync word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCode {
    /// Channel unused.
    Idle,
    /// Host sent its data and waits for the ack.
    HostToDsp,
    /// DSP acknowledged the host data.
    DspToHost,
    /// Host asks the DSP to start negotiating.
    Start,
    /// DSP speaks protocol v1.
    DspReadyV1,
    /// DSP speaks protocol v2.
    DspReadyV2,
    /// Anything else.
    Unknown(u32),
}

impl SyncCode {
    /// Raw word value.
    #[must_use]
    pub fn raw(self) -> u32 {
        match self {
            Self::Idle => 0,
            Self::HostToDsp => 0x1,
            Self::DspToHost => 0x3,
            Self::Start => 0x101,
            Self::DspReadyV1 => 0x203,
            Self::DspReadyV2 => 0x303,
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<u32> for SyncCode {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Idle,
            0x1 => Self::HostToDsp,
            0x3 => Self::DspToHost,
            0x101 => Self::Start,
            0x203 => Self::DspReadyV1,
            0x303 => Self::DspReadyV2,
            other => Self::Unknown(other),
        }
    }
}

/// TLV record types. The DSP sets [`TlvType::ACCEPT`] on records it understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvType(u32);

impl TlvType {
    /// End of list.
    pub const LAST: TlvType = TlvType(0);
    /// Hardware-specific description blob.
    pub const HW_SPEC_DATA: TlvType = TlvType(1);
    /// Per-queue priority array.
    pub const HW_QUEUES: TlvType = TlvType(2);
    /// Panic log address and firmware log level.
    pub const HW_DEBUG_INFO: TlvType = TlvType(3);
    /// Acceptance bit set by the DSP.
    pub const ACCEPT: u32 = 0x8000_0000;
    /// Mask of the type number.
    pub const MASK: u32 = 0x00ff_ffff;

    /// Wrap a raw type word.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw type word including the accept bit.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Type number without the accept bit.
    #[must_use]
    pub const fn kind(self) -> TlvType {
        TlvType(self.0 & Self::MASK)
    }

    /// Returns true when the DSP accepted the record.
    #[must_use]
    pub const fn accepted(self) -> bool {
        self.0 & Self::ACCEPT != 0
    }

    /// Same type with the accept bit set.
    #[must_use]
    pub const fn accept(self) -> TlvType {
        TlvType(self.0 | Self::ACCEPT)
    }
}

/// One decoded TLV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    /// Type word as found in memory.
    pub kind: TlvType,
    /// Declared length of the value.
    pub len: u32,
    /// Offset of the value relative to the start of the TLV area.
    pub value_offset: usize,
}

/// Serialises TLV records into a bounded byte image.
#[derive(Debug)]
pub struct TlvWriter {
    bytes: Vec<u8>,
    capacity: usize,
}

impl TlvWriter {
    /// Writer bounded by `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::new(),
            capacity,
        }
    }

    /// Append one record; the value is zero padded to four bytes.
    pub fn put(&mut self, kind: TlvType, value: &[u8]) -> Result<usize, WireError> {
        let needed = self.bytes.len() + TLV_HEADER + align4(value.len());
        if needed > self.capacity {
            return Err(WireError::Overflow {
                size: needed,
                capacity: self.capacity,
            });
        }
        let len = u32::try_from(value.len()).map_err(|_| WireError::Overflow {
            size: value.len(),
            capacity: self.capacity,
        })?;
        self.bytes.extend_from_slice(&kind.raw().to_le_bytes());
        self.bytes.extend_from_slice(&len.to_le_bytes());
        let value_offset = self.bytes.len();
        self.bytes.extend_from_slice(value);
        self.bytes.resize(needed, 0);
        Ok(value_offset)
    }

    /// Append the terminating record and return the image.
    pub fn finish(mut self) -> Result<Vec<u8>, WireError> {
        self.put(TlvType::LAST, &[])?;
        Ok(self.bytes)
    }
}

/// Walks a TLV image.
#[derive(Debug)]
pub struct TlvReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> TlvReader<'a> {
    /// Reader over the TLV area.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    /// Next record; `Ok(None)` once [`TlvType::LAST`] is reached.
    pub fn next_record(&mut self) -> Result<Option<Tlv>, WireError> {
        let kind = TlvType::from_raw(read_u32(self.bytes, self.cursor)?);
        let len = read_u32(self.bytes, self.cursor + 4)?;
        if kind.kind() == TlvType::LAST {
            return Ok(None);
        }
        let value_offset = self.cursor + 8;
        take(self.bytes, value_offset, len as usize)?;
        self.cursor = value_offset + align4(len as usize);
        Ok(Some(Tlv {
            kind,
            len,
            value_offset,
        }))
    }

    /// Value bytes of a record returned by this reader.
    pub fn value(&self, tlv: &Tlv) -> Result<&'a [u8], WireError> {
        take(self.bytes, tlv.value_offset, tlv.len as usize)
    }
}

/// Interrupt signalling mode of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum IrqMode {
    /// Polling only.
    #[default]
    None,
    /// Level-triggered: the receiver acknowledges by clearing the bit.
    Level,
    /// Edge-triggered: the sender pulses the bit.
    Edge,
    /// Edge-triggered, the sender waits for the receiver to clear the bit.
    EdgeSw,
}

impl IrqMode {
    /// Value published to the DSP; the DSP sees software edge as plain edge.
    #[must_use]
    pub fn sync_value(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Level => 1,
            Self::Edge | Self::EdgeSw => 2,
        }
    }

    /// Decode the value published to the DSP.
    pub fn from_sync_value(value: u32) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Level),
            2 => Ok(Self::Edge),
            other => Err(WireError::InvalidValue {
                field: "irq_mode",
                value: other,
            }),
        }
    }
}

/// Hardware description for the simple register-based DSP integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwSyncData {
    /// DSP-visible base of the interrupt register block.
    pub device_mmio_base: u32,
    /// How the DSP notifies the host.
    pub host_irq_mode: u32,
    /// Offset of the host interrupt register seen from the DSP.
    pub host_irq_offset: u32,
    /// Bit the DSP sets to interrupt the host.
    pub host_irq_bit: u32,
    /// How the host notifies the DSP.
    pub device_irq_mode: u32,
    /// Offset of the DSP interrupt register seen from the DSP.
    pub device_irq_offset: u32,
    /// Bit the host sets to interrupt the DSP.
    pub device_irq_bit: u32,
    /// DSP interrupt number.
    pub device_irq: u32,
}

impl HwSyncData {
    /// Encoded size.
    pub const SIZE: usize = 32;

    /// Encode into the little-endian wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        [
            self.device_mmio_base,
            self.host_irq_mode,
            self.host_irq_offset,
            self.host_irq_bit,
            self.device_irq_mode,
            self.device_irq_offset,
            self.device_irq_bit,
            self.device_irq,
        ]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
    }

    /// Decode from the wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let raw = take(bytes, 0, Self::SIZE)?;
        Ok(Self {
            device_mmio_base: read_u32(raw, 0)?,
            host_irq_mode: read_u32(raw, 4)?,
            host_irq_offset: read_u32(raw, 8)?,
            host_irq_bit: read_u32(raw, 12)?,
            device_irq_mode: read_u32(raw, 16)?,
            device_irq_offset: read_u32(raw, 20)?,
            device_irq_bit: read_u32(raw, 24)?,
            device_irq: read_u32(raw, 28)?,
        })
    }
}

/// Debug channel parameters handed to the firmware in protocol v2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugInfo {
    /// Physical address of the panic/log record.
    pub panic_addr: u32,
    /// Firmware log verbosity.
    pub log_level: u32,
}

impl DebugInfo {
    /// Encoded size.
    pub const SIZE: usize = 8;

    /// Encode into the little-endian wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.panic_addr.to_le_bytes());
        out[4..8].copy_from_slice(&self.log_level.to_le_bytes());
        out
    }

    /// Decode from the wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            panic_addr: read_u32(bytes, 0)?,
            log_level: read_u32(bytes, 4)?,
        })
    }
}

/// Encode a `u32` array as little-endian bytes.
#[must_use]
pub fn encode_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Decode a little-endian `u32` array.
pub fn decode_words(bytes: &[u8]) -> Result<Vec<u32>, WireError> {
    (0..bytes.len() / 4).map(|idx| read_u32(bytes, idx * 4)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_codes_match_protocol_values() {
        assert_eq!(SyncCode::Start.raw(), 0x101);
        assert_eq!(SyncCode::from(0x303), SyncCode::DspReadyV2);
        assert_eq!(SyncCode::from(0x777), SyncCode::Unknown(0x777));
    }

    #[test]
    fn writer_pads_values_and_reader_walks_them() {
        let mut writer = TlvWriter::new(V2_CAPACITY);
        writer.put(TlvType::HW_SPEC_DATA, &[1, 2, 3, 4, 5]).unwrap();
        writer.put(TlvType::HW_QUEUES, &encode_words(&[2, 1])).unwrap();
        let image = writer.finish().unwrap();
        assert_eq!(image.len(), 8 + 8 + 8 + 8 + 8);

        let mut reader = TlvReader::new(&image);
        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.kind, TlvType::HW_SPEC_DATA);
        assert_eq!(reader.value(&first).unwrap(), &[1, 2, 3, 4, 5]);
        let second = reader.next_record().unwrap().unwrap();
        assert_eq!(decode_words(reader.value(&second).unwrap()).unwrap(), vec![2, 1]);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn writer_refuses_to_spill_into_next_queue() {
        let mut writer = TlvWriter::new(V2_CAPACITY);
        let err = writer.put(TlvType::HW_SPEC_DATA, &[0u8; V2_CAPACITY]).unwrap_err();
        assert!(matches!(err, WireError::Overflow { .. }));
    }

    #[test]
    fn accept_bit_is_separate_from_kind() {
        let accepted = TlvType::HW_QUEUES.accept();
        assert!(accepted.accepted());
        assert_eq!(accepted.kind(), TlvType::HW_QUEUES);
    }

    #[test]
    fn largest_queue_list_fits_the_v2_area() {
        let mut writer = TlvWriter::new(V2_CAPACITY);
        writer.put(TlvType::HW_SPEC_DATA, &[0; HwSyncData::SIZE]).unwrap();
        writer.put(TlvType::HW_QUEUES, &[0; 4 * V2_MAX_QUEUES]).unwrap();
        writer.put(TlvType::HW_DEBUG_INFO, &[0; DebugInfo::SIZE]).unwrap();
        assert_eq!(writer.finish().unwrap().len(), V2_CAPACITY);

        let mut writer = TlvWriter::new(V2_CAPACITY);
        writer.put(TlvType::HW_SPEC_DATA, &[0; HwSyncData::SIZE]).unwrap();
        writer.put(TlvType::HW_QUEUES, &[0; 4 * (V2_MAX_QUEUES + 1)]).unwrap();
        writer.put(TlvType::HW_DEBUG_INFO, &[0; DebugInfo::SIZE]).unwrap();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn software_edge_is_published_as_edge() {
        assert_eq!(IrqMode::EdgeSw.sync_value(), IrqMode::Edge.sync_value());
        assert!(IrqMode::from_sync_value(9).is_err());
    }
}
