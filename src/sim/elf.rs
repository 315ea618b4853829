// Author: Lukas Bower
// Purpose: Build small ELF32 images for the simulated DSP.

//! Minimal little-endian ELF32 writer.
//!
//! Only what the firmware loader consumes is emitted: the file header and
//! one `PT_LOAD` program header per segment. No section headers.

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const EM_XTENSA: u16 = 94;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const PF_RWX: u32 = 7;

/// Magic word at the entry point of a simulated firmware image.
pub const SIM_FW_MAGIC: u32 = 0x5846_5753;

/// One loadable segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// DSP load address.
    pub addr: u32,
    /// File-backed bytes.
    pub data: Vec<u8>,
    /// Size in memory; bytes past `data` are zero-filled by the loader.
    pub mem_size: u64,
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Serialise an executable with `entry` and `segments`.
#[must_use]
pub fn build_elf32(entry: u32, segments: &[Segment]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    put_u16(&mut out, ET_EXEC);
    put_u16(&mut out, EM_XTENSA);
    put_u32(&mut out, 1);
    put_u32(&mut out, entry);
    put_u32(&mut out, EHDR_SIZE as u32);
    put_u32(&mut out, 0);
    put_u32(&mut out, 0);
    put_u16(&mut out, EHDR_SIZE as u16);
    put_u16(&mut out, PHDR_SIZE as u16);
    put_u16(&mut out, segments.len() as u16);
    put_u16(&mut out, 40);
    put_u16(&mut out, 0);
    put_u16(&mut out, 0);

    let mut data_offset = EHDR_SIZE + PHDR_SIZE * segments.len();
    for segment in segments {
        put_u32(&mut out, PT_LOAD);
        put_u32(&mut out, data_offset as u32);
        put_u32(&mut out, segment.addr);
        put_u32(&mut out, segment.addr);
        put_u32(&mut out, segment.data.len() as u32);
        put_u32(&mut out, segment.mem_size as u32);
        put_u32(&mut out, PF_RWX);
        put_u32(&mut out, 4);
        data_offset += segment.data.len();
    }
    for segment in segments {
        out.extend_from_slice(&segment.data);
    }
    out
}

/// Firmware image the simulated DSP boots: a header announcing the
/// protocol version at `entry`, followed by a zero-initialised data area.
#[must_use]
pub fn firmware_image(entry: u32, protocol: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(16);
    put_u32(&mut header, SIM_FW_MAGIC);
    put_u32(&mut header, protocol);
    header.extend_from_slice(b"simdsp\0\0");
    build_elf32(
        entry,
        &[
            Segment {
                addr: entry,
                data: header,
                mem_size: 0x100,
            },
            Segment {
                addr: entry + 0x1000,
                data: Vec::new(),
                mem_size: 0x1000,
            },
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_point_at_segment_data() {
        let image = build_elf32(
            0x100,
            &[Segment {
                addr: 0x100,
                data: vec![9; 3],
                mem_size: 8,
            }],
        );
        assert_eq!(&image[..4], b"\x7fELF");
        assert_eq!(image.len(), EHDR_SIZE + PHDR_SIZE + 3);
        let offset = u32::from_le_bytes(image[EHDR_SIZE + 4..EHDR_SIZE + 8].try_into().unwrap());
        assert_eq!(&image[offset as usize..], &[9, 9, 9]);
    }
}
