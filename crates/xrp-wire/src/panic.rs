// Author: Lukas Bower
// Purpose: Layout of the DSP panic/log record shared with the host.

//! The panic record is a small header followed by a byte ring the firmware
//! writes its log into. The host owns `read`, the DSP owns `write`.

/// Value the firmware stores in `panic` when it has crashed.
pub const PANIC_SENTINEL: u32 = 0xdead_babe;

/// Offset of the crash sentinel.
pub const PANIC: usize = 0;
/// Offset of the cycle counter snapshot.
pub const CCOUNT: usize = 4;
/// Offset of the host read cursor.
pub const READ: usize = 8;
/// Offset of the DSP write cursor.
pub const WRITE: usize = 12;
/// Offset of the ring capacity.
pub const SIZE: usize = 16;
/// Offset of the ring bytes.
pub const DATA: usize = 20;
/// Header size preceding the ring bytes.
pub const HEADER_SIZE: usize = DATA;

/// Banner written into a freshly initialised ring.
pub const BANNER: &[u8] = b"Inition dsp log\n";

/// Decoded header of the panic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PanicHeader {
    /// Crash sentinel word.
    pub panic: u32,
    /// Cycle counter at the time of the last update.
    pub ccount: u32,
    /// Host read cursor.
    pub read: u32,
    /// DSP write cursor.
    pub write: u32,
    /// Ring capacity.
    pub size: u32,
}

impl PanicHeader {
    /// Returns true when the firmware has declared a crash.
    #[must_use]
    pub fn panicked(&self) -> bool {
        self.panic == PANIC_SENTINEL
    }

    /// Bytes waiting between `read` and `write`, accounting for wrap.
    #[must_use]
    pub fn pending(&self) -> u32 {
        if self.read <= self.write {
            self.write - self.read
        } else {
            self.size - self.read + self.write
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_handles_wrap() {
        let header = PanicHeader {
            read: 90,
            write: 10,
            size: 100,
            ..PanicHeader::default()
        };
        assert_eq!(header.pending(), 20);
        assert!(!header.panicked());
    }
}
