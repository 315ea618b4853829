// Author: Lukas Bower
// Purpose: Consumer of the DSP panic/log ring and crash sentinel detector.

//! The DSP firmware appends log text to a byte ring in shared memory and
//! stores a sentinel in the record header when it crashes. [`PanicLog::check`]
//! drains whatever the firmware wrote since the last call and reports whether
//! the sentinel is present; every polling loop in the driver calls it.

use std::sync::Mutex;

use heapless::{Deque, String as HeaplessString};
use log::{debug, error, info, warn};
use spin::Mutex as SpinMutex;
use xrp_wire::panic::{self as layout, PanicHeader, BANNER, HEADER_SIZE};

use crate::hal::IoRegion;

const LOG_LINE_CAPACITY: usize = 128;
const LOG_HISTORY_LINES: usize = 64;

/// Bounded copy of recently drained firmware log lines.
struct LogHistory {
    lines: Deque<HeaplessString<LOG_LINE_CAPACITY>, LOG_HISTORY_LINES>,
    partial: HeaplessString<LOG_LINE_CAPACITY>,
}

impl LogHistory {
    const fn new() -> Self {
        Self {
            lines: Deque::new(),
            partial: HeaplessString::new(),
        }
    }

    fn push_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        let mut entry: HeaplessString<LOG_LINE_CAPACITY> = HeaplessString::new();
        for ch in line.chars() {
            if entry.push(ch).is_err() {
                break;
            }
        }
        if self.lines.is_full() {
            let _ = self.lines.pop_front();
        }
        let _ = self.lines.push_back(entry);
    }

    /// Split `text` into lines, carrying an unterminated tail to the next call.
    fn append(&mut self, text: &str) -> Vec<String> {
        let mut complete = Vec::new();
        let mut rest = text;
        while let Some(pos) = rest.find('\n') {
            let mut line = String::from(self.partial.as_str());
            line.push_str(rest[..pos].trim_end_matches('\r'));
            self.partial.clear();
            self.push_line(&line);
            complete.push(line);
            rest = &rest[pos + 1..];
        }
        for ch in rest.chars() {
            if self.partial.push(ch).is_err() {
                let line = String::from(self.partial.as_str());
                self.partial.clear();
                self.push_line(&line);
                complete.push(line);
                let _ = self.partial.push(ch);
            }
        }
        complete
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.iter().map(|l| String::from(l.as_str())).collect()
    }
}

/// Host-side view of the panic/log record.
pub struct PanicLog {
    region: Option<IoRegion>,
    last_read: Mutex<u32>,
    history: SpinMutex<LogHistory>,
}

impl std::fmt::Debug for PanicLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanicLog").field("region", &self.region).finish()
    }
}

impl PanicLog {
    /// Reader over `region`, or a detector that never fires when absent.
    #[must_use]
    pub fn new(region: Option<IoRegion>) -> Self {
        let region = region.filter(|r| {
            let fits = r.len() > HEADER_SIZE as u64;
            if !fits {
                warn!(target: "xrp-dsp-log", "[panic] record of {:#x} bytes is too small", r.len());
            }
            fits
        });
        Self {
            region,
            last_read: Mutex::new(0),
            history: SpinMutex::new(LogHistory::new()),
        }
    }

    /// Physical base of the record, if one is configured.
    #[must_use]
    pub fn base(&self) -> Option<u64> {
        self.region.as_ref().map(IoRegion::base)
    }

    /// Zero the record, size the ring and seed it with the banner.
    pub fn init(&self) {
        let Some(region) = &self.region else {
            return;
        };
        region.clear(0, region.len() as usize);
        let size = (region.len() - HEADER_SIZE as u64) as u32;
        region.write_u32(layout::SIZE, size);
        let banner = &BANNER[..BANNER.len().min(size as usize)];
        region.write(layout::DATA, banner);
        *self.last_read.lock().expect("poisoned panic log lock") = 0;
        debug!(target: "xrp-dsp-log", "[panic] record at {:#x} ring={size:#x}", region.base());
    }

    /// Current header contents.
    #[must_use]
    pub fn header(&self) -> Option<PanicHeader> {
        self.region.as_ref().map(|r| PanicHeader {
            panic: r.read_u32(layout::PANIC),
            ccount: r.read_u32(layout::CCOUNT),
            read: r.read_u32(layout::READ),
            write: r.read_u32(layout::WRITE),
            size: r.read_u32(layout::SIZE),
        })
    }

    fn ring_capacity(region: &IoRegion) -> u64 {
        region.len() - HEADER_SIZE as u64
    }

    /// Drain new log text and report whether the DSP has crashed.
    pub fn check(&self) -> bool {
        let Some(region) = &self.region else {
            return false;
        };
        let Some(header) = self.header() else {
            return false;
        };
        let mut last_read = self.last_read.lock().expect("poisoned panic log lock");

        if header.read == 0 && header.read != *last_read {
            warn!(target: "xrp-dsp-log", "[panic] device restarted");
            self.dump(region, log::Level::Warn);
        }

        let sane = header.write < header.size
            && header.read < header.size
            && u64::from(header.size) <= Self::ring_capacity(region);
        if sane {
            *last_read = header.read;
            let total = header.pending();
            if total > 0 {
                let mut bytes = Vec::with_capacity(total as usize);
                if header.read < header.write {
                    bytes.extend(region.read_vec(
                        layout::DATA + header.read as usize,
                        total as usize,
                    ));
                } else {
                    let tail = header.size - header.read;
                    bytes.extend(region.read_vec(layout::DATA + header.read as usize, tail as usize));
                    bytes.extend(region.read_vec(layout::DATA, header.write as usize));
                }
                region.write_u32(layout::READ, header.write);
                *last_read = header.write;
                let text = String::from_utf8_lossy(&bytes);
                for line in self.history.lock().append(&text) {
                    info!(target: "xrp-dsp-log", "{line}");
                }
            }
        } else if header.read != *last_read {
            warn!(
                target: "xrp-dsp-log",
                "[panic] nonsense in the log buffer: read={} write={} size={}",
                header.read,
                header.write,
                header.size
            );
            *last_read = header.read;
        }

        if header.panicked() {
            error!(
                target: "xrp-dsp-log",
                "[panic] DSP panic detected ccount={:#x}",
                header.ccount
            );
            self.dump(region, log::Level::Error);
            return true;
        }
        false
    }

    fn dump(&self, region: &IoRegion, level: log::Level) {
        let bytes = self.ring_bytes(region);
        let text = String::from_utf8_lossy(&bytes);
        for line in text.split(['\n', '\0']).filter(|l| !l.is_empty()) {
            log::log!(target: "xrp-dsp-log", level, "  {line}");
        }
    }

    fn ring_bytes(&self, region: &IoRegion) -> Vec<u8> {
        let size = u64::from(region.read_u32(layout::SIZE)).min(Self::ring_capacity(region));
        region.read_vec(layout::DATA, size as usize)
    }

    /// Whole ring contents, the diagnostic view of the record.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.region
            .as_ref()
            .map(|region| self.ring_bytes(region))
            .unwrap_or_default()
    }

    /// Lines drained by [`PanicLog::check`], oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.history.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::PhysMemory;
    use xrp_wire::panic::PANIC_SENTINEL;

    fn record() -> (std::sync::Arc<PhysMemory>, PanicLog) {
        let mem = PhysMemory::new();
        mem.add_region(0x1000, 0x200).unwrap();
        let log = PanicLog::new(Some(mem.map_io(0x1000, 0x200).unwrap()));
        log.init();
        (mem, log)
    }

    fn dsp_write(mem: &PhysMemory, text: &[u8]) {
        let size = mem.read_u32(0x1000 + layout::SIZE as u64).unwrap();
        let mut write = mem.read_u32(0x1000 + layout::WRITE as u64).unwrap();
        for &byte in text {
            mem.write(0x1000 + layout::DATA as u64 + u64::from(write), &[byte])
                .unwrap();
            write = (write + 1) % size;
        }
        mem.write_u32(0x1000 + layout::WRITE as u64, write).unwrap();
    }

    #[test]
    fn init_writes_banner_and_ring_size() {
        let (mem, log) = record();
        let header = log.header().unwrap();
        assert_eq!(header.size, 0x200 - HEADER_SIZE as u32);
        assert_eq!(header.read, 0);
        assert_eq!(
            mem.read_vec(0x1000 + layout::DATA as u64, BANNER.len()).unwrap(),
            BANNER
        );
    }

    #[test]
    fn drains_wrapped_text_and_detects_panic() {
        let (mem, log) = record();
        mem.write_u32(0x1000 + layout::READ as u64, 0x1e0).unwrap();
        mem.write_u32(0x1000 + layout::WRITE as u64, 0x1e0).unwrap();
        assert!(!log.check());
        dsp_write(&mem, b"boot ok\nqueue ready\n");
        assert!(!log.check());
        assert_eq!(log.history(), vec!["boot ok".to_owned(), "queue ready".to_owned()]);
        let header = log.header().unwrap();
        assert_eq!(header.read, header.write);

        mem.write_u32(0x1000 + layout::PANIC as u64, PANIC_SENTINEL)
            .unwrap();
        assert!(log.check());
    }

    #[test]
    fn missing_record_never_reports_a_crash() {
        let log = PanicLog::new(None);
        log.init();
        assert!(!log.check());
        assert!(log.snapshot().is_empty());
    }
}
