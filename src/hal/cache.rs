// Author: Lukas Bower
//! Direction-aware cache maintenance for buffers shared with the DSP.

use log::trace;
use xrp_wire::BufferFlags;

use super::{align_down, align_up, CacheOps};

const CACHE_LINE_BYTES: u64 = 64;

fn range_for_cache(phys: u64, len: u64) -> (u64, u64) {
    let end = phys.saturating_add(len);
    let start = align_down(phys, CACHE_LINE_BYTES);
    (start, align_up(end, CACHE_LINE_BYTES) - start)
}

fn call_cache_op(op: &str, phys: u64, len: u64, f: impl FnOnce(u64, u64)) {
    if len == 0 {
        return;
    }
    let (start, aligned_len) = range_for_cache(phys, len);
    trace!(
        target: "xrp-cache",
        "[cache] op={op} phys={phys:#x}..{end:#x} aligned={start:#x}+{aligned_len:#x}",
        end = phys.saturating_add(len),
    );
    f(start, aligned_len);
}

/// Hand a range to the DSP: clean what it reads, invalidate what it writes.
pub fn sync_for_device(ops: &dyn CacheOps, phys: u64, len: u64, flags: BufferFlags) {
    if flags.contains(BufferFlags::READ) {
        call_cache_op("clean", phys, len, |start, len| ops.clean(start, len));
    }
    if flags.contains(BufferFlags::WRITE) {
        call_cache_op("invalidate", phys, len, |start, len| ops.invalidate(start, len));
    }
}

/// Take a range back from the DSP: drop stale lines of anything it wrote.
pub fn sync_for_cpu(ops: &dyn CacheOps, phys: u64, len: u64, flags: BufferFlags) {
    if flags.contains(BufferFlags::WRITE) {
        call_cache_op("invalidate", phys, len, |start, len| ops.invalidate(start, len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        ops: Mutex<Vec<(&'static str, u64, u64)>>,
    }

    impl CacheOps for Recorder {
        fn clean(&self, phys: u64, len: u64) {
            self.ops.lock().unwrap().push(("clean", phys, len));
        }
        fn invalidate(&self, phys: u64, len: u64) {
            self.ops.lock().unwrap().push(("invalidate", phys, len));
        }
        fn cacheable(&self, _phys: u64, _len: u64) -> bool {
            true
        }
    }

    #[test]
    fn device_sync_follows_direction_and_line_alignment() {
        let rec = Recorder::default();
        sync_for_device(&rec, 0x1010, 0x20, BufferFlags::READ_WRITE);
        let ops = rec.ops.lock().unwrap().clone();
        assert_eq!(ops, vec![("clean", 0x1000, 0x40), ("invalidate", 0x1000, 0x40)]);
    }

    #[test]
    fn cpu_sync_skips_read_only_ranges() {
        let rec = Recorder::default();
        sync_for_cpu(&rec, 0x2000, 0x1000, BufferFlags::READ);
        assert!(rec.ops.lock().unwrap().is_empty());
        sync_for_cpu(&rec, 0x2000, 0x1000, BufferFlags::WRITE);
        assert_eq!(rec.ops.lock().unwrap().len(), 1);
    }
}
