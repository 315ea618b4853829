// Author: Lukas Bower
// Purpose: Command records, completion waits and the prioritised queue set.

//! Hardware command queues.
//!
//! Each queue owns one [`CMD_STRIDE`]-sized record of the communication
//! area. The host publishes a request by filling the record and setting
//! `REQUEST_VALID` last; the DSP answers by setting `RESPONSE_VALID`. The
//! queue mutex keeps exactly one request in flight per record.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use log::{debug, trace};
use xrp_wire::{
    cmd, CmdFlags, DspBuffer, QueueFlags, SyncCode, CMD_STRIDE, INLINE_BUFFER_COUNT,
    INLINE_DATA_SIZE, NAMESPACE_ID_SIZE,
};

use crate::error::XrpError;
use crate::hal::phys::barrier;
use crate::hal::IoRegion;
use crate::request::{MappedRequest, Payload};

/// Longest single sleep of an interrupt wait before the panic record is checked again.
const IRQ_WAIT_SLICE: Duration = Duration::from_millis(50);

/// One command record in the communication area.
#[derive(Debug, Clone)]
pub struct CmdRecord {
    io: IoRegion,
}

impl CmdRecord {
    /// Record backed by `io`, which must span at least one stride.
    #[must_use]
    pub fn new(io: IoRegion) -> Self {
        Self { io }
    }

    /// Raw view of the record.
    #[must_use]
    pub fn io(&self) -> &IoRegion {
        &self.io
    }

    /// Current flags word.
    #[must_use]
    pub fn flags(&self) -> CmdFlags {
        CmdFlags::from_bits_retain(self.io.read_u32(cmd::FLAGS))
    }

    /// Returns true once the DSP has answered the published request.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let flags = self.flags();
        barrier();
        flags.is_complete()
    }

    /// The flags word read as a handshake sync word.
    #[must_use]
    pub fn sync(&self) -> SyncCode {
        SyncCode::from(self.io.read_u32(cmd::FLAGS))
    }

    /// Store a handshake sync word.
    pub fn set_sync(&self, code: SyncCode) {
        self.io.write_u32(cmd::FLAGS, code.raw());
    }

    /// Device-to-host command notification word.
    #[must_use]
    pub fn cmd_flag(&self) -> u32 {
        self.io.read_u32(cmd::CMD_FLAG)
    }

    /// Overwrite the command notification word.
    pub fn set_cmd_flag(&self, value: u32) {
        self.io.write_u32(cmd::CMD_FLAG, value);
    }

    /// Pending report word.
    #[must_use]
    pub fn report_id(&self) -> u32 {
        self.io.read_u32(cmd::REPORT_ID)
    }

    /// Overwrite the pending report word.
    pub fn set_report_id(&self, value: u32) {
        self.io.write_u32(cmd::REPORT_ID, value);
    }

    /// Publish where the DSP may post reports.
    pub fn set_report_buffer(&self, dsp_addr: u32, size: u32, status: xrp_wire::ReportStatus) {
        self.io.write_u32(cmd::REPORT_ADDR, dsp_addr);
        self.io.write_u32(cmd::REPORT_BUFFER_SIZE, size);
        barrier();
        self.io.write_u32(cmd::REPORT_STATUS, status as u32);
    }

    /// Write `rq` into the record and mark it valid.
    pub(crate) fn fill(&self, rq: &MappedRequest) {
        self.io.write_u32(cmd::IN_DATA_SIZE, rq.in_size);
        self.io.write_u32(cmd::OUT_DATA_SIZE, rq.out_size);
        self.io.write_u32(cmd::BUFFER_SIZE, rq.buffer_bytes());

        match &rq.in_payload {
            Payload::Inline(bytes) => self.io.write(cmd::IN_DATA, bytes),
            Payload::Shared { dsp, .. } => self.io.write_u32(cmd::IN_DATA, *dsp),
        }
        if let Payload::Shared { dsp, .. } = &rq.out_payload {
            self.io.write_u32(cmd::OUT_DATA, *dsp);
        }
        match &rq.descriptors {
            Some(table) => self.io.write_u32(cmd::BUFFER_DATA, table.dsp),
            None => self
                .io
                .write(cmd::BUFFER_DATA, &DspBuffer::encode_all(&rq.buffers)),
        }
        if rq.flags.contains(QueueFlags::NSID) {
            let nsid = rq.nsid.unwrap_or([0; NAMESPACE_ID_SIZE]);
            self.io.write(cmd::NSID, &nsid);
        }

        barrier();
        let flags = (CmdFlags::from_bits_retain(rq.flags.bits()) - CmdFlags::RESPONSE_VALID)
            | CmdFlags::REQUEST_VALID;
        trace!(target: "xrp-queue", "[queue] publish flags={:#x}", flags.bits());
        self.io.write_u32(cmd::FLAGS, flags.bits());
    }

    /// Copy inline results back into `rq` and release the record.
    pub(crate) fn complete(&self, rq: &mut MappedRequest) -> Result<(), XrpError> {
        let flags = self.flags();
        if rq.out_size as usize <= INLINE_DATA_SIZE {
            if let Payload::Inline(bytes) = &mut rq.out_payload {
                self.io.read(cmd::OUT_DATA, bytes);
            }
        }
        let decoded = (rq.buffers.len() <= INLINE_BUFFER_COUNT).then(|| {
            let raw = self
                .io
                .read_vec(cmd::BUFFER_DATA, rq.buffers.len() * DspBuffer::SIZE);
            DspBuffer::decode_all(&raw, rq.buffers.len())
        });
        // Release the record before anything can fail.
        self.io.write_u32(cmd::FLAGS, 0);
        if let Some(buffers) = decoded {
            rq.buffers = buffers?;
        }
        if flags.contains(CmdFlags::RESPONSE_DELIVERY_FAIL) {
            return Err(XrpError::Delivery);
        }
        Ok(())
    }
}

/// One-shot wakeup raised by the interrupt handler.
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    /// Wake the waiter.
    pub fn complete(&self) {
        *self.done.lock().expect("poisoned completion lock") = true;
        self.cv.notify_all();
    }

    /// Forget an earlier wakeup.
    pub fn reinit(&self) {
        *self.done.lock().expect("poisoned completion lock") = false;
    }

    /// Wait until woken or `timeout` passes; consumes the wakeup.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.done.lock().expect("poisoned completion lock");
        let (mut guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |done| !*done)
            .expect("poisoned completion lock");
        std::mem::replace(&mut *guard, false)
    }
}

/// A hardware queue.
#[derive(Debug)]
pub struct Queue {
    index: usize,
    record: CmdRecord,
    lock: Mutex<()>,
    completion: Completion,
    priority: AtomicU32,
}

impl Queue {
    /// Hardware index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Command record.
    #[must_use]
    pub fn record(&self) -> &CmdRecord {
        &self.record
    }

    /// Completion raised by the interrupt handler.
    #[must_use]
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Current priority.
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Serialise access to the record.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().expect("poisoned queue lock")
    }

    /// Wait for the DSP by polling the record.
    pub fn wait_poll(&self, timeout: Duration, panicked: &dyn Fn() -> bool) -> Result<(), XrpError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.record.is_complete() {
                return Ok(());
            }
            if panicked() {
                return Err(XrpError::Busy);
            }
            if Instant::now() >= deadline {
                return Err(XrpError::Busy);
            }
            std::thread::yield_now();
        }
    }

    /// Wait for the DSP on the host interrupt.
    pub fn wait_irq(&self, timeout: Duration, panicked: &dyn Fn() -> bool) -> Result<(), XrpError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.record.is_complete() {
                return Ok(());
            }
            if panicked() {
                return Err(XrpError::Busy);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(XrpError::Busy);
            }
            self.completion
                .wait_timeout((deadline - now).min(IRQ_WAIT_SLICE));
        }
    }
}

/// All queues of a device and their priority ordering.
#[derive(Debug)]
pub struct QueueSet {
    queues: Vec<Queue>,
    active: AtomicUsize,
    ordering: RwLock<Vec<usize>>,
}

impl QueueSet {
    /// One queue per entry of `priorities`, records laid out back to back in `area`.
    #[must_use]
    pub fn new(area: &IoRegion, priorities: &[u32]) -> Self {
        let priorities: &[u32] = if priorities.is_empty() { &[0] } else { priorities };
        let queues: Vec<Queue> = priorities
            .iter()
            .enumerate()
            .map(|(index, &priority)| Queue {
                index,
                record: CmdRecord::new(area.slice(index * CMD_STRIDE, CMD_STRIDE as u64)),
                lock: Mutex::new(()),
                completion: Completion::default(),
                priority: AtomicU32::new(priority),
            })
            .collect();
        let set = Self {
            active: AtomicUsize::new(queues.len()),
            ordering: RwLock::new(Vec::new()),
            queues,
        };
        set.reorder();
        set
    }

    /// Every configured queue.
    #[must_use]
    pub fn all(&self) -> &[Queue] {
        &self.queues
    }

    /// Queues negotiated with the firmware.
    #[must_use]
    pub fn active(&self) -> &[Queue] {
        &self.queues[..self.active_count()]
    }

    /// Number of negotiated queues.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Restore the configured queue count before a new handshake.
    pub fn reset_active(&self) {
        self.active.store(self.queues.len(), Ordering::Release);
    }

    /// Fall back to queue 0 only.
    pub fn set_single(&self) {
        self.active.store(1, Ordering::Release);
    }

    /// Priorities of the active queues, by hardware index.
    #[must_use]
    pub fn priorities(&self) -> Vec<u32> {
        self.active().iter().map(Queue::priority).collect()
    }

    /// Adopt priorities adjusted by the firmware.
    pub fn set_priorities(&self, priorities: &[u32]) {
        for (queue, &priority) in self.queues.iter().zip(priorities) {
            queue.priority.store(priority, Ordering::Relaxed);
        }
    }

    /// Rebuild the hint-to-queue table, highest priority first.
    pub fn reorder(&self) {
        let mut order: Vec<usize> = (0..self.active_count()).collect();
        order.sort_by_key(|&idx| std::cmp::Reverse(self.queues[idx].priority()));
        if order.len() > 1 {
            for (hint, &idx) in order.iter().enumerate() {
                debug!(
                    target: "xrp-queue",
                    "[queue] hint {hint} -> queue {idx} (priority {})",
                    self.queues[idx].priority()
                );
            }
        }
        *self.ordering.write().expect("poisoned queue ordering lock") = order;
    }

    /// Queue serving the priority hint carried by `flags`.
    #[must_use]
    pub fn select(&self, flags: QueueFlags) -> &Queue {
        let ordering = self.ordering.read().expect("poisoned queue ordering lock");
        if ordering.len() <= 1 {
            return &self.queues[0];
        }
        let hint = (flags.priority() as usize).min(ordering.len() - 1);
        &self.queues[ordering[hint]]
    }

    /// Lock every queue except `skip`, in index order.
    pub fn lock_others(&self, skip: Option<usize>) -> Vec<MutexGuard<'_, ()>> {
        self.queues
            .iter()
            .filter(|q| Some(q.index) != skip)
            .map(Queue::lock)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::PhysMemory;
    use crate::registry::Registry;
    use crate::request::QueueRequest;
    use crate::share::{NoUserSpace, Sharer};
    use crate::sim::SimPlatform;

    fn area() -> IoRegion {
        let mem = PhysMemory::new();
        mem.add_region(0x1000, 0x1000).unwrap();
        mem.map_io(0x1000, 0x400).unwrap()
    }

    #[test]
    fn hints_map_to_descending_priorities() {
        let set = QueueSet::new(&area(), &[1, 5, 3]);
        assert_eq!(set.select(QueueFlags::with_priority(0, false)).index(), 1);
        assert_eq!(set.select(QueueFlags::with_priority(1, false)).index(), 2);
        assert_eq!(set.select(QueueFlags::with_priority(2, false)).index(), 0);
        assert_eq!(set.select(QueueFlags::with_priority(9, false)).index(), 0);

        set.set_single();
        set.reorder();
        assert_eq!(set.select(QueueFlags::with_priority(0, false)).index(), 0);
        assert_eq!(set.active().len(), 1);
    }

    #[test]
    fn completion_needs_both_flags() {
        let set = QueueSet::new(&area(), &[]);
        let record = set.all()[0].record();
        record
            .io()
            .write_u32(cmd::FLAGS, CmdFlags::REQUEST_VALID.bits());
        assert!(!record.is_complete());
        let done = CmdFlags::REQUEST_VALID | CmdFlags::RESPONSE_VALID;
        record.io().write_u32(cmd::FLAGS, done.bits());
        assert!(record.is_complete());
        assert_eq!(record.sync(), SyncCode::DspToHost);
    }

    #[test]
    fn poll_wait_times_out_and_stops_on_panic() {
        let set = QueueSet::new(&area(), &[]);
        let queue = &set.all()[0];
        let start = Instant::now();
        assert!(matches!(
            queue.wait_poll(Duration::from_millis(20), &|| false),
            Err(XrpError::Busy)
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(matches!(
            queue.wait_irq(Duration::from_secs(5), &|| true),
            Err(XrpError::Busy)
        ));
    }

    #[test]
    fn completed_record_is_released_even_on_delivery_failure() {
        let platform = SimPlatform::new();
        let mem = platform.device_memory();
        let registry = Registry::new();
        let space = NoUserSpace;
        let sharer = Sharer::new(&mem, &registry, None, &space);
        let request = QueueRequest::kernel([1; NAMESPACE_ID_SIZE], b"ping".to_vec(), 4);
        let mut mapped = MappedRequest::map(&sharer, &request).unwrap();

        let record = CmdRecord::new(platform.comm_region());
        record.fill(&mapped);
        let done = CmdFlags::REQUEST_VALID
            | CmdFlags::RESPONSE_VALID
            | CmdFlags::RESPONSE_DELIVERY_FAIL;
        record.io().write_u32(cmd::FLAGS, done.bits());
        assert!(matches!(record.complete(&mut mapped), Err(XrpError::Delivery)));
        assert_eq!(record.io().read_u32(cmd::FLAGS), 0);
        assert!(!record.is_complete());
        mapped.unmap_nowb(&sharer);
    }

    #[test]
    fn completion_is_consumed_by_the_waiter() {
        let completion = Completion::default();
        completion.complete();
        assert!(completion.wait_timeout(Duration::from_millis(1)));
        assert!(!completion.wait_timeout(Duration::from_millis(1)));
    }
}
