// Author: Lukas Bower
// Purpose: DSP-to-host report channel backed by a pool buffer published in queue 0's record.

//! Reports.
//!
//! The buffer starts with a `u32` holding the id of the last report
//! delivered, followed by the payload area whose DSP address and capacity
//! are published in the primary record. The DSP posts a report by writing
//! the payload, storing `id | REPORT_TO_HOST_FLAG` in the record and raising
//! the host interrupt; [`Reporter::dispatch`] hands the payload to the
//! handler registered for that id.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use spin::Mutex as SpinMutex;
use xrp_wire::{ReportStatus, REPORT_ID_MASK, REPORT_TO_HOST_FLAG};

use crate::error::XrpError;
use crate::pool::Allocation;
use crate::queue::CmdRecord;
use crate::share::DeviceMemory;

const REPORT_HEADER: u64 = 4;

/// Handler invoked with the report id and its payload.
pub type ReportHandler = Arc<dyn Fn(u32, &[u8]) + Send + Sync>;

struct Registration {
    size: u32,
    handler: ReportHandler,
}

#[derive(Debug)]
struct ReportBuffer {
    allocation: Allocation,
    capacity: u32,
}

/// Host side of the report channel.
pub struct Reporter {
    buffer: Mutex<Option<ReportBuffer>>,
    handlers: SpinMutex<BTreeMap<u32, Registration>>,
    next_id: AtomicU32,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("ids", &self.handlers.lock().keys().copied().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    /// Channel with no buffer and no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(None),
            handlers: SpinMutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate the shared buffer and announce it to the DSP.
    pub fn setup(
        &self,
        mem: &DeviceMemory,
        record: &CmdRecord,
        capacity: u32,
    ) -> Result<u64, XrpError> {
        if capacity == 0 {
            return Err(XrpError::invalid("report buffer capacity must be non-zero"));
        }
        let mut slot = self.buffer.lock().expect("poisoned report buffer lock");
        if slot.is_some() {
            return Err(XrpError::invalid("report buffer already allocated"));
        }
        let allocation = mem.pool.allocate(REPORT_HEADER + u64::from(capacity), 0)?;
        let dsp = mem.translate(allocation.start() + REPORT_HEADER)?;
        mem.phys.fill(allocation.start(), allocation.size(), 0)?;
        record.set_report_id(0);
        record.set_report_buffer(dsp, capacity, ReportStatus::Working);
        debug!(
            target: "xrp-report",
            "[report] buffer {:#x} dsp={dsp:#x} capacity={capacity:#x}",
            allocation.start()
        );
        let phys = allocation.start();
        *slot = Some(ReportBuffer {
            allocation,
            capacity,
        });
        Ok(phys)
    }

    /// Publish the buffer again, or mark the channel invalid when there is none.
    ///
    /// The handshake reuses the primary record, so this runs after every boot.
    pub fn republish(&self, mem: &DeviceMemory, record: &CmdRecord) -> Result<(), XrpError> {
        let slot = self.buffer.lock().expect("poisoned report buffer lock");
        record.set_report_id(0);
        match slot.as_ref() {
            Some(buffer) => {
                let dsp = mem.translate(buffer.allocation.start() + REPORT_HEADER)?;
                record.set_report_buffer(dsp, buffer.capacity, ReportStatus::Working);
            }
            None => record.set_report_buffer(0, 0, ReportStatus::Invalid),
        }
        Ok(())
    }

    /// Withdraw the buffer; the DSP stops posting reports.
    pub fn release(&self, record: &CmdRecord) -> bool {
        let taken = self
            .buffer
            .lock()
            .expect("poisoned report buffer lock")
            .take();
        record.set_report_buffer(0, 0, ReportStatus::Invalid);
        taken.is_some()
    }

    /// Capacity of the current buffer.
    #[must_use]
    pub fn capacity(&self) -> Option<u32> {
        self.buffer
            .lock()
            .expect("poisoned report buffer lock")
            .as_ref()
            .map(|b| b.capacity)
    }

    fn check_size(&self, size: u32) -> Result<(), XrpError> {
        let capacity = self.capacity().unwrap_or(0);
        if size > capacity {
            return Err(XrpError::invalid(format!(
                "report size {size} exceeds buffer capacity {capacity}"
            )));
        }
        Ok(())
    }

    /// Register `handler` under a fresh id for payloads of `size` bytes.
    ///
    /// Ids in use are skipped; every id of the report space is tried once.
    pub fn register(&self, size: u32, handler: ReportHandler) -> Result<u32, XrpError> {
        self.check_size(size)?;
        let mut handlers = self.handlers.lock();
        for _ in 0..=REPORT_ID_MASK {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) & REPORT_ID_MASK;
            if id == 0 || handlers.contains_key(&id) {
                continue;
            }
            handlers.insert(id, Registration { size, handler });
            return Ok(id);
        }
        warn!(target: "xrp-report", "[report] every report id is taken");
        Err(XrpError::invalid("no free report id"))
    }

    /// Register `handler` under a caller-chosen id.
    pub fn register_id(&self, id: u32, size: u32, handler: ReportHandler) -> Result<(), XrpError> {
        if id == 0 || id > REPORT_ID_MASK {
            return Err(XrpError::invalid(format!("report id {id} out of range")));
        }
        self.check_size(size)?;
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&id) {
            warn!(target: "xrp-report", "[report] id {id} already registered");
            return Err(XrpError::invalid(format!("report id {id} already registered")));
        }
        handlers.insert(id, Registration { size, handler });
        Ok(())
    }

    /// Drop the handler of `id`.
    pub fn unregister(&self, id: u32) -> bool {
        self.handlers.lock().remove(&id).is_some()
    }

    /// Deliver a pending report, if the DSP posted one.
    pub fn dispatch(&self, mem: &DeviceMemory, record: &CmdRecord) -> bool {
        let word = record.report_id();
        if word & REPORT_TO_HOST_FLAG == 0 {
            return false;
        }
        record.set_report_id(word & !REPORT_TO_HOST_FLAG);
        let id = word & REPORT_ID_MASK;

        let base = self
            .buffer
            .lock()
            .expect("poisoned report buffer lock")
            .as_ref()
            .map(|b| b.allocation.start());
        let target = {
            let handlers = self.handlers.lock();
            handlers
                .get(&id)
                .map(|r| (r.size, Arc::clone(&r.handler)))
        };
        match (base, target) {
            (Some(base), Some((size, handler))) => {
                let _ = mem.phys.write_u32(base, id);
                match mem.phys.read_vec(base + REPORT_HEADER, size as usize) {
                    Ok(payload) => handler(id, &payload),
                    Err(err) => warn!(target: "xrp-report", "[report] payload unreadable: {err}"),
                }
            }
            (None, _) => warn!(target: "xrp-report", "[report] report {id} without a buffer"),
            (_, None) => warn!(target: "xrp-report", "[report] no handler for report {id}"),
        }
        record.set_report_id(0);
        true
    }
}
