// Author: Lukas Bower
// Purpose: The shared communication area: queue records plus the doorbell bookkeeping around them.

//! Communication channel.
//!
//! The area starts with queue 0's record, whose flags word doubles as the
//! handshake sync word, followed by one record per additional queue.

use log::trace;
use xrp_wire::REPORT_TO_HOST_FLAG;

use crate::hal::IoRegion;
use crate::queue::{CmdRecord, QueueSet};

pub mod handshake;

pub use handshake::{synchronize, ProtocolVersion, SyncParams};

/// Host view of the communication area.
#[derive(Debug)]
pub struct Comm {
    area: IoRegion,
    queues: QueueSet,
}

impl Comm {
    /// Lay out one record per entry of `priorities` in `area`.
    #[must_use]
    pub fn new(area: IoRegion, priorities: &[u32]) -> Self {
        let queues = QueueSet::new(&area, priorities);
        Self { area, queues }
    }

    /// Whole area.
    #[must_use]
    pub fn area(&self) -> &IoRegion {
        &self.area
    }

    /// Queues carved out of the area.
    #[must_use]
    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// Record carrying the sync word and the report channel.
    #[must_use]
    pub fn primary(&self) -> &CmdRecord {
        self.queues.all()[0].record()
    }

    /// Consume the DSP's "commands finished" notification.
    pub fn take_cmd_notification(&self) -> bool {
        let record = self.primary();
        if record.cmd_flag() & REPORT_TO_HOST_FLAG == 0 {
            return false;
        }
        record.set_cmd_flag(0);
        true
    }

    /// Wake the waiter of every queue whose record holds an answer.
    pub fn complete_finished(&self) -> usize {
        let mut completed = 0;
        for queue in self.queues.active() {
            if queue.record().is_complete() {
                trace!(target: "xrp-comm", "[comm] completing queue {}", queue.index());
                queue.completion().complete();
                completed += 1;
            }
        }
        completed
    }
}
