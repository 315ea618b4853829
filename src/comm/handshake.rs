// Author: Lukas Bower
// Purpose: Versioned startup handshake negotiating the queue layout with the firmware.

//! The host writes `START` and waits for the firmware to announce its
//! protocol version. Version 1 receives the hardware blob inline; version 2
//! receives a TLV list and may accept or adjust the queue priorities. The
//! exchange is confirmed with `HOST_TO_DSP` / `DSP_TO_HOST`, after which the
//! sync word is returned to `IDLE` whatever the outcome.

use std::time::{Duration, Instant};

use log::{debug, error, info};
use xrp_wire::sync::{decode_words, encode_words, V1_DATA_OFFSET, V2_CAPACITY, V2_DATA_OFFSET};
use xrp_wire::{DebugInfo, SyncCode, TlvReader, TlvType, TlvWriter};

use super::Comm;
use crate::error::XrpError;
use crate::hal::phys::barrier;
use crate::hal::DspHardware;

/// Protocol spoken by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Inline hardware blob, single queue.
    V1,
    /// TLV list, optional multi-queue negotiation.
    V2,
}

/// Inputs of one handshake.
pub struct SyncParams<'a> {
    /// Doorbell and hardware blob source.
    pub hw: &'a dyn DspHardware,
    /// Crash detector polled while waiting.
    pub panicked: &'a dyn Fn() -> bool,
    /// Deadline for the whole exchange.
    pub timeout: Duration,
    /// Panic record address and firmware log level.
    pub debug: DebugInfo,
}

enum Poll {
    Changed(SyncCode),
    TimedOut(SyncCode),
}

fn poll_sync(
    comm: &Comm,
    deadline: Instant,
    panicked: &dyn Fn() -> bool,
    done: impl Fn(SyncCode) -> bool,
) -> Result<Poll, XrpError> {
    loop {
        barrier();
        let code = comm.primary().sync();
        if done(code) {
            return Ok(Poll::Changed(code));
        }
        if panicked() {
            error!(target: "xrp-comm", "[sync] DSP crashed during synchronization");
            return Err(XrpError::Busy);
        }
        if Instant::now() >= deadline {
            return Ok(Poll::TimedOut(code));
        }
        std::thread::yield_now();
    }
}

fn send_v2(comm: &Comm, blob: &[u8], debug_info: DebugInfo) -> Result<(), XrpError> {
    let queues = comm.queues();
    let mut writer = TlvWriter::new(V2_CAPACITY);
    writer.put(TlvType::HW_SPEC_DATA, blob)?;
    if queues.active_count() > 1 {
        writer.put(TlvType::HW_QUEUES, &encode_words(&queues.priorities()))?;
        for queue in &queues.active()[1..] {
            queue.record().set_sync(SyncCode::Idle);
        }
    }
    writer.put(TlvType::HW_DEBUG_INFO, &debug_info.encode())?;
    comm.area().write(V2_DATA_OFFSET, &writer.finish()?);
    Ok(())
}

fn complete_v2(comm: &Comm, blob_len: usize) -> Result<(), XrpError> {
    let queues = comm.queues();
    let image = comm.area().read_vec(V2_DATA_OFFSET, V2_CAPACITY);
    let mut reader = TlvReader::new(&image);

    let spec = reader
        .next_record()?
        .ok_or_else(|| XrpError::ProtocolMismatch("hardware description missing".into()))?;
    if spec.len as usize != blob_len {
        error!(target: "xrp-comm", "[sync] hardware description size modified by the DSP");
        return Err(XrpError::ProtocolMismatch(format!(
            "hardware description length {} != {blob_len}",
            spec.len
        )));
    }
    if !spec.kind.accepted() {
        info!(target: "xrp-comm", "[sync] hardware description not recognized by the DSP");
    }

    let count = queues.active_count();
    if count > 1 {
        let record = reader
            .next_record()?
            .ok_or_else(|| XrpError::ProtocolMismatch("queue priorities missing".into()))?;
        if record.len as usize != count * 4 {
            error!(target: "xrp-comm", "[sync] queue priority size modified by the DSP");
            return Err(XrpError::ProtocolMismatch(format!(
                "queue priority length {} != {}",
                record.len,
                count * 4
            )));
        }
        if record.kind.accepted() {
            let priorities = decode_words(reader.value(&record)?)?;
            debug!(target: "xrp-comm", "[sync] DSP priorities {priorities:?}");
            queues.set_priorities(&priorities);
        } else {
            info!(target: "xrp-comm", "[sync] queue priorities not recognized by the DSP");
            queues.set_single();
        }
    }
    Ok(())
}

fn negotiate(comm: &Comm, params: &SyncParams<'_>) -> Result<ProtocolVersion, XrpError> {
    let deadline = Instant::now() + params.timeout;
    let blob = params.hw.sync_data();
    let primary = comm.primary();
    comm.queues().reset_active();

    primary.set_sync(SyncCode::Start);
    barrier();
    let code = match poll_sync(comm, deadline, params.panicked, |c| c != SyncCode::Start)? {
        Poll::Changed(code) | Poll::TimedOut(code) => code,
    };
    let version = match code {
        SyncCode::DspReadyV1 => {
            if comm.queues().active_count() > 1 {
                info!(target: "xrp-comm", "[sync] v1 firmware, using a single queue");
                comm.queues().set_single();
            }
            comm.area().write(V1_DATA_OFFSET, &blob);
            ProtocolVersion::V1
        }
        SyncCode::DspReadyV2 => {
            send_v2(comm, &blob, params.debug)?;
            ProtocolVersion::V2
        }
        SyncCode::Start => {
            error!(target: "xrp-comm", "[sync] DSP is not ready for synchronization");
            return Err(XrpError::Busy);
        }
        other => {
            error!(target: "xrp-comm", "[sync] unrecognized response {:#x} to START", other.raw());
            return Err(XrpError::ProtocolMismatch(format!(
                "unexpected sync word {:#x}",
                other.raw()
            )));
        }
    };

    barrier();
    primary.set_sync(SyncCode::HostToDsp);
    if let Poll::TimedOut(_) =
        poll_sync(comm, deadline, params.panicked, |c| c == SyncCode::DspToHost)?
    {
        error!(target: "xrp-comm", "[sync] DSP did not confirm initialization data");
        return Err(XrpError::Busy);
    }

    if version == ProtocolVersion::V2 {
        complete_v2(comm, blob.len())?;
    }
    params.hw.send_irq();
    Ok(version)
}

/// Run the handshake; queue count and priorities are updated in place.
pub fn synchronize(comm: &Comm, params: &SyncParams<'_>) -> Result<ProtocolVersion, XrpError> {
    let result = negotiate(comm, params);
    comm.primary().set_sync(SyncCode::Idle);
    if result.is_ok() {
        comm.queues().reorder();
    }
    debug!(target: "xrp-comm", "[sync] result {result:?}, {} queue(s)", comm.queues().active_count());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::PhysMemory;
    use std::sync::Arc;

    struct Blob;

    impl DspHardware for Blob {
        fn sync_data(&self) -> Vec<u8> {
            vec![0xab; 32]
        }
    }

    fn comm(priorities: &[u32]) -> (Arc<PhysMemory>, Comm) {
        let mem = PhysMemory::new();
        mem.add_region(0x4000, 0x1000).unwrap();
        let area = mem.map_io(0x4000, 0x1000).unwrap();
        (mem, Comm::new(area, priorities))
    }

    fn run(comm: &Comm, timeout: Duration) -> Result<ProtocolVersion, XrpError> {
        let panicked = || false;
        let params = SyncParams {
            hw: &Blob,
            panicked: &panicked,
            timeout,
            debug: DebugInfo {
                panic_addr: 0,
                log_level: 1,
            },
        };
        synchronize(comm, &params)
    }

    #[test]
    fn silent_dsp_times_out_and_returns_to_idle() {
        let (mem, comm) = comm(&[]);
        let start = Instant::now();
        let result = run(&comm, Duration::from_millis(30));
        assert!(matches!(result, Err(XrpError::Busy)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(mem.read_u32(0x4000).unwrap(), SyncCode::Idle.raw());
    }

    #[test]
    fn unknown_answer_fails_immediately() {
        let (mem, comm) = comm(&[]);
        let writer = std::thread::spawn({
            let mem = Arc::clone(&mem);
            move || {
                while mem.read_u32(0x4000).unwrap() != SyncCode::Start.raw() {
                    std::thread::yield_now();
                }
                mem.write_u32(0x4000, 0x777).unwrap();
            }
        });
        let start = Instant::now();
        let result = run(&comm, Duration::from_secs(10));
        writer.join().unwrap();
        assert!(matches!(result, Err(XrpError::ProtocolMismatch(_))));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
