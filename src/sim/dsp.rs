// Author: Lukas Bower
// Purpose: Firmware model running on its own thread against the shared communication area.

//! Simulated DSP.
//!
//! [`SimDsp`] plays the firmware side of every protocol the driver speaks:
//! it boots from the image at the reset vector, answers the v1 or v2
//! handshake, serves command records on the negotiated queues, implements
//! the common command namespace and posts reports. [`SimHw`] is the control
//! surface the driver sees; run-stall, reset and power changes are applied
//! to the core synchronously so a boot is complete when `release` returns.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, trace, warn};
use spin::Mutex as SpinMutex;
use xrp_wire::panic::{self as panic_layout, PANIC_SENTINEL};
use xrp_wire::ps::{self, DataMoveMsg, PsCommand, ReportAction, ReportConfigMsg, NSID_COMMON_CMD};
use xrp_wire::sync::{V1_DATA_OFFSET, V2_CAPACITY, V2_DATA_OFFSET};
use xrp_wire::{
    cmd, read_u32, BufferFlags, CmdFlags, DebugInfo, DspBuffer, HwSyncData, IrqMode, ReportStatus,
    SyncCode, TlvReader, TlvType, CMD_STRIDE, INLINE_BUFFER_COUNT, INLINE_DATA_SIZE,
    NAMESPACE_ID_SIZE, NO_TRANSLATION, REPORT_TO_HOST_FLAG,
};

use super::elf::SIM_FW_MAGIC;
use super::SimPlatform;
use crate::address_map::AddressMap;
use crate::config::HwConfig;
use crate::hal::{DspHardware, HalError, IoRegion, PhysMemory, SimpleHw};

const STEP_INTERVAL: Duration = Duration::from_micros(50);

/// Misbehaviour injected into the next handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeFault {
    /// Answer correctly.
    #[default]
    None,
    /// Never answer `START`.
    Silent,
    /// Answer `START` with a word no protocol defines.
    UnknownCode,
    /// Grow the hardware description length while accepting it.
    ModifyBlobLength,
    /// Leave the queue priority record unaccepted.
    RejectQueues,
}

/// Counters kept by the simulated firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimDspStats {
    /// Images booted.
    pub boots: u64,
    /// Handshakes completed.
    pub handshakes: u64,
    /// Requests answered.
    pub requests: u64,
    /// Records the host rewrote while a request was being served.
    pub overlaps: u64,
    /// Heartbeat requests answered.
    pub heartbeats: u64,
    /// Data move requests served.
    pub data_moves: u64,
    /// Requests swallowed without an answer.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    boots: AtomicU64,
    handshakes: AtomicU64,
    requests: AtomicU64,
    overlaps: AtomicU64,
    heartbeats: AtomicU64,
    data_moves: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SimDspStats {
        SimDspStats {
            boots: self.boots.load(Ordering::Relaxed),
            handshakes: self.handshakes.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            overlaps: self.overlaps.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            data_moves: self.data_moves.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Off,
    Halted,
    AwaitStart { version: u32 },
    AwaitData { version: u32 },
    Running,
    Crashed,
}

#[derive(Debug)]
struct CoreState {
    phase: Phase,
    version: u32,
    queues: usize,
    log_level: u32,
    panic_addr: u32,
    host_irq: Option<(IrqMode, u32, u32)>,
    report_ids: BTreeSet<u32>,
    swallowed: Vec<bool>,
}

impl CoreState {
    fn new(max_queues: usize) -> Self {
        Self {
            phase: Phase::Off,
            version: 0,
            queues: 1,
            log_level: 0,
            panic_addr: 0,
            host_irq: None,
            report_ids: BTreeSet::new(),
            swallowed: vec![false; max_queues],
        }
    }

    fn forget(&mut self) {
        self.queues = 1;
        self.host_irq = None;
        self.report_ids.clear();
        self.swallowed.iter_mut().for_each(|s| *s = false);
    }
}

#[derive(Debug, Default)]
struct Faults {
    handshake: SpinMutex<HandshakeFault>,
    drop_requests: AtomicUsize,
    panic_next: AtomicBool,
    latency: SpinMutex<Duration>,
}

struct Env {
    memory: Arc<PhysMemory>,
    map: AddressMap,
    comm: IoRegion,
    panic: Option<IoRegion>,
    irq: Option<IoRegion>,
    regs: Option<IoRegion>,
    hw: HwConfig,
}

type IrqHandler = Arc<dyn Fn() + Send + Sync>;

enum Failure {
    Delivery,
    Crash,
}

struct Core {
    env: Env,
    state: Mutex<CoreState>,
    powered: AtomicBool,
    stop: AtomicBool,
    faults: Faults,
    stats: Counters,
    irq_handler: RwLock<Option<IrqHandler>>,
    reports: SpinMutex<VecDeque<(u32, Vec<u8>)>>,
}

impl Core {
    fn state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().expect("poisoned dsp state lock")
    }

    fn record(&self, idx: usize) -> IoRegion {
        self.env.comm.slice(idx * CMD_STRIDE, CMD_STRIDE as u64)
    }

    fn host_addr(&self, dsp: u32) -> Option<u64> {
        if dsp == NO_TRANSLATION {
            return None;
        }
        self.env.map.translate_to_host(dsp).ok()
    }

    fn log_line(&self, line: &str) {
        let Some(ring) = &self.env.panic else {
            return;
        };
        let size = ring.read_u32(panic_layout::SIZE);
        if size == 0 {
            return;
        }
        let mut write = ring.read_u32(panic_layout::WRITE) % size;
        for &byte in line.as_bytes().iter().chain(b"\n") {
            ring.write(panic_layout::DATA + write as usize, &[byte]);
            write = (write + 1) % size;
        }
        ring.write_u32(panic_layout::WRITE, write);
    }

    fn boot(&self, state: &mut CoreState) {
        state.forget();
        let vector = self.env.regs.as_ref().map_or(0, |regs| {
            regs.read_u32(self.env.hw.reset_vector_offset as usize)
        });
        let image = self
            .host_addr(vector)
            .and_then(|host| self.env.memory.read_vec(host, 8).ok());
        let version = image.and_then(|bytes| {
            let magic = read_u32(&bytes, 0).ok()?;
            let version = read_u32(&bytes, 4).ok()?;
            (magic == SIM_FW_MAGIC && matches!(version, 1 | 2)).then_some(version)
        });
        let Some(version) = version else {
            warn!(target: "xrp-sim", "[dsp] no bootable image at {vector:#x}");
            state.phase = Phase::Crashed;
            return;
        };
        if let Some(ring) = &self.env.panic {
            ring.write_u32(panic_layout::PANIC, 0);
        }
        Counters::bump(&self.stats.boots);
        state.version = version;
        self.log_line(&format!("simdsp: boot v{version} at {vector:#x}"));
        info!(target: "xrp-sim", "[dsp] booted protocol v{version} from {vector:#x}");
        state.phase = Phase::AwaitStart { version };
    }

    fn crash(&self, state: &mut CoreState, why: &str) {
        if let Some(ring) = &self.env.panic {
            ring.write_u32(panic_layout::CCOUNT, 0x1234);
            self.log_line(&format!("simdsp: panic: {why}"));
            ring.write_u32(panic_layout::PANIC, PANIC_SENTINEL);
        }
        warn!(target: "xrp-sim", "[dsp] crashed: {why}");
        state.phase = Phase::Crashed;
    }

    fn answer_start(&self, state: &mut CoreState, version: u32) {
        let primary = self.record(0);
        match *self.faults.handshake.lock() {
            HandshakeFault::Silent => return,
            HandshakeFault::UnknownCode => primary.write_u32(cmd::FLAGS, 0x777),
            _ => {
                let ready = if version == 1 {
                    SyncCode::DspReadyV1
                } else {
                    SyncCode::DspReadyV2
                };
                primary.write_u32(cmd::FLAGS, ready.raw());
            }
        }
        state.phase = Phase::AwaitData { version };
    }

    fn adopt_sync_data(state: &mut CoreState, blob: &[u8]) {
        if let Ok(data) = HwSyncData::decode(blob) {
            if let Ok(mode) = IrqMode::from_sync_value(data.host_irq_mode) {
                state.host_irq = Some((mode, data.host_irq_offset, data.host_irq_bit));
            }
        }
    }

    fn accept_v2(&self, state: &mut CoreState) {
        let area = &self.env.comm;
        let fault = *self.faults.handshake.lock();
        let image = area.read_vec(V2_DATA_OFFSET, V2_CAPACITY);
        let mut reader = TlvReader::new(&image);
        while let Ok(Some(tlv)) = reader.next_record() {
            let type_at = V2_DATA_OFFSET + tlv.value_offset - 8;
            let value = reader.value(&tlv).unwrap_or_default();
            let kind = tlv.kind.kind();
            let accepted = if kind == TlvType::HW_SPEC_DATA {
                Self::adopt_sync_data(state, value);
                if fault == HandshakeFault::ModifyBlobLength {
                    area.write_u32(type_at + 4, tlv.len + 4);
                }
                true
            } else if kind == TlvType::HW_QUEUES {
                if fault == HandshakeFault::RejectQueues {
                    false
                } else {
                    state.queues = (tlv.len as usize / 4).clamp(1, state.swallowed.len());
                    true
                }
            } else if kind == TlvType::HW_DEBUG_INFO {
                if let Ok(info) = DebugInfo::decode(value) {
                    state.log_level = info.log_level;
                    state.panic_addr = info.panic_addr;
                }
                true
            } else {
                false
            };
            if accepted {
                area.write_u32(type_at, tlv.kind.accept().raw());
            }
        }
    }

    fn accept_data(&self, state: &mut CoreState, version: u32) {
        if version == 1 {
            let blob = self.env.comm.read_vec(V1_DATA_OFFSET, HwSyncData::SIZE);
            Self::adopt_sync_data(state, &blob);
            state.queues = 1;
        } else {
            self.accept_v2(state);
        }
        self.record(0).write_u32(cmd::FLAGS, SyncCode::DspToHost.raw());
        Counters::bump(&self.stats.handshakes);
        self.log_line(&format!("simdsp: synchronized, {} queue(s)", state.queues));
        debug!(target: "xrp-sim", "[dsp] handshake v{version} done, {} queue(s)", state.queues);
        state.phase = Phase::Running;
    }

    fn read_dsp(&self, dsp: u32, len: usize) -> Result<Vec<u8>, Failure> {
        let host = self.host_addr(dsp).ok_or(Failure::Delivery)?;
        self.env
            .memory
            .read_vec(host, len)
            .map_err(|_| Failure::Delivery)
    }

    fn write_dsp(&self, dsp: u32, data: &[u8]) -> Result<(), Failure> {
        let host = self.host_addr(dsp).ok_or(Failure::Delivery)?;
        self.env
            .memory
            .write(host, data)
            .map_err(|_| Failure::Delivery)
    }

    fn default_handler(&self, input: &[u8], buffers: &[DspBuffer]) -> Result<Vec<u8>, Failure> {
        let src = buffers.iter().find(|b| b.flags.contains(BufferFlags::READ));
        let dst = buffers
            .iter()
            .rev()
            .find(|b| b.flags.contains(BufferFlags::WRITE));
        if let (Some(src), Some(dst)) = (src, dst) {
            if !std::ptr::eq(src, dst) {
                let len = src.size.min(dst.size) as usize;
                let data = self.read_dsp(src.addr, len)?;
                self.write_dsp(dst.addr, &data)?;
            }
        }
        Ok(input.to_vec())
    }

    fn common_handler(&self, state: &mut CoreState, input: &[u8]) -> Result<Vec<u8>, Failure> {
        let ok = 0u32.to_le_bytes().to_vec();
        let (command, body) = ps::decode(input).map_err(|_| Failure::Delivery)?;
        match command {
            PsCommand::LoopbackTest => Ok(body.to_vec()),
            PsCommand::HeartBeatReq => {
                Counters::bump(&self.stats.heartbeats);
                Ok(ok)
            }
            PsCommand::LogConfig => {
                state.log_level = read_u32(body, 0).map_err(|_| Failure::Delivery)?;
                Ok(ok)
            }
            PsCommand::ReportConfig => {
                let msg = ReportConfigMsg::decode(body).map_err(|_| Failure::Delivery)?;
                match msg.action {
                    ReportAction::Setup => state.report_ids.insert(msg.report_id),
                    ReportAction::Release => state.report_ids.remove(&msg.report_id),
                };
                Ok(ok)
            }
            PsCommand::DataMove => {
                let msg = DataMoveMsg::decode(body).map_err(|_| Failure::Delivery)?;
                let src = u32::try_from(msg.src_addr).map_err(|_| Failure::Delivery)?;
                let dst = u32::try_from(msg.dst_addr).map_err(|_| Failure::Delivery)?;
                let data = self.read_dsp(src, msg.size as usize)?;
                self.write_dsp(dst, &data)?;
                Counters::bump(&self.stats.data_moves);
                Ok(ok)
            }
        }
    }

    fn execute(&self, state: &mut CoreState, io: &IoRegion, flags: CmdFlags) -> Result<(), Failure> {
        let in_size = io.read_u32(cmd::IN_DATA_SIZE) as usize;
        let out_size = io.read_u32(cmd::OUT_DATA_SIZE) as usize;
        let buffer_bytes = io.read_u32(cmd::BUFFER_SIZE) as usize;

        let input = if in_size <= INLINE_DATA_SIZE {
            io.read_vec(cmd::IN_DATA, in_size)
        } else {
            self.read_dsp(io.read_u32(cmd::IN_DATA), in_size)?
        };
        let count = buffer_bytes / DspBuffer::SIZE;
        let raw = if count <= INLINE_BUFFER_COUNT {
            io.read_vec(cmd::BUFFER_DATA, buffer_bytes)
        } else {
            self.read_dsp(io.read_u32(cmd::BUFFER_DATA), buffer_bytes)?
        };
        let buffers = DspBuffer::decode_all(&raw, count).map_err(|_| Failure::Delivery)?;

        if self.faults.panic_next.swap(false, Ordering::Relaxed) {
            return Err(Failure::Crash);
        }
        let mut output = if flags.contains(CmdFlags::REQUEST_NSID) {
            let nsid = io.read_vec(cmd::NSID, NAMESPACE_ID_SIZE);
            if nsid != NSID_COMMON_CMD {
                trace!(target: "xrp-sim", "[dsp] no handler for namespace {nsid:02x?}");
                return Err(Failure::Delivery);
            }
            self.common_handler(state, &input)?
        } else {
            self.default_handler(&input, &buffers)?
        };

        output.resize(out_size, 0);
        if out_size <= INLINE_DATA_SIZE {
            io.write(cmd::OUT_DATA, &output);
        } else {
            self.write_dsp(io.read_u32(cmd::OUT_DATA), &output)?;
        }
        Ok(())
    }

    fn serve(&self, state: &mut CoreState, idx: usize) -> bool {
        let io = self.record(idx);
        let flags = CmdFlags::from_bits_retain(io.read_u32(cmd::FLAGS));
        if !flags.contains(CmdFlags::REQUEST_VALID) {
            state.swallowed[idx] = false;
            return false;
        }
        if flags.contains(CmdFlags::RESPONSE_VALID) || state.swallowed[idx] {
            return false;
        }
        if self
            .faults
            .drop_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            debug!(target: "xrp-sim", "[dsp] swallowing request on queue {idx}");
            state.swallowed[idx] = true;
            Counters::bump(&self.stats.dropped);
            return false;
        }

        let before = io.read_vec(0, cmd::RECORD_SIZE);
        let latency = *self.faults.latency.lock();
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let result = self.execute(state, &io, flags);
        if io.read_vec(0, cmd::RECORD_SIZE) != before {
            Counters::bump(&self.stats.overlaps);
        }
        let mut done = flags | CmdFlags::RESPONSE_VALID;
        match result {
            Ok(()) => {}
            Err(Failure::Crash) => {
                self.crash(state, "requested by test");
                return false;
            }
            Err(Failure::Delivery) => done |= CmdFlags::RESPONSE_DELIVERY_FAIL,
        }
        Counters::bump(&self.stats.requests);
        io.write_u32(cmd::FLAGS, done.bits());
        true
    }

    fn post_report(&self, state: &mut CoreState) -> bool {
        let primary = self.record(0);
        if primary.read_u32(cmd::REPORT_STATUS) != ReportStatus::Working as u32
            || primary.read_u32(cmd::REPORT_ID) != 0
        {
            return false;
        }
        let Some((id, payload)) = self.reports.lock().pop_front() else {
            return false;
        };
        if !state.report_ids.contains(&id) {
            warn!(target: "xrp-sim", "[dsp] report {id} was never configured");
            Counters::bump(&self.stats.dropped);
            return false;
        }
        let capacity = primary.read_u32(cmd::REPORT_BUFFER_SIZE) as usize;
        let len = payload.len().min(capacity);
        if self
            .write_dsp(primary.read_u32(cmd::REPORT_ADDR), &payload[..len])
            .is_err()
        {
            return false;
        }
        primary.write_u32(cmd::REPORT_ID, id | REPORT_TO_HOST_FLAG);
        true
    }

    fn raise_host_irq(&self, state: &CoreState) {
        let (Some(irq), Some((mode, offset, bit))) = (&self.env.irq, state.host_irq) else {
            return;
        };
        if mode == IrqMode::None {
            return;
        }
        let offset = offset as usize;
        irq.write_u32(offset, irq.read_u32(offset) | (1 << bit));
    }

    /// One pass over the shared state. Returns true when the host was signalled.
    fn step(&self) -> bool {
        let mut state = self.state();
        if matches!(state.phase, Phase::Off | Phase::Halted) {
            return false;
        }
        if let Some(irq) = &self.env.irq {
            let offset = self.env.hw.device_irq_offset as usize;
            let bit = 1 << self.env.hw.device_irq_bit;
            let value = irq.read_u32(offset);
            if value & bit != 0 {
                irq.write_u32(offset, value & !bit);
            }
        }
        let sync = self.record(0).read_u32(cmd::FLAGS);
        let phase = state.phase;
        match phase {
            Phase::AwaitStart { version } if sync == SyncCode::Start.raw() => {
                self.answer_start(&mut state, version);
                false
            }
            Phase::AwaitData { version } if sync == SyncCode::Start.raw() => {
                self.answer_start(&mut state, version);
                false
            }
            Phase::AwaitData { version } if sync == SyncCode::HostToDsp.raw() => {
                self.accept_data(&mut state, version);
                false
            }
            Phase::Running if sync == SyncCode::Start.raw() => {
                let version = state.version;
                state.forget();
                self.answer_start(&mut state, version);
                false
            }
            Phase::Running => {
                let mut answered = false;
                for idx in 0..state.queues {
                    answered |= self.serve(&mut state, idx);
                    if state.phase != Phase::Running {
                        return false;
                    }
                }
                if answered {
                    self.record(0).write_u32(cmd::CMD_FLAG, REPORT_TO_HOST_FLAG);
                }
                let reported = self.post_report(&mut state);
                if answered || reported {
                    self.raise_host_irq(&state);
                }
                answered || reported
            }
            _ => false,
        }
    }

    fn run(&self) {
        while !self.stop.load(Ordering::Acquire) {
            if self.step() {
                let handler = self
                    .irq_handler
                    .read()
                    .expect("poisoned dsp irq handler lock")
                    .clone();
                if let Some(handler) = handler {
                    handler();
                }
            }
            thread::sleep(STEP_INTERVAL);
        }
    }
}

/// Simulated firmware and the core it runs on.
pub struct SimDsp {
    core: Arc<Core>,
    hw: Arc<SimHw>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SimDsp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDsp")
            .field("stats", &self.stats())
            .finish()
    }
}

impl SimDsp {
    /// Attach a core to `platform` and start its execution thread.
    pub fn start(platform: &SimPlatform) -> Result<Self, HalError> {
        let config = platform.config();
        let memory = platform.memory();
        let map = AddressMap::new(&config.address_map)
            .map_err(|_| HalError::Operation("simulator address map"))?;
        let comm = memory.map_io(config.comm.base, config.comm.size)?;
        let panic = config
            .panic
            .map(|r| memory.map_io(r.base, r.size))
            .transpose()?;
        let irq = config
            .hw
            .irq_regs
            .map(|r| memory.map_io(r.base, r.size))
            .transpose()?;
        let regs = config
            .hw
            .regs
            .map(|r| memory.map_io(r.base, r.size))
            .transpose()?;
        let max_queues = (comm.len() as usize / CMD_STRIDE).max(1);
        let core = Arc::new(Core {
            env: Env {
                memory: Arc::clone(&memory),
                map,
                comm,
                panic,
                irq,
                regs,
                hw: config.hw.clone(),
            },
            state: Mutex::new(CoreState::new(max_queues)),
            powered: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            faults: Faults::default(),
            stats: Counters::default(),
            irq_handler: RwLock::new(None),
            reports: SpinMutex::new(VecDeque::new()),
        });
        let hw = Arc::new(SimHw {
            inner: SimpleHw::new(&memory, &config.hw)?,
            core: Arc::clone(&core),
        });
        let thread = thread::Builder::new()
            .name("sim-dsp".into())
            .spawn({
                let core = Arc::clone(&core);
                move || core.run()
            })
            .map_err(|_| HalError::Operation("spawn dsp thread"))?;
        Ok(Self {
            core,
            hw,
            thread: Some(thread),
        })
    }

    /// Control surface to hand to the driver.
    #[must_use]
    pub fn hardware(&self) -> Arc<SimHw> {
        Arc::clone(&self.hw)
    }

    /// Call `handler` whenever the firmware raises the host interrupt.
    pub fn set_irq_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self
            .core
            .irq_handler
            .write()
            .expect("poisoned dsp irq handler lock") = Some(Arc::new(handler));
    }

    /// Misbehave during subsequent handshakes.
    pub fn set_handshake_fault(&self, fault: HandshakeFault) {
        *self.core.faults.handshake.lock() = fault;
    }

    /// Swallow the next `count` requests without answering.
    pub fn drop_requests(&self, count: usize) {
        self.core
            .faults
            .drop_requests
            .store(count, Ordering::Relaxed);
    }

    /// Crash instead of answering the next request.
    pub fn panic_on_next_request(&self) {
        self.core.faults.panic_next.store(true, Ordering::Relaxed);
    }

    /// Delay every answer by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.core.faults.latency.lock() = latency;
    }

    /// Queue a report for delivery once the host has a buffer and the id is configured.
    pub fn post_report(&self, id: u32, payload: &[u8]) {
        self.core.reports.lock().push_back((id, payload.to_vec()));
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> SimDspStats {
        self.core.stats.snapshot()
    }

    /// Returns true while the core is powered.
    #[must_use]
    pub fn is_powered(&self) -> bool {
        self.core.powered.load(Ordering::Acquire)
    }

    /// Returns true once the firmware is serving requests.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.state().phase == Phase::Running
    }

    /// Queues the firmware is serving.
    #[must_use]
    pub fn negotiated_queues(&self) -> usize {
        self.core.state().queues
    }

    /// Firmware log level last configured by the host.
    #[must_use]
    pub fn log_level(&self) -> u32 {
        self.core.state().log_level
    }

    /// Panic record address announced in the last v2 handshake.
    #[must_use]
    pub fn panic_addr(&self) -> u32 {
        self.core.state().panic_addr
    }

    /// Report ids configured by the host.
    #[must_use]
    pub fn report_ids(&self) -> Vec<u32> {
        self.core.state().report_ids.iter().copied().collect()
    }

    /// Stop the execution thread.
    pub fn stop(&mut self) {
        self.core.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SimDsp {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Driver-facing control of the simulated core.
pub struct SimHw {
    inner: SimpleHw,
    core: Arc<Core>,
}

impl std::fmt::Debug for SimHw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHw").field("inner", &self.inner).finish()
    }
}

impl SimHw {
    /// Register-level view.
    #[must_use]
    pub fn registers(&self) -> &SimpleHw {
        &self.inner
    }
}

impl DspHardware for SimHw {
    fn enable(&self) -> Result<(), HalError> {
        let mut state = self.core.state();
        self.core.powered.store(true, Ordering::Release);
        if state.phase == Phase::Off {
            state.phase = Phase::Halted;
        }
        debug!(target: "xrp-sim", "[dsp] power on");
        Ok(())
    }

    fn disable(&self) {
        let mut state = self.core.state();
        self.core.powered.store(false, Ordering::Release);
        state.phase = Phase::Off;
        debug!(target: "xrp-sim", "[dsp] power off");
    }

    fn halt(&self) {
        let mut state = self.core.state();
        self.inner.halt();
        if state.phase != Phase::Off {
            state.phase = Phase::Halted;
        }
    }

    fn release(&self) {
        let mut state = self.core.state();
        self.inner.release();
        if state.phase == Phase::Halted {
            self.core.boot(&mut state);
        }
    }

    fn reset(&self) {
        let mut state = self.core.state();
        self.inner.reset();
        if state.phase == Phase::Off {
            return;
        }
        if self.inner.runstall() != 0 {
            state.phase = Phase::Halted;
        } else {
            self.core.boot(&mut state);
        }
    }

    fn set_reset_vector(&self, addr: u32) {
        self.inner.set_reset_vector(addr);
    }

    fn send_irq(&self) {
        self.inner.send_irq();
    }

    fn ack_irq(&self) {
        self.inner.ack_irq();
    }

    fn irq_pending(&self) -> bool {
        self.inner.irq_pending()
    }

    fn mmio_base(&self) -> Option<u64> {
        self.inner.mmio_base()
    }

    fn set_device_mmio_base(&self, dsp_addr: u32) {
        self.inner.set_device_mmio_base(dsp_addr);
    }

    fn sync_data(&self) -> Vec<u8> {
        self.inner.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn release_boots_the_preloaded_image() {
        let platform = SimPlatform::new();
        platform.preload_firmware(1).unwrap();
        let dsp = SimDsp::start(&platform).unwrap();
        let hw = dsp.hardware();
        hw.enable().unwrap();
        hw.release();
        assert_eq!(dsp.stats().boots, 1);

        let comm = platform.comm_region();
        comm.write_u32(cmd::FLAGS, SyncCode::Start.raw());
        assert!(wait_for(|| comm.read_u32(cmd::FLAGS) == SyncCode::DspReadyV1.raw()));
        comm.write_u32(cmd::FLAGS, SyncCode::HostToDsp.raw());
        assert!(wait_for(|| comm.read_u32(cmd::FLAGS) == SyncCode::DspToHost.raw()));
        assert!(wait_for(|| dsp.is_running()));
    }

    #[test]
    fn core_without_image_never_answers() {
        let platform = SimPlatform::new();
        let dsp = SimDsp::start(&platform).unwrap();
        let hw = dsp.hardware();
        hw.enable().unwrap();
        hw.release();
        assert_eq!(dsp.stats().boots, 0);
        let comm = platform.comm_region();
        comm.write_u32(cmd::FLAGS, SyncCode::Start.raw());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(comm.read_u32(cmd::FLAGS), SyncCode::Start.raw());
    }
}
