// Author: Lukas Bower
// Purpose: One DSP instance: probe, boot, power management, command submission and interrupts.

//! DSP device.
//!
//! [`Device::probe`] wires the configured memory, communication area and
//! hardware seams together. [`Device::submit`] runs one synchronous command
//! on the queue selected by its priority hint. A command that times out
//! triggers at most one firmware reboot per epoch: the first queue to see the
//! timeout stops every other queue, reboots, publishes the completed epoch and
//! retries its command once. A failed reboot or a second timeout switches the
//! device off for good.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use heapless::String as HeaplessString;
use log::{debug, error, info, warn};
use xrp_wire::ps::{self, DataMoveMsg, PsCommand, ReportAction, ReportConfigMsg, NSID_COMMON_CMD};
use xrp_wire::{read_u32, BufferFlags, DebugInfo, SyncCode};

use crate::address_map::AddressMap;
use crate::comm::{synchronize, Comm, ProtocolVersion, SyncParams};
use crate::config::{DeviceConfig, LoadMode, MAX_FW_LOG_LEVEL};
use crate::dmabuf::{DmaBufExporter, DmaBufFd, DmaBufTable};
use crate::error::XrpError;
use crate::firmware::{load_elf, DirFirmware, FirmwareSource};
use crate::hal::phys::barrier;
use crate::hal::{CacheOps, DspHardware, PageProvider, PhysMemory};
use crate::panic_log::PanicLog;
use crate::pool::{FreeListPool, MemoryPool};
use crate::queue::Queue;
use crate::registry::{node_name, Registry, NODE_NAME_CAPACITY};
use crate::report::{ReportHandler, Reporter};
use crate::request::{MappedRequest, QueueRequest};
use crate::share::{AddressSpace, DeviceMemory, NoUserSpace, Sharer};

/// Hardware seams a device is built on.
pub struct Platform {
    /// Physical memory.
    pub phys: Arc<PhysMemory>,
    /// Page allocator backing the pool fallback.
    pub pages: Option<Arc<dyn PageProvider>>,
    /// Cache maintenance.
    pub cache: Arc<dyn CacheOps>,
    /// DSP control.
    pub hw: Arc<dyn DspHardware>,
    /// Firmware images; a directory source is used when absent and configured.
    pub firmware: Option<Arc<dyn FirmwareSource>>,
    /// DMA-buf exporter for imports.
    pub dmabuf: Option<Arc<dyn DmaBufExporter>>,
}

/// A probed DSP.
pub struct Device {
    config: DeviceConfig,
    hw: Arc<dyn DspHardware>,
    firmware: Option<Arc<dyn FirmwareSource>>,
    mem: DeviceMemory,
    comm: Comm,
    panic: PanicLog,
    reporter: Reporter,
    dmabufs: Option<DmaBufTable>,
    registry: Arc<Registry>,
    node: u32,
    off: AtomicBool,
    powered: AtomicBool,
    reboot_cycle: AtomicU32,
    reboot_cycle_complete: AtomicU32,
    reboots: AtomicU64,
    users: Mutex<usize>,
    protocol: Mutex<Option<ProtocolVersion>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("node", &self.node)
            .field("off", &self.is_off())
            .field("powered", &self.is_powered())
            .field("reboots", &self.reboot_count())
            .finish()
    }
}

impl Device {
    /// Build a device from `config` on `platform` and, unless runtime power
    /// management is enabled, boot it.
    pub fn probe(
        config: DeviceConfig,
        platform: Platform,
        registry: Arc<Registry>,
    ) -> Result<Arc<Self>, XrpError> {
        config.validate()?;
        let map = AddressMap::new(&config.address_map)?;
        let primary = config
            .pool
            .map(|p| Arc::new(FreeListPool::new(p.base, p.size)));
        let pool = MemoryPool::new(primary, platform.pages.clone());
        let comm = Comm::new(
            platform.phys.map_io(config.comm.base, config.comm.size)?,
            &config.queue_priority,
        );
        let panic = PanicLog::new(
            config
                .panic
                .map(|r| platform.phys.map_io(r.base, r.size))
                .transpose()?,
        );

        if config.loopback.uses_mmio() {
            if let Some(base) = platform.hw.mmio_base() {
                let dsp = map.translate(base).map_err(|_| {
                    error!(target: "xrp-device", "[probe] interrupt registers at {base:#x} are not DSP visible");
                    XrpError::Untranslatable(base)
                })?;
                platform.hw.set_device_mmio_base(dsp);
            }
        }
        panic.init();

        let firmware = platform.firmware.or_else(|| {
            config
                .firmware_dir
                .clone()
                .map(|dir| Arc::new(DirFirmware::new(dir)) as Arc<dyn FirmwareSource>)
        });
        let node = registry.alloc_node();
        let device = Arc::new(Self {
            hw: platform.hw,
            firmware,
            mem: DeviceMemory {
                phys: platform.phys,
                pool,
                map,
                cache: platform.cache,
            },
            comm,
            panic,
            reporter: Reporter::new(),
            dmabufs: platform.dmabuf.map(DmaBufTable::new),
            registry,
            node,
            off: AtomicBool::new(false),
            powered: AtomicBool::new(false),
            reboot_cycle: AtomicU32::new(0),
            reboot_cycle_complete: AtomicU32::new(0),
            reboots: AtomicU64::new(0),
            users: Mutex::new(0),
            protocol: Mutex::new(None),
            config,
        });
        info!(
            target: "xrp-device",
            "[probe] {} with {} queue(s), loopback {:?}",
            device.node_name(),
            device.comm.queues().all().len(),
            device.config.loopback
        );
        if !device.config.runtime_pm {
            device.resume()?;
        }
        Ok(device)
    }

    fn hw_ops(&self) -> Option<&dyn DspHardware> {
        self.config.loopback.uses_mmio().then_some(self.hw.as_ref())
    }

    fn load_firmware(&self, name: &str) -> Result<u32, XrpError> {
        let source = self
            .firmware
            .as_ref()
            .ok_or_else(|| XrpError::invalid("no firmware source configured"))?;
        let image = source.fetch(name)?;
        Ok(load_elf(&image, &self.mem.map, &self.mem.phys)?)
    }

    fn sync(&self) -> Result<ProtocolVersion, XrpError> {
        let panicked = || self.panic.check();
        // The firmware gets the physical address of the record, as on hardware.
        let panic_addr = match self.panic.base().map(u32::try_from) {
            Some(Ok(base)) => base,
            Some(Err(_)) => {
                warn!(target: "xrp-device", "[boot] panic record above 4 GiB is not announced");
                0
            }
            None => 0,
        };
        let params = SyncParams {
            hw: self.hw.as_ref(),
            panicked: &panicked,
            timeout: self.config.command_timeout(),
            debug: DebugInfo {
                panic_addr,
                log_level: self.config.fw_log_level,
            },
        };
        let version = synchronize(&self.comm, &params)?;
        *self.protocol.lock().expect("poisoned protocol lock") = Some(version);
        self.reporter.republish(&self.mem, self.comm.primary())?;
        Ok(version)
    }

    /// Halt, load, reset, release and synchronize, as configured.
    ///
    /// Callers hold every queue lock. A failed handshake switches the device off.
    fn boot_firmware(&self) -> Result<(), XrpError> {
        let loopback = self.config.loopback;
        let hw = self.hw_ops();
        if self.config.load_mode == LoadMode::Auto {
            if let Some(hw) = hw {
                hw.halt();
            }
            let mut entry = 0;
            if loopback.loads_firmware() {
                if let Some(name) = &self.config.firmware_name {
                    entry = self.load_firmware(name).map_err(|err| {
                        error!(target: "xrp-device", "[boot] loading {name} failed: {err}");
                        err
                    })?;
                }
            }
            if loopback.uses_io() {
                self.comm.primary().set_sync(SyncCode::Idle);
                barrier();
            }
            if let Some(hw) = hw {
                if entry != 0 {
                    hw.set_reset_vector(entry);
                }
                hw.reset();
            }
        }
        if let Some(hw) = hw {
            hw.release();
        }
        if loopback.uses_io() {
            if let Err(err) = self.sync() {
                if let Some(hw) = hw {
                    hw.halt();
                }
                error!(target: "xrp-device", "[boot] synchronization failed: {err}, {} stays off", self.node_name());
                self.off.store(true, Ordering::Release);
                return Err(err);
            }
        }
        debug!(target: "xrp-device", "[boot] {} up", self.node_name());
        Ok(())
    }

    /// Power the core and boot it.
    pub fn resume(&self) -> Result<(), XrpError> {
        let _queues = self.comm.queues().lock_others(None);
        if self.is_off() {
            return Ok(());
        }
        if let Some(hw) = self.hw_ops() {
            hw.enable()?;
        }
        self.powered.store(true, Ordering::Release);
        if let Err(err) = self.boot_firmware() {
            if let Some(hw) = self.hw_ops() {
                hw.disable();
            }
            self.powered.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(())
    }

    /// Stop and power down the core.
    pub fn suspend(&self) {
        let _queues = self.comm.queues().lock_others(None);
        if let Some(hw) = self.hw_ops() {
            hw.halt();
            hw.reset();
            hw.disable();
        }
        self.powered.store(false, Ordering::Release);
        debug!(target: "xrp-device", "[pm] {} suspended", self.node_name());
    }

    /// Take a runtime power reference, resuming on the first one.
    pub fn pm_get(&self) -> Result<(), XrpError> {
        let mut users = self.users.lock().expect("poisoned pm users lock");
        if *users == 0 && self.config.runtime_pm {
            self.resume()?;
        }
        *users += 1;
        Ok(())
    }

    /// Drop a runtime power reference, suspending on the last one.
    pub fn pm_put(&self) {
        let mut users = self.users.lock().expect("poisoned pm users lock");
        *users = users.saturating_sub(1);
        if *users == 0 && self.config.runtime_pm {
            self.suspend();
        }
    }

    fn wait(&self, queue: &Queue) -> Result<(), XrpError> {
        let panicked = || self.panic.check();
        let timeout = self.config.command_timeout();
        if self.config.host_irq {
            queue.wait_irq(timeout, &panicked)
        } else {
            queue.wait_poll(timeout, &panicked)
        }
    }

    fn reboot(&self, queue: &Queue) -> Result<(), XrpError> {
        let _others = self.comm.queues().lock_others(Some(queue.index()));
        warn!(target: "xrp-device", "[reboot] {} timed out on queue {}, rebooting", self.node_name(), queue.index());
        self.reboots.fetch_add(1, Ordering::Relaxed);
        let result = self.boot_firmware();
        self.reboot_cycle_complete
            .store(self.reboot_cycle.load(Ordering::Acquire), Ordering::Release);
        result
    }

    /// Run `request` synchronously and return its driver-owned output.
    pub fn submit(&self, sharer: &Sharer<'_>, request: &QueueRequest) -> Result<Vec<u8>, XrpError> {
        if self.is_off() {
            return Err(XrpError::DeviceOff);
        }
        let mut mapped = MappedRequest::map(sharer, request)?;
        let queue = self.comm.queues().select(request.flags);
        let mut retried = false;
        loop {
            let guard = queue.lock();
            if self.reboot_cycle.load(Ordering::Acquire)
                != self.reboot_cycle_complete.load(Ordering::Acquire)
            {
                drop(guard);
                thread::yield_now();
                continue;
            }
            if self.is_off() {
                drop(guard);
                mapped.unmap_nowb(sharer);
                return Err(XrpError::DeviceOff);
            }
            if !self.config.loopback.uses_io() {
                drop(guard);
                return mapped.unmap(sharer);
            }

            queue.completion().reinit();
            queue.record().fill(&mapped);
            if let Some(hw) = self.hw_ops() {
                hw.send_irq();
            }
            match self.wait(queue) {
                Ok(()) => {
                    let completed = queue.record().complete(&mut mapped);
                    drop(guard);
                    return match completed {
                        Ok(()) => mapped.unmap(sharer),
                        Err(err) => {
                            mapped.unmap_nowb(sharer);
                            Err(err)
                        }
                    };
                }
                Err(XrpError::Busy) if self.config.firmware_reboot => {
                    if retried {
                        error!(target: "xrp-device", "[reboot] command timed out again, switching {} off", self.node_name());
                        self.off.store(true, Ordering::Release);
                        drop(guard);
                        mapped.leak();
                        return Err(XrpError::Busy);
                    }
                    let cycle = self.reboot_cycle.fetch_add(1, Ordering::AcqRel) + 1;
                    if cycle != self.reboot_cycle_complete.load(Ordering::Acquire) + 1 {
                        drop(guard);
                        mapped.unmap_nowb(sharer);
                        return Err(XrpError::Busy);
                    }
                    if let Err(err) = self.reboot(queue) {
                        error!(target: "xrp-device", "[reboot] failed: {err}, switching {} off", self.node_name());
                        self.off.store(true, Ordering::Release);
                        drop(guard);
                        mapped.leak();
                        return Err(err);
                    }
                    retried = true;
                }
                Err(err) => {
                    drop(guard);
                    mapped.unmap_nowb(sharer);
                    return Err(err);
                }
            }
        }
    }

    /// Host interrupt handler; returns false when the interrupt was not ours.
    pub fn handle_irq(&self) -> bool {
        if !self.hw.irq_pending() {
            return false;
        }
        self.hw.ack_irq();
        self.reporter.dispatch(&self.mem, self.comm.primary());
        if self.comm.take_cmd_notification() {
            let completed = self.comm.complete_finished();
            debug!(target: "xrp-device", "[irq] {completed} queue(s) completed");
        }
        true
    }

    fn ps_command(&self, command: PsCommand, body: &[u8], out_size: u32) -> Result<Vec<u8>, XrpError> {
        let request = QueueRequest::kernel(NSID_COMMON_CMD, ps::encode(command, body), out_size);
        let space = NoUserSpace;
        let sharer = Sharer::new(&self.mem, &self.registry, None, &space);
        self.submit(&sharer, &request)
    }

    fn ps_status(&self, command: PsCommand, body: &[u8]) -> Result<(), XrpError> {
        let out = self.ps_command(command, body, 4)?;
        match read_u32(&out, 0)? {
            0 => Ok(()),
            status => {
                warn!(target: "xrp-device", "[ps] {command:?} returned status {status}");
                Err(XrpError::Delivery)
            }
        }
    }

    /// Have the firmware echo `payload`.
    pub fn loopback_test(&self, payload: &[u8]) -> Result<Vec<u8>, XrpError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| XrpError::invalid("loopback payload too large"))?;
        self.ps_command(PsCommand::LoopbackTest, payload, len)
    }

    /// Have the firmware copy `size` bytes between two host physical addresses.
    pub fn data_move(&self, src: u64, dst: u64, size: u32) -> Result<(), XrpError> {
        let msg = DataMoveMsg {
            src_addr: u64::from(self.mem.translate(src)?),
            dst_addr: u64::from(self.mem.translate(dst)?),
            size,
        };
        self.ps_status(PsCommand::DataMove, &msg.encode())
    }

    /// Liveness probe.
    pub fn heartbeat(&self) -> Result<(), XrpError> {
        self.ps_status(PsCommand::HeartBeatReq, &[])
    }

    /// Change the firmware log level at run time.
    pub fn set_fw_log_level(&self, level: u32) -> Result<(), XrpError> {
        if level > MAX_FW_LOG_LEVEL {
            return Err(XrpError::invalid(format!("log level {level} out of range")));
        }
        self.ps_status(PsCommand::LogConfig, &level.to_le_bytes())
    }

    /// Allocate the report buffer and publish it to the firmware.
    pub fn setup_reports(&self, capacity: u32) -> Result<u64, XrpError> {
        self.reporter.setup(&self.mem, self.comm.primary(), capacity)
    }

    /// Withdraw the report buffer.
    pub fn release_reports(&self) -> bool {
        self.reporter.release(self.comm.primary())
    }

    /// Register `handler` for reports of `size` bytes and announce the id to the firmware.
    pub fn register_report(&self, size: u32, handler: ReportHandler) -> Result<u32, XrpError> {
        let id = self.reporter.register(size, handler)?;
        let msg = ReportConfigMsg {
            action: ReportAction::Setup,
            report_id: id,
            size,
        };
        if let Err(err) = self.ps_status(PsCommand::ReportConfig, &msg.encode()) {
            self.reporter.unregister(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Stop reports with `id`.
    pub fn unregister_report(&self, id: u32) -> Result<(), XrpError> {
        let msg = ReportConfigMsg {
            action: ReportAction::Release,
            report_id: id,
            size: 0,
        };
        let result = self.ps_status(PsCommand::ReportConfig, &msg.encode());
        self.reporter.unregister(id);
        result
    }

    fn dmabufs(&self) -> Result<&DmaBufTable, XrpError> {
        self.dmabufs
            .as_ref()
            .ok_or_else(|| XrpError::invalid("no dma-buf exporter"))
    }

    /// Import an exported buffer into `space`.
    pub fn import_dmabuf(
        &self,
        space: &dyn AddressSpace,
        fd: DmaBufFd,
        flags: BufferFlags,
    ) -> Result<u64, XrpError> {
        self.dmabufs()?.import(space, fd, flags)
    }

    /// Drop one import reference of `fd`.
    pub fn release_dmabuf(&self, space: &dyn AddressSpace, fd: DmaBufFd) -> Result<(), XrpError> {
        self.dmabufs()?.release(space, fd)
    }

    /// Synchronise an imported buffer by direction.
    pub fn sync_dmabuf(&self, fd: DmaBufFd, flags: BufferFlags) -> Result<(), XrpError> {
        self.dmabufs()?.sync(&self.mem, fd, flags)
    }

    /// Returns true once the device has been switched off.
    #[must_use]
    pub fn is_off(&self) -> bool {
        self.off.load(Ordering::Acquire)
    }

    /// Returns true while the core is powered.
    #[must_use]
    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    /// Firmware reboots performed after command timeouts.
    #[must_use]
    pub fn reboot_count(&self) -> u64 {
        self.reboots.load(Ordering::Relaxed)
    }

    /// Protocol negotiated by the last handshake.
    #[must_use]
    pub fn protocol(&self) -> Option<ProtocolVersion> {
        *self.protocol.lock().expect("poisoned protocol lock")
    }

    /// Queues negotiated with the firmware.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.comm.queues().active_count()
    }

    /// Node id.
    #[must_use]
    pub fn node(&self) -> u32 {
        self.node
    }

    /// Node name, e.g. `xvp0`.
    #[must_use]
    pub fn node_name(&self) -> HeaplessString<NODE_NAME_CAPACITY> {
        node_name(self.node)
    }

    /// Configuration the device was probed with.
    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Memory resources.
    #[must_use]
    pub fn memory(&self) -> &DeviceMemory {
        &self.mem
    }

    /// Driver registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Panic and log record reader.
    #[must_use]
    pub fn panic_log(&self) -> &PanicLog {
        &self.panic
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.is_powered() {
            if let Some(hw) = self.hw_ops() {
                hw.halt();
                hw.disable();
            }
        }
        self.registry.release_node(self.node);
        debug!(target: "xrp-device", "[remove] {}", node_name(self.node));
    }
}
