// Author: Lukas Bower
// Purpose: Simulated platform: memory, page allocator, caches, user address space and DSP.

//! Simulation harness.
//!
//! Every hardware seam of the driver has an implementation here so the
//! whole stack runs on a plain host. The default layout puts one DRAM
//! window behind the address map holding the communication area, the panic
//! record, the firmware carve-out, the private pool and the page allocator
//! range, plus a register window for the DSP control and interrupt blocks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use spin::Mutex as SpinMutex;

use crate::address_map::AddressMap;
use crate::config::{DeviceConfig, HwConfig, MapEntryConfig, RegionConfig};
use crate::device::{Device, Platform};
use crate::dmabuf::DmaBufExporter;
use crate::error::XrpError;
use crate::firmware::{load_elf, FirmwareError, FirmwareSource, MemFirmware};
use crate::hal::{CacheOps, DspHardware, HalError, IoRegion, PageProvider, PhysMemory, PAGE_SIZE};
use crate::pool::{FreeListPool, MemoryPool};
use crate::registry::Registry;
use crate::share::DeviceMemory;
use xrp_wire::IrqMode;

pub mod dsp;
pub mod elf;
mod exporter;
mod space;

pub use dsp::{HandshakeFault, SimDsp, SimDspStats, SimHw};
pub use exporter::SimDmaBufExporter;
pub use space::SimAddressSpace;

/// Host base of the simulated DRAM window.
pub const DRAM_BASE: u64 = 0x8000_0000;
/// Size of the simulated DRAM window.
pub const DRAM_SIZE: u64 = 0x100_0000;
/// DSP view of [`DRAM_BASE`].
pub const DRAM_DSP_BASE: u32 = 0x1000_0000;
/// Communication area.
pub const COMM: RegionConfig = RegionConfig {
    base: DRAM_BASE,
    size: 0x1000,
};
/// Panic and log record.
pub const PANIC: RegionConfig = RegionConfig {
    base: DRAM_BASE + 0x1000,
    size: 0x1000,
};
/// Firmware carve-out.
pub const FIRMWARE: RegionConfig = RegionConfig {
    base: DRAM_BASE + 0x10_0000,
    size: 0x10_0000,
};
/// Range the simulated DMA-buf exporter carves buffers from.
pub const DMABUF: RegionConfig = RegionConfig {
    base: DRAM_BASE + 0x20_0000,
    size: 0x20_0000,
};
/// Private allocation pool.
pub const POOL: RegionConfig = RegionConfig {
    base: DRAM_BASE + 0x40_0000,
    size: 0x40_0000,
};
/// Range handed out by the simulated page allocator.
pub const PAGES: RegionConfig = RegionConfig {
    base: DRAM_BASE + 0x80_0000,
    size: 0x80_0000,
};
/// DSP control registers.
pub const REGS: RegionConfig = RegionConfig {
    base: 0xa000_0000,
    size: 0x8000,
};
/// Interrupt registers.
pub const IRQ_REGS: RegionConfig = RegionConfig {
    base: 0xa001_0000,
    size: 0x100,
};
/// DSP address of the firmware entry point.
pub const FIRMWARE_ENTRY: u32 = DRAM_DSP_BASE + 0x10_0000;
/// Name the default configuration boots.
pub const FIRMWARE_NAME: &str = "xrp0.elf";

const DEFAULT_MAX_ORDER: u32 = 11;

/// Physically contiguous page runs carved from one range.
///
/// Runs are naturally aligned to their size, like a buddy allocator; freed
/// runs are reused for requests of the same order.
#[derive(Debug)]
pub struct SimPageProvider {
    base: u64,
    size: u64,
    max_order: u32,
    state: SpinMutex<PageState>,
    outstanding: AtomicUsize,
}

#[derive(Debug, Default)]
struct PageState {
    next: u64,
    free: BTreeMap<u32, Vec<u64>>,
}

impl SimPageProvider {
    /// Allocator over `[base, base + size)`.
    #[must_use]
    pub fn new(base: u64, size: u64, max_order: u32) -> Self {
        Self {
            base,
            size,
            max_order,
            state: SpinMutex::new(PageState {
                next: base,
                free: BTreeMap::new(),
            }),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Pages currently handed out.
    #[must_use]
    pub fn outstanding_pages(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl PageProvider for SimPageProvider {
    fn alloc_pages(&self, order: u32) -> Option<u64> {
        let run = PAGE_SIZE << order;
        let mut state = self.state.lock();
        let start = match state.free.get_mut(&order).and_then(Vec::pop) {
            Some(start) => start,
            None => {
                let start = state.next.checked_add(run - 1)? & !(run - 1);
                if start + run > self.base + self.size {
                    return None;
                }
                state.next = start + run;
                start
            }
        };
        self.outstanding.fetch_add(1 << order, Ordering::Relaxed);
        Some(start)
    }

    fn free_pages(&self, phys: u64, order: u32) {
        self.state.lock().free.entry(order).or_default().push(phys);
        self.outstanding.fetch_sub(1 << order, Ordering::Relaxed);
    }

    fn max_order(&self) -> u32 {
        self.max_order
    }
}

/// Cache model counting maintenance operations.
#[derive(Debug)]
pub struct SimCache {
    cacheable: AtomicBool,
    cleans: AtomicUsize,
    invalidates: AtomicUsize,
}

impl Default for SimCache {
    fn default() -> Self {
        Self {
            cacheable: AtomicBool::new(true),
            cleans: AtomicUsize::new(0),
            invalidates: AtomicUsize::new(0),
        }
    }
}

impl SimCache {
    /// Make every range (un)manageable.
    pub fn set_cacheable(&self, cacheable: bool) {
        self.cacheable.store(cacheable, Ordering::Relaxed);
    }

    /// `(cleans, invalidates)` performed so far.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        (
            self.cleans.load(Ordering::Relaxed),
            self.invalidates.load(Ordering::Relaxed),
        )
    }
}

impl CacheOps for SimCache {
    fn clean(&self, _phys: u64, _len: u64) {
        self.cleans.fetch_add(1, Ordering::Relaxed);
    }

    fn invalidate(&self, _phys: u64, _len: u64) {
        self.invalidates.fetch_add(1, Ordering::Relaxed);
    }

    fn cacheable(&self, _phys: u64, _len: u64) -> bool {
        self.cacheable.load(Ordering::Relaxed)
    }
}

/// A simulated board.
#[derive(Debug)]
pub struct SimPlatform {
    memory: Arc<PhysMemory>,
    pages: Arc<SimPageProvider>,
    cache: Arc<SimCache>,
    firmware: Arc<MemFirmware>,
    exporter: Arc<SimDmaBufExporter>,
    config: DeviceConfig,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    /// Board with the default layout and a v2 firmware image installed.
    #[must_use]
    pub fn new() -> Self {
        let platform = Self::with_config(Self::default_config(), PAGES)
            .expect("default simulator layout is consistent");
        platform.install_firmware(2);
        platform
    }

    /// Configuration matching the default layout.
    #[must_use]
    pub fn default_config() -> DeviceConfig {
        DeviceConfig {
            command_timeout_secs: 1,
            firmware_name: Some(FIRMWARE_NAME.to_owned()),
            address_map: vec![
                MapEntryConfig {
                    src: DRAM_BASE,
                    dst: DRAM_DSP_BASE,
                    size: DRAM_SIZE,
                },
                MapEntryConfig {
                    src: REGS.base,
                    dst: 0xffe0_0000,
                    size: 0x2_0000,
                },
            ],
            pool: Some(POOL),
            comm: COMM,
            panic: Some(PANIC),
            reserved: vec![FIRMWARE],
            hw: HwConfig {
                regs: Some(REGS),
                irq_regs: Some(IRQ_REGS),
                device_irq_mode: IrqMode::Level,
                device_irq_offset: 0,
                device_irq_bit: 0,
                device_irq: 3,
                host_irq_mode: IrqMode::Level,
                host_irq_offset: 4,
                host_irq_bit: 0,
                ..HwConfig::default()
            },
            ..DeviceConfig::default()
        }
    }

    /// Board backing every region `config` names, with pages served from `pages`.
    pub fn with_config(config: DeviceConfig, pages: RegionConfig) -> Result<Self, HalError> {
        let memory = PhysMemory::new();
        let mut regions: Vec<RegionConfig> = config
            .address_map
            .iter()
            .map(|e| RegionConfig {
                base: e.src,
                size: e.size,
            })
            .collect();
        regions.push(config.comm);
        regions.extend(config.panic);
        regions.extend(config.pool);
        regions.extend(config.reserved.iter().copied());
        regions.extend(config.hw.regs);
        regions.extend(config.hw.irq_regs);
        regions.push(pages);
        for region in regions {
            if !memory.contains(region.base, region.size) {
                memory.add_region(region.base, region.size)?;
            }
        }
        debug!(target: "xrp-sim", "[sim] platform {memory:?}");
        Ok(Self {
            pages: Arc::new(SimPageProvider::new(pages.base, pages.size, DEFAULT_MAX_ORDER)),
            cache: Arc::new(SimCache::default()),
            firmware: Arc::new(MemFirmware::new()),
            exporter: Arc::new(SimDmaBufExporter::new(Arc::clone(&memory), DMABUF)),
            memory,
            config,
        })
    }

    /// Physical memory.
    #[must_use]
    pub fn memory(&self) -> Arc<PhysMemory> {
        Arc::clone(&self.memory)
    }

    /// Page allocator.
    #[must_use]
    pub fn pages(&self) -> Arc<SimPageProvider> {
        Arc::clone(&self.pages)
    }

    /// Cache model.
    #[must_use]
    pub fn cache(&self) -> Arc<SimCache> {
        Arc::clone(&self.cache)
    }

    /// Firmware store.
    #[must_use]
    pub fn firmware(&self) -> Arc<MemFirmware> {
        Arc::clone(&self.firmware)
    }

    /// DMA-buf exporter.
    #[must_use]
    pub fn exporter(&self) -> Arc<SimDmaBufExporter> {
        Arc::clone(&self.exporter)
    }

    /// Configuration the board was built from.
    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Communication area as an I/O view.
    #[must_use]
    pub fn comm_region(&self) -> IoRegion {
        self.memory
            .map_io(self.config.comm.base, self.config.comm.size)
            .expect("communication area is backed")
    }

    /// Memory resources a device on this board would use.
    #[must_use]
    pub fn device_memory(&self) -> DeviceMemory {
        let pages: Arc<dyn PageProvider> = self.pages();
        DeviceMemory {
            phys: self.memory(),
            pool: MemoryPool::new(
                self.config
                    .pool
                    .map(|p| Arc::new(FreeListPool::new(p.base, p.size))),
                Some(pages),
            ),
            map: AddressMap::new(&self.config.address_map).unwrap_or_default(),
            cache: self.cache(),
        }
    }

    /// Store a simulated firmware image speaking `protocol` under the configured name.
    pub fn install_firmware(&self, protocol: u32) {
        if let Some(name) = &self.config.firmware_name {
            self.firmware
                .insert(name.clone(), elf::firmware_image(FIRMWARE_ENTRY, protocol));
        }
    }

    /// Place an image in memory and point the core at it, as a debugger would.
    pub fn preload_firmware(&self, protocol: u32) -> Result<(), FirmwareError> {
        let map = AddressMap::new(&self.config.address_map)
            .map_err(|_| FirmwareError::Elf("simulator address map is invalid"))?;
        let entry = load_elf(&elf::firmware_image(FIRMWARE_ENTRY, protocol), &map, &self.memory)?;
        if let Some(regs) = self.config.hw.regs {
            self.memory.write_u32(
                regs.base + u64::from(self.config.hw.reset_vector_offset),
                entry & 0xffff_ff00,
            )?;
        }
        Ok(())
    }

    /// Hardware seams of this board, controlling the core through `hw`.
    #[must_use]
    pub fn platform(&self, hw: Arc<dyn DspHardware>) -> Platform {
        Platform {
            phys: self.memory(),
            pages: Some(self.pages() as Arc<dyn PageProvider>),
            cache: self.cache() as Arc<dyn CacheOps>,
            hw,
            firmware: Some(self.firmware() as Arc<dyn FirmwareSource>),
            dmabuf: Some(self.exporter() as Arc<dyn DmaBufExporter>),
        }
    }
}

/// A booted simulated board: core, device and one user address space.
#[derive(Debug)]
pub struct SimBoard {
    /// Driver-side device.
    pub device: Arc<Device>,
    /// Simulated core.
    pub dsp: SimDsp,
    /// Caller address space.
    pub space: Arc<SimAddressSpace>,
    /// Board resources.
    pub platform: SimPlatform,
}

impl SimBoard {
    /// Start a core on `platform` and probe a device against it.
    pub fn boot(platform: SimPlatform) -> Result<Self, XrpError> {
        let dsp = SimDsp::start(&platform)?;
        let device = Device::probe(
            platform.config().clone(),
            platform.platform(dsp.hardware()),
            Arc::new(Registry::new()),
        )?;
        let weak = Arc::downgrade(&device);
        dsp.set_irq_handler(move || {
            if let Some(device) = weak.upgrade() {
                device.handle_irq();
            }
        });
        let space = SimAddressSpace::new(platform.memory(), platform.pages());
        Ok(Self {
            device,
            dsp,
            space,
            platform,
        })
    }
}
