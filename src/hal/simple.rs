// Author: Lukas Bower
// Purpose: Register-level control of a DSP core wired through a simple MMIO block.

//! Simple hardware integration: a control block with run-stall, reset and
//! reset-vector registers, plus an interrupt block carrying one doorbell bit
//! per direction.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use xrp_wire::{HwSyncData, IrqMode};

use super::phys::{barrier, IoRegion, PhysMemory};
use super::{DspHardware, HalError};
use crate::config::HwConfig;

const RESET_BIT: u32 = 1 << 8;
const RESET_VECTOR_MASK: u32 = 0xffff_ff00;
const EDGE_SW_ACK_TIMEOUT: Duration = Duration::from_millis(200);

/// DSP control through memory-mapped registers.
#[derive(Debug)]
pub struct SimpleHw {
    regs: Option<IoRegion>,
    irq_regs: Option<IoRegion>,
    config: HwConfig,
    device_mmio_base: AtomicU32,
}

impl SimpleHw {
    /// Map the register blocks named by `config`.
    pub fn new(mem: &PhysMemory, config: &HwConfig) -> Result<Self, HalError> {
        let regs = config
            .regs
            .map(|r| mem.map_io(r.base, r.size))
            .transpose()?;
        let irq_regs = config
            .irq_regs
            .map(|r| mem.map_io(r.base, r.size))
            .transpose()?;
        Ok(Self {
            regs,
            irq_regs,
            config: config.clone(),
            device_mmio_base: AtomicU32::new(0),
        })
    }

    fn write_reg(&self, offset: u32, value: u32) {
        if let Some(regs) = &self.regs {
            regs.write_u32(offset as usize, value);
        }
    }

    fn read_reg(&self, offset: u32) -> u32 {
        self.regs
            .as_ref()
            .map_or(0, |regs| regs.read_u32(offset as usize))
    }

    /// Current run-stall register value.
    #[must_use]
    pub fn runstall(&self) -> u32 {
        self.read_reg(self.config.runstall_offset)
    }

    /// Current reset-vector register value.
    #[must_use]
    pub fn reset_vector(&self) -> u32 {
        self.read_reg(self.config.reset_vector_offset)
    }

    fn device_bit(&self) -> u32 {
        1 << self.config.device_irq_bit
    }

    fn host_bit(&self) -> u32 {
        1 << self.config.host_irq_bit
    }
}

impl DspHardware for SimpleHw {
    fn halt(&self) {
        self.write_reg(self.config.runstall_offset, 1);
        debug!(target: "xrp-hw", "[hw] halt runstall={:#x}", self.runstall());
    }

    fn release(&self) {
        self.write_reg(self.config.runstall_offset, 0);
        debug!(target: "xrp-hw", "[hw] release");
    }

    fn reset(&self) {
        let current = self.read_reg(self.config.reset_offset);
        self.write_reg(self.config.reset_offset, current | RESET_BIT);
        barrier();
        self.write_reg(self.config.reset_offset, current & !RESET_BIT);
        debug!(target: "xrp-hw", "[hw] reset pulse");
    }

    fn set_reset_vector(&self, addr: u32) {
        self.write_reg(self.config.reset_vector_offset, addr & RESET_VECTOR_MASK);
        debug!(target: "xrp-hw", "[hw] reset vector={:#x}", self.reset_vector());
    }

    fn send_irq(&self) {
        let Some(irq) = &self.irq_regs else {
            return;
        };
        let offset = self.config.device_irq_offset as usize;
        let bit = self.device_bit();
        match self.config.device_irq_mode {
            IrqMode::EdgeSw => {
                irq.write_u32(offset, bit);
                let deadline = Instant::now() + EDGE_SW_ACK_TIMEOUT;
                while irq.read_u32(offset) & bit != 0 {
                    if Instant::now() >= deadline {
                        warn!(target: "xrp-hw", "[hw] doorbell not acknowledged by the DSP");
                        break;
                    }
                    std::thread::yield_now();
                }
            }
            IrqMode::Edge => {
                irq.write_u32(offset, 0);
                barrier();
                irq.write_u32(offset, bit);
            }
            IrqMode::Level => {
                barrier();
                irq.write_u32(offset, bit);
            }
            IrqMode::None => {}
        }
    }

    fn ack_irq(&self) {
        if self.config.host_irq_mode != IrqMode::Level {
            return;
        }
        if let Some(irq) = &self.irq_regs {
            let offset = self.config.host_irq_offset as usize;
            let value = irq.read_u32(offset);
            irq.write_u32(offset, value & !self.host_bit());
        }
    }

    fn irq_pending(&self) -> bool {
        self.irq_regs.as_ref().map_or(true, |irq| {
            irq.read_u32(self.config.host_irq_offset as usize) & self.host_bit() != 0
        })
    }

    fn mmio_base(&self) -> Option<u64> {
        self.irq_regs.as_ref().map(IoRegion::base)
    }

    fn set_device_mmio_base(&self, dsp_addr: u32) {
        self.device_mmio_base.store(dsp_addr, Ordering::Relaxed);
    }

    fn sync_data(&self) -> Vec<u8> {
        HwSyncData {
            device_mmio_base: self.device_mmio_base.load(Ordering::Relaxed),
            host_irq_mode: self.config.host_irq_mode.sync_value(),
            host_irq_offset: self.config.host_irq_offset,
            host_irq_bit: self.config.host_irq_bit,
            device_irq_mode: self.config.device_irq_mode.sync_value(),
            device_irq_offset: self.config.device_irq_offset,
            device_irq_bit: self.config.device_irq_bit,
            device_irq: self.config.device_irq,
        }
        .encode()
    }
}
