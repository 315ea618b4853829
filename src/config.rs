// Author: Lukas Bower
// Purpose: TOML-backed device configuration replacing module parameters and device-tree properties.

//! Device configuration loaded from TOML.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use xrp_wire::sync::V2_MAX_QUEUES;
use xrp_wire::IrqMode;

/// Highest firmware log level the DSP understands.
pub const MAX_FW_LOG_LEVEL: u32 = 5;

/// Rejected configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML text could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// `fw_log_level` is outside `0..=5`.
    #[error("firmware log level {0} out of range 0..={MAX_FW_LOG_LEVEL}")]
    LogLevel(u32),
    /// A region has zero size.
    #[error("region {0} has zero size")]
    EmptyRegion(&'static str),
    /// Two address map entries cover the same host range.
    #[error("address map entries at {first:#x} and {second:#x} overlap")]
    OverlappingMap {
        /// Host base of the earlier entry.
        first: u64,
        /// Host base of the later entry.
        second: u64,
    },
    /// The v2 handshake cannot announce this many queues.
    #[error("{queues} queues configured, the handshake carries at most {max}")]
    TooManyQueues {
        /// Configured queue count.
        queues: usize,
        /// Largest supported count.
        max: usize,
    },
    /// The communication area cannot hold one record per queue.
    #[error("communication area of {size:#x} bytes cannot hold {queues} queues")]
    CommTooSmall {
        /// Size of the area.
        size: u64,
        /// Configured queue count.
        queues: usize,
    },
}

/// Host physical region.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    /// Host physical base.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
}

/// One host-to-DSP address window.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MapEntryConfig {
    /// Host physical base.
    pub src: u64,
    /// DSP-visible base.
    pub dst: u32,
    /// Window length.
    pub size: u64,
}

/// How much of the real device the driver talks to.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Loopback {
    /// Full operation.
    #[default]
    Normal,
    /// Load and control the DSP but never talk to the firmware.
    NoIo,
    /// Load the firmware only; no register access, no firmware I/O.
    NoMmio,
    /// Talk to the firmware and registers but do not load an image.
    NoFirmware,
    /// Neither load, touch registers, nor talk to the firmware.
    NoFirmwareNoMmio,
}

impl Loopback {
    /// Handshake and command I/O are performed.
    #[must_use]
    pub fn uses_io(self) -> bool {
        matches!(self, Self::Normal | Self::NoFirmware)
    }

    /// DSP control registers are accessed.
    #[must_use]
    pub fn uses_mmio(self) -> bool {
        matches!(self, Self::Normal | Self::NoIo | Self::NoFirmware)
    }

    /// Firmware images are loaded.
    #[must_use]
    pub fn loads_firmware(self) -> bool {
        matches!(self, Self::Normal | Self::NoIo | Self::NoMmio)
    }
}

/// Who drives halt, load and reset during boot.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoadMode {
    /// The driver halts, loads, programs the reset vector and resets.
    #[default]
    Auto,
    /// An external debugger has loaded the core; the driver only releases it.
    Manual,
}

/// Register layout of the simple hardware integration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HwConfig {
    /// Control register block.
    pub regs: Option<RegionConfig>,
    /// Reset register offset.
    pub reset_offset: u32,
    /// Run-stall register offset.
    pub runstall_offset: u32,
    /// Alternate reset vector register offset.
    pub reset_vector_offset: u32,
    /// Interrupt register block.
    pub irq_regs: Option<RegionConfig>,
    /// Doorbell signalling towards the DSP.
    pub device_irq_mode: IrqMode,
    /// Doorbell register offset inside the interrupt block.
    pub device_irq_offset: u32,
    /// Doorbell bit.
    pub device_irq_bit: u32,
    /// DSP-side interrupt number.
    pub device_irq: u32,
    /// Signalling towards the host.
    pub host_irq_mode: IrqMode,
    /// Host interrupt register offset inside the interrupt block.
    pub host_irq_offset: u32,
    /// Host interrupt bit.
    pub host_irq_bit: u32,
}

impl Default for HwConfig {
    fn default() -> Self {
        Self {
            regs: None,
            reset_offset: 0x28,
            runstall_offset: 0x4020,
            reset_vector_offset: 0x4018,
            irq_regs: None,
            device_irq_mode: IrqMode::None,
            device_irq_offset: 0,
            device_irq_bit: 0,
            device_irq: 0,
            host_irq_mode: IrqMode::None,
            host_irq_offset: 0,
            host_irq_bit: 0,
        }
    }
}

/// Per-device configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Command and handshake timeout in seconds.
    pub command_timeout_secs: u64,
    /// Millisecond override of `command_timeout_secs`.
    pub command_timeout_ms: Option<u64>,
    /// Reboot the firmware when a command times out.
    pub firmware_reboot: bool,
    /// Loopback mode.
    pub loopback: Loopback,
    /// Boot control mode.
    pub load_mode: LoadMode,
    /// Firmware log verbosity, `0..=5`.
    pub fw_log_level: u32,
    /// Wait for completions on the host interrupt instead of polling.
    pub host_irq: bool,
    /// Heartbeat period in seconds; zero disables the monitor.
    pub heartbeat_period_secs: u64,
    /// Power the core down while no file is open.
    pub runtime_pm: bool,
    /// One entry per hardware queue; larger values run first.
    pub queue_priority: Vec<u32>,
    /// Firmware image loaded at boot.
    pub firmware_name: Option<String>,
    /// Directory firmware images are read from.
    pub firmware_dir: Option<PathBuf>,
    /// Host-to-DSP address windows.
    pub address_map: Vec<MapEntryConfig>,
    /// Private allocation pool carve-out.
    pub pool: Option<RegionConfig>,
    /// Shared communication area.
    pub comm: RegionConfig,
    /// Panic and log record.
    pub panic: Option<RegionConfig>,
    /// Carve-outs the firmware image is loaded into.
    pub reserved: Vec<RegionConfig>,
    /// Simple hardware register layout.
    pub hw: HwConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 60,
            command_timeout_ms: None,
            firmware_reboot: true,
            loopback: Loopback::Normal,
            load_mode: LoadMode::Auto,
            fw_log_level: 1,
            host_irq: false,
            heartbeat_period_secs: 0,
            runtime_pm: false,
            queue_priority: Vec::new(),
            firmware_name: None,
            firmware_dir: None,
            address_map: Vec::new(),
            pool: None,
            comm: RegionConfig {
                base: 0,
                size: 0x1000,
            },
            panic: None,
            reserved: Vec::new(),
            hw: HwConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut cfg =
            Self::from_toml_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(dir) = &mut cfg.firmware_dir {
            if dir.is_relative() {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                *dir = base.join(&*dir);
            }
        }
        Ok(cfg)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check ranges and region sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fw_log_level > MAX_FW_LOG_LEVEL {
            return Err(ConfigError::LogLevel(self.fw_log_level));
        }
        if self.comm.size == 0 {
            return Err(ConfigError::EmptyRegion("comm"));
        }
        let named = [
            ("pool", self.pool),
            ("panic", self.panic),
            ("hw.regs", self.hw.regs),
            ("hw.irq_regs", self.hw.irq_regs),
        ];
        for (name, region) in named {
            if region.is_some_and(|r| r.size == 0) {
                return Err(ConfigError::EmptyRegion(name));
            }
        }
        if self.reserved.iter().any(|r| r.size == 0) {
            return Err(ConfigError::EmptyRegion("reserved"));
        }
        if self.address_map.iter().any(|e| e.size == 0) {
            return Err(ConfigError::EmptyRegion("address_map"));
        }
        let mut entries: Vec<_> = self.address_map.iter().collect();
        entries.sort_by_key(|e| e.src);
        for pair in entries.windows(2) {
            if pair[0].src + pair[0].size > pair[1].src {
                return Err(ConfigError::OverlappingMap {
                    first: pair[0].src,
                    second: pair[1].src,
                });
            }
        }
        let queues = self.queue_count();
        if queues > V2_MAX_QUEUES {
            return Err(ConfigError::TooManyQueues {
                queues,
                max: V2_MAX_QUEUES,
            });
        }
        if (queues as u64) * xrp_wire::CMD_STRIDE as u64 > self.comm.size {
            return Err(ConfigError::CommTooSmall {
                size: self.comm.size,
                queues,
            });
        }
        Ok(())
    }

    /// Number of hardware queues requested.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queue_priority.len().max(1)
    }

    /// Effective command timeout.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        match self.command_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.command_timeout_secs),
        }
    }

    /// Effective heartbeat period, if enabled.
    #[must_use]
    pub fn heartbeat_period(&self) -> Option<Duration> {
        (self.heartbeat_period_secs > 0).then(|| Duration::from_secs(self.heartbeat_period_secs))
    }
}
