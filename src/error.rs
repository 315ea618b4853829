// Author: Lukas Bower
// Purpose: Error taxonomy shared by every layer of the host driver core.

//! Errors returned by the device surface.

use thiserror::Error;
use xrp_wire::WireError;

use crate::address_map::MapError;
use crate::config::ConfigError;
use crate::firmware::FirmwareError;
use crate::hal::HalError;
use crate::pool::PoolError;

/// Errors surfaced by the public driver API.
#[derive(Debug, Error)]
pub enum XrpError {
    /// A caller supplied malformed flags, sizes or addresses.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No pool or page-provider memory could satisfy the request.
    #[error("out of memory allocating {size:#x} bytes")]
    OutOfMemory {
        /// Size that was requested, after rounding.
        size: u64,
    },
    /// The DSP did not answer before the deadline or reported a crash.
    #[error("DSP did not respond in time")]
    Busy,
    /// The device has been switched off after an unrecoverable failure.
    #[error("DSP device is off")]
    DeviceOff,
    /// A physical address has no DSP-visible translation.
    #[error("physical address {0:#x} has no DSP translation")]
    Untranslatable(u64),
    /// A user range could not be made visible to the DSP.
    #[error("could not share {size:#x} bytes at {vaddr:#x}")]
    ShareFailed {
        /// User virtual address of the range.
        vaddr: u64,
        /// Range length.
        size: u64,
    },
    /// The firmware answered the handshake in a way the host does not accept.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    /// Copying to or from user memory failed.
    #[error("bad user address {addr:#x}")]
    Fault {
        /// First address that could not be accessed.
        addr: u64,
    },
    /// The DSP could not route the request to a handler.
    #[error("DSP reported a delivery failure")]
    Delivery,
    /// Hardware or simulated memory access failed.
    #[error(transparent)]
    Hal(#[from] HalError),
    /// Shared-memory record could not be encoded or decoded.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Firmware image could not be loaded.
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
}

impl XrpError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl From<PoolError> for XrpError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::OutOfMemory { size } => Self::OutOfMemory { size },
            PoolError::InvalidSize | PoolError::InvalidAlignment(_) => {
                Self::InvalidArgument(err.to_string())
            }
        }
    }
}

impl From<MapError> for XrpError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::NoTranslation(addr) => Self::Untranslatable(addr),
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}
