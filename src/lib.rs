// Author: Lukas Bower
// Purpose: Host-side driver core for offloading work to an XRP-speaking DSP.

//! Host side of the XRP DSP offload protocol.
//!
//! The crate owns everything between a caller holding a request and a DSP
//! core executing it: device memory allocation, host-to-DSP address
//! translation, buffer sharing, the boot handshake, queue dispatch with
//! firmware recovery, the panic and log ring, and the report channel.
//! Hardware access goes through the seams in [`hal`]; [`sim`] implements
//! them all for running the stack on a plain host.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address_map;
pub mod comm;
pub mod config;
pub mod device;
pub mod dmabuf;
pub mod error;
pub mod file;
pub mod firmware;
pub mod hal;
pub mod heartbeat;
pub mod panic_log;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod report;
pub mod request;
pub mod share;
pub mod sim;

pub use address_map::AddressMap;
pub use config::DeviceConfig;
pub use device::{Device, Platform};
pub use error::XrpError;
pub use file::DeviceFile;
pub use heartbeat::Heartbeat;
pub use registry::Registry;
pub use request::{BufferSpec, InData, OutData, QueueRequest};
pub use xrp_wire as wire;
