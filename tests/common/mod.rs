// Author: Lukas Bower
// Purpose: Shared setup for the simulator-backed integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use xrp::sim::{SimBoard, SimDsp, SimPlatform, PAGES};
use xrp::{Device, DeviceConfig, Registry, XrpError};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Simulator layout with timeouts short enough for tests.
pub fn config() -> DeviceConfig {
    DeviceConfig {
        command_timeout_ms: Some(400),
        ..SimPlatform::default_config()
    }
}

pub fn platform(config: DeviceConfig, protocol: u32) -> SimPlatform {
    let platform = SimPlatform::with_config(config, PAGES).unwrap();
    platform.install_firmware(protocol);
    platform
}

pub fn boot(config: DeviceConfig) -> SimBoard {
    init_logging();
    SimBoard::boot(platform(config, 2)).unwrap()
}

/// Probe against an already started core, for tests that arm faults first.
pub fn probe(platform: &SimPlatform, dsp: &SimDsp) -> Result<Arc<Device>, XrpError> {
    Device::probe(
        platform.config().clone(),
        platform.platform(dsp.hardware()),
        Arc::new(Registry::new()),
    )
}

pub fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}
