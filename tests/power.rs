// Author: Lukas Bower

mod common;

use std::sync::Arc;

use common::{config, init_logging, platform, probe};
use serial_test::serial;
use tempfile::tempdir;
use xrp::comm::ProtocolVersion;
use xrp::config::{LoadMode, Loopback};
use xrp::hal::DspHardware;
use xrp::sim::{elf, SimBoard, SimDsp, SimPlatform, FIRMWARE_ENTRY, FIRMWARE_NAME, PAGES};
use xrp::{Device, DeviceConfig, DeviceFile, Registry, XrpError};

fn bare_platform(config: DeviceConfig) -> SimPlatform {
    init_logging();
    SimPlatform::with_config(config, PAGES).unwrap()
}

#[test]
#[serial]
fn runtime_pm_powers_the_core_while_files_are_open() {
    init_logging();
    let board = SimBoard::boot(platform(
        DeviceConfig {
            runtime_pm: true,
            ..config()
        },
        2,
    ))
    .unwrap();
    assert!(!board.device.is_powered());
    assert_eq!(board.dsp.stats().boots, 0);

    let first = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let second = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    assert!(board.device.is_powered());
    assert!(board.dsp.is_powered());
    assert_eq!(board.dsp.stats().boots, 1);
    assert_eq!(board.device.loopback_test(b"pm").unwrap(), b"pm");

    first.close();
    assert!(board.dsp.is_powered());
    drop(second);
    assert!(!board.dsp.is_powered());
    assert!(!board.device.is_powered());

    let _again = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    assert_eq!(board.dsp.stats().boots, 2);
    assert_eq!(board.device.loopback_test(b"back").unwrap(), b"back");
}

#[test]
#[serial]
fn manual_load_mode_only_releases_the_core() {
    let platform = bare_platform(DeviceConfig {
        load_mode: LoadMode::Manual,
        ..config()
    });
    platform.preload_firmware(2).unwrap();
    let board = SimBoard::boot(platform).unwrap();
    assert_eq!(board.device.protocol(), Some(ProtocolVersion::V2));
    assert_eq!(board.dsp.stats().boots, 1);
    assert_eq!(board.device.loopback_test(b"manual").unwrap(), b"manual");
}

#[test]
#[serial]
fn manual_load_mode_without_an_image_times_out() {
    let platform = bare_platform(DeviceConfig {
        load_mode: LoadMode::Manual,
        ..config()
    });
    let dsp = SimDsp::start(&platform).unwrap();
    assert!(matches!(probe(&platform, &dsp), Err(XrpError::Busy)));
}

#[test]
#[serial]
fn firmware_loopback_boots_a_preloaded_image() {
    let platform = bare_platform(DeviceConfig {
        loopback: Loopback::NoFirmware,
        ..config()
    });
    platform.preload_firmware(1).unwrap();
    let board = SimBoard::boot(platform).unwrap();
    assert_eq!(board.device.protocol(), Some(ProtocolVersion::V1));
    assert_eq!(board.device.loopback_test(b"nofw").unwrap(), b"nofw");
}

#[test]
#[serial]
fn mmio_loopback_talks_to_an_externally_started_core() {
    let platform = bare_platform(DeviceConfig {
        loopback: Loopback::NoMmio,
        ..config()
    });
    platform.install_firmware(2);
    platform.preload_firmware(2).unwrap();
    let dsp = SimDsp::start(&platform).unwrap();
    let hw = dsp.hardware();
    hw.enable().unwrap();
    hw.release();

    let device = probe(&platform, &dsp).unwrap();
    assert_eq!(device.protocol(), Some(ProtocolVersion::V2));
    assert_eq!(device.loopback_test(b"nommio").unwrap(), b"nommio");
    assert_eq!(dsp.stats().boots, 1);
}

#[test]
#[serial]
fn full_loopback_touches_nothing() {
    let platform = bare_platform(DeviceConfig {
        loopback: Loopback::NoFirmwareNoMmio,
        ..config()
    });
    let dsp = SimDsp::start(&platform).unwrap();
    let device = probe(&platform, &dsp).unwrap();
    assert_eq!(device.loopback_test(b"xyz").unwrap(), vec![0; 3]);
    assert!(!dsp.is_powered());
    assert_eq!(dsp.stats().boots, 0);
}

#[test]
#[serial]
fn firmware_is_read_from_the_configured_directory() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join(FIRMWARE_NAME),
        elf::firmware_image(FIRMWARE_ENTRY, 2),
    )
    .unwrap();
    let platform = bare_platform(DeviceConfig {
        firmware_dir: Some(dir.path().to_path_buf()),
        ..config()
    });
    let dsp = SimDsp::start(&platform).unwrap();
    let mut seams = platform.platform(dsp.hardware());
    seams.firmware = None;
    let device = Device::probe(platform.config().clone(), seams, Arc::new(Registry::new())).unwrap();
    assert_eq!(device.protocol(), Some(ProtocolVersion::V2));
    assert_eq!(dsp.stats().boots, 1);
}

#[test]
#[serial]
fn corrupt_image_fails_probe() {
    let platform = bare_platform(config());
    platform.firmware().insert(FIRMWARE_NAME, b"\x7fELF garbage".to_vec());
    let dsp = SimDsp::start(&platform).unwrap();
    assert!(matches!(probe(&platform, &dsp), Err(XrpError::Firmware(_))));
    assert!(!dsp.is_powered());
}

#[test]
#[serial]
fn devices_share_the_registry_node_space() {
    init_logging();
    let registry = Arc::new(Registry::new());
    let boards: Vec<_> = (0..2)
        .map(|_| {
            let platform = platform(config(), 2);
            let dsp = SimDsp::start(&platform).unwrap();
            let device = Device::probe(
                platform.config().clone(),
                platform.platform(dsp.hardware()),
                Arc::clone(&registry),
            )
            .unwrap();
            (platform, dsp, device)
        })
        .collect();
    let names: Vec<_> = boards.iter().map(|(_, _, d)| d.node_name().to_string()).collect();
    assert_eq!(names, ["xvp0", "xvp1"]);

    let mut boards = boards;
    boards.remove(0);
    assert_eq!(registry.nodes(), vec![1]);
    let platform = platform(config(), 2);
    let dsp = SimDsp::start(&platform).unwrap();
    let device = Device::probe(
        platform.config().clone(),
        platform.platform(dsp.hardware()),
        Arc::clone(&registry),
    )
    .unwrap();
    assert_eq!(device.node_name().as_str(), "xvp0");
}
