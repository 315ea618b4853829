// Author: Lukas Bower

mod common;

use common::{boot, config, init_logging, platform, probe};
use serial_test::serial;
use xrp::comm::ProtocolVersion;
use xrp::sim::{HandshakeFault, SimDsp};
use xrp::wire::SyncCode;
use xrp::{DeviceConfig, XrpError};

fn multi_queue() -> DeviceConfig {
    DeviceConfig {
        queue_priority: vec![1, 3, 2],
        fw_log_level: 4,
        ..config()
    }
}

#[test]
#[serial]
fn v2_firmware_negotiates_every_queue() {
    let board = boot(multi_queue());
    assert_eq!(board.device.protocol(), Some(ProtocolVersion::V2));
    assert_eq!(board.device.queue_count(), 3);
    assert_eq!(board.dsp.negotiated_queues(), 3);
    assert_eq!(board.dsp.log_level(), 4);
    let panic = board.platform.config().panic.unwrap();
    assert_eq!(u64::from(board.dsp.panic_addr()), panic.base);
    assert_eq!(board.dsp.stats().handshakes, 1);
    assert_eq!(
        board.device.memory().phys.read_u32(board.platform.config().comm.base).unwrap(),
        SyncCode::Idle.raw()
    );
    assert!(board.device.is_powered());
}

#[test]
#[serial]
fn v1_firmware_falls_back_to_one_queue() {
    init_logging();
    let board = xrp::sim::SimBoard::boot(platform(multi_queue(), 1)).unwrap();
    assert_eq!(board.device.protocol(), Some(ProtocolVersion::V1));
    assert_eq!(board.device.queue_count(), 1);
    assert_eq!(board.device.loopback_test(b"v1").unwrap(), b"v1");
}

fn probe_with(fault: HandshakeFault, cfg: DeviceConfig) -> (SimDsp, Result<(), XrpError>) {
    init_logging();
    let platform = platform(cfg, 2);
    let dsp = SimDsp::start(&platform).unwrap();
    dsp.set_handshake_fault(fault);
    let result = probe(&platform, &dsp).map(|_| ());
    (dsp, result)
}

#[test]
#[serial]
fn silent_firmware_times_out() {
    let (dsp, result) = probe_with(HandshakeFault::Silent, config());
    assert!(matches!(result, Err(XrpError::Busy)));
    assert!(!dsp.is_powered());
}

#[test]
#[serial]
fn unknown_answer_is_a_protocol_mismatch() {
    let (_dsp, result) = probe_with(HandshakeFault::UnknownCode, config());
    assert!(matches!(result, Err(XrpError::ProtocolMismatch(_))));
}

#[test]
#[serial]
fn modified_hardware_blob_is_rejected() {
    let (_dsp, result) = probe_with(HandshakeFault::ModifyBlobLength, config());
    assert!(matches!(result, Err(XrpError::ProtocolMismatch(_))));
}

#[test]
#[serial]
fn unaccepted_priorities_leave_a_single_queue() {
    init_logging();
    let platform = platform(multi_queue(), 2);
    let dsp = SimDsp::start(&platform).unwrap();
    dsp.set_handshake_fault(HandshakeFault::RejectQueues);
    let device = probe(&platform, &dsp).unwrap();
    assert_eq!(device.protocol(), Some(ProtocolVersion::V2));
    assert_eq!(device.queue_count(), 1);
    assert_eq!(dsp.negotiated_queues(), 1);
    assert_eq!(device.loopback_test(b"single").unwrap(), b"single");
}

#[test]
#[serial]
fn missing_image_fails_probe() {
    init_logging();
    let platform = xrp::sim::SimPlatform::with_config(config(), xrp::sim::PAGES).unwrap();
    let dsp = SimDsp::start(&platform).unwrap();
    assert!(matches!(
        probe(&platform, &dsp),
        Err(XrpError::Firmware(_))
    ));
    assert_eq!(dsp.stats().boots, 0);
}
