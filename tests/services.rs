// Author: Lukas Bower

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{boot, config, wait_for};
use serial_test::serial;
use xrp::report::ReportHandler;
use xrp::{DeviceConfig, Heartbeat, XrpError};

#[test]
#[serial]
fn loopback_round_trips_inline_and_shared_payloads() {
    let board = boot(config());
    assert_eq!(board.device.loopback_test(b"short").unwrap(), b"short");
    let long: Vec<u8> = (0..200u8).collect();
    assert_eq!(board.device.loopback_test(&long).unwrap(), long);
    assert_eq!(board.device.loopback_test(&[]).unwrap(), Vec::<u8>::new());
}

#[test]
#[serial]
fn reports_reach_the_registered_handler() {
    let board = boot(config());
    board.device.setup_reports(64).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler: ReportHandler = {
        let seen = Arc::clone(&seen);
        Arc::new(move |id, payload: &[u8]| {
            seen.lock().unwrap().push((id, payload.to_vec()));
        })
    };
    let id = board.device.register_report(8, handler).unwrap();
    assert_eq!(board.dsp.report_ids(), vec![id]);

    board.dsp.post_report(id, b"temp=42!");
    assert!(wait_for(|| !seen.lock().unwrap().is_empty()));
    assert_eq!(seen.lock().unwrap()[0], (id, b"temp=42!".to_vec()));

    board.dsp.post_report(id, b"temp=43!");
    assert!(wait_for(|| seen.lock().unwrap().len() == 2));

    board.device.unregister_report(id).unwrap();
    assert!(board.dsp.report_ids().is_empty());
    assert!(board.device.release_reports());
    assert!(!board.device.release_reports());
}

#[test]
#[serial]
fn report_buffer_survives_a_firmware_reboot() {
    let board = boot(config());
    board.device.setup_reports(32).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let handler: ReportHandler = {
        let hits = Arc::clone(&hits);
        Arc::new(move |_, _: &[u8]| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    };
    board.dsp.drop_requests(1);
    board.device.heartbeat().unwrap();
    assert_eq!(board.device.reboot_count(), 1);

    let id = board.device.register_report(4, handler).unwrap();
    board.dsp.post_report(id, b"ping");
    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
}

#[test]
#[serial]
fn oversized_report_registration_is_rejected() {
    let board = boot(config());
    assert!(matches!(
        board.device.register_report(4, Arc::new(|_, _: &[u8]| {})),
        Err(XrpError::InvalidArgument(_))
    ));
    board.device.setup_reports(16).unwrap();
    assert!(matches!(
        board.device.register_report(17, Arc::new(|_, _: &[u8]| {})),
        Err(XrpError::InvalidArgument(_))
    ));
    assert!(board.dsp.report_ids().is_empty());
}

#[test]
#[serial]
fn log_level_changes_reach_the_firmware() {
    let board = boot(config());
    board.device.set_fw_log_level(5).unwrap();
    assert_eq!(board.dsp.log_level(), 5);
    assert!(matches!(
        board.device.set_fw_log_level(6),
        Err(XrpError::InvalidArgument(_))
    ));
    assert_eq!(board.dsp.log_level(), 5);
}

#[test]
#[serial]
fn heartbeat_monitor_probes_periodically() {
    let board = boot(config());
    let failures = Arc::new(AtomicUsize::new(0));
    let mut monitor = Heartbeat::start(Arc::clone(&board.device), Duration::from_millis(10), {
        let failures = Arc::clone(&failures);
        move |_| {
            failures.fetch_add(1, Ordering::SeqCst);
        }
    })
    .unwrap();
    assert!(wait_for(|| board.dsp.stats().heartbeats >= 3));
    monitor.stop();
    let beats = board.dsp.stats().heartbeats;
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(board.dsp.stats().heartbeats, beats);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[test]
#[serial]
fn heartbeat_reports_a_dead_device() {
    let board = boot(DeviceConfig {
        firmware_reboot: false,
        command_timeout_ms: Some(50),
        ..config()
    });
    board.dsp.drop_requests(usize::MAX);
    let failures = Arc::new(AtomicUsize::new(0));
    let _monitor = Heartbeat::start(Arc::clone(&board.device), Duration::from_millis(5), {
        let failures = Arc::clone(&failures);
        move |err| {
            assert!(matches!(err, XrpError::Busy));
            failures.fetch_add(1, Ordering::SeqCst);
        }
    })
    .unwrap();
    assert!(wait_for(|| failures.load(Ordering::SeqCst) >= 1));
}
