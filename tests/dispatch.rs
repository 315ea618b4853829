// Author: Lukas Bower

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{boot, config};
use serial_test::serial;
use xrp::config::Loopback;
use xrp::wire::ps::{self, PsCommand, NSID_COMMON_CMD};
use xrp::wire::QueueFlags;
use xrp::{DeviceConfig, DeviceFile, InData, OutData, QueueRequest, XrpError};

fn echo_request(priority: u8, payload: &[u8]) -> QueueRequest {
    QueueRequest {
        flags: QueueFlags::with_priority(priority, true),
        nsid: Some(NSID_COMMON_CMD),
        in_data: InData::Kernel(ps::encode(PsCommand::LoopbackTest, payload)),
        out_data: OutData::Kernel {
            size: payload.len() as u32,
        },
        buffers: Vec::new(),
    }
}

#[test]
#[serial]
fn concurrent_requests_never_share_a_record() {
    let board = boot(DeviceConfig {
        queue_priority: vec![0, 1, 2],
        ..config()
    });
    board.dsp.set_latency(Duration::from_micros(200));
    let file = Arc::new(DeviceFile::open(Arc::clone(&board.device)).unwrap());

    thread::scope(|scope| {
        for worker in 0..6u8 {
            let file = Arc::clone(&file);
            let space = Arc::clone(&board.space);
            scope.spawn(move || {
                for round in 0..40u32 {
                    // Long enough to go out of line on some rounds.
                    let payload = format!("{worker}-{round}-{}", "x".repeat(round as usize % 24));
                    let out = file
                        .submit(space.as_ref(), &echo_request(worker % 3, payload.as_bytes()))
                        .unwrap();
                    assert_eq!(out, payload.as_bytes());
                }
            });
        }
    });

    let stats = board.dsp.stats();
    assert_eq!(stats.requests, 240);
    assert_eq!(stats.overlaps, 0);
    assert_eq!(board.device.reboot_count(), 0);
}

#[test]
#[serial]
fn timeout_reboots_once_and_retries() {
    let board = boot(config());
    board.dsp.drop_requests(1);
    assert_eq!(board.device.loopback_test(b"again").unwrap(), b"again");
    assert_eq!(board.device.reboot_count(), 1);
    let stats = board.dsp.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.boots, 2);
    assert_eq!(stats.handshakes, 2);
    assert!(!board.device.is_off());
}

#[test]
#[serial]
fn second_timeout_switches_the_device_off() {
    let board = boot(config());
    board.dsp.drop_requests(2);
    assert!(matches!(board.device.loopback_test(b"lost"), Err(XrpError::Busy)));
    assert!(board.device.is_off());
    assert_eq!(board.device.reboot_count(), 1);
    assert!(matches!(board.device.heartbeat(), Err(XrpError::DeviceOff)));
}

#[test]
#[serial]
fn timeout_without_reboot_is_reported_as_busy() {
    let board = boot(DeviceConfig {
        firmware_reboot: false,
        ..config()
    });
    board.dsp.drop_requests(1);
    assert!(matches!(board.device.heartbeat(), Err(XrpError::Busy)));
    assert!(!board.device.is_off());
    assert_eq!(board.device.reboot_count(), 0);
    assert_eq!(board.dsp.stats().boots, 1);
}

#[test]
#[serial]
fn firmware_panic_is_logged_and_recovered() {
    let board = boot(config());
    board.dsp.panic_on_next_request();
    assert_eq!(board.device.loopback_test(b"survive").unwrap(), b"survive");
    assert_eq!(board.device.reboot_count(), 1);
    let history = board.device.panic_log().history();
    assert!(history.iter().any(|line| line.contains("panic")), "{history:?}");
    assert!(!board.device.panic_log().check());
}

#[test]
#[serial]
fn unknown_namespace_fails_delivery() {
    let board = boot(config());
    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let request = QueueRequest {
        nsid: Some([7; 16]),
        ..echo_request(0, b"nobody")
    };
    assert!(matches!(
        file.submit(board.space.as_ref(), &request),
        Err(XrpError::Delivery)
    ));
    assert!(!board.device.is_off());
    assert_eq!(board.device.loopback_test(b"ok").unwrap(), b"ok");
}

#[test]
#[serial]
fn unknown_flags_are_rejected_before_dispatch() {
    let board = boot(config());
    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let request = QueueRequest {
        flags: QueueFlags::from_bits_retain(0x1),
        ..echo_request(0, b"bad")
    };
    assert!(matches!(
        file.submit(board.space.as_ref(), &request),
        Err(XrpError::InvalidArgument(_))
    ));
    assert_eq!(board.dsp.stats().requests, 0);
}

#[test]
#[serial]
fn completions_arrive_on_the_host_interrupt() {
    let board = boot(DeviceConfig {
        host_irq: true,
        ..config()
    });
    for round in 0..20u32 {
        let payload = round.to_le_bytes();
        assert_eq!(board.device.loopback_test(&payload).unwrap(), payload);
    }
    assert_eq!(board.device.reboot_count(), 0);
}

#[test]
#[serial]
fn io_loopback_never_reaches_the_firmware() {
    let board = boot(DeviceConfig {
        loopback: Loopback::NoIo,
        ..config()
    });
    assert_eq!(board.device.protocol(), None);
    assert_eq!(board.device.loopback_test(b"abc").unwrap(), vec![0; 3]);
    let stats = board.dsp.stats();
    assert_eq!(stats.boots, 1);
    assert_eq!(stats.requests, 0);
}
