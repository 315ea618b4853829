// Author: Lukas Bower

mod common;

use std::sync::Arc;

use common::{boot, config};
use serial_test::serial;
use xrp::hal::{align_down, PAGE_SIZE};
use xrp::share::AddressSpace;
use xrp::sim::SimBoard;
use xrp::wire::ps::{self, PsCommand, NSID_COMMON_CMD};
use xrp::wire::{BufferFlags, QueueFlags};
use xrp::{BufferSpec, DeviceFile, InData, OutData, QueueRequest, XrpError};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn copy_request(src: u64, dst: u64, size: u32) -> QueueRequest {
    QueueRequest {
        flags: QueueFlags::empty(),
        nsid: None,
        in_data: InData::Kernel(Vec::new()),
        out_data: OutData::Kernel { size: 0 },
        buffers: vec![
            BufferSpec {
                flags: BufferFlags::READ,
                addr: src,
                size,
            },
            BufferSpec {
                flags: BufferFlags::WRITE,
                addr: dst,
                size,
            },
        ],
    }
}

fn filled_source(board: &SimBoard, file: &DeviceFile, data: &[u8]) -> u64 {
    let src = file.alloc(board.space.as_ref(), data.len() as u64).unwrap();
    board.space.copy_to_user(src, data).unwrap();
    src
}

fn user_echo(board: &SimBoard, file: &DeviceFile, input: u64, output: u64, payload: &[u8]) -> Vec<u8> {
    let command = ps::encode(PsCommand::LoopbackTest, payload);
    board.space.copy_to_user(input, &command).unwrap();
    let request = QueueRequest {
        flags: QueueFlags::with_priority(0, true),
        nsid: Some(NSID_COMMON_CMD),
        in_data: InData::User {
            addr: input,
            size: command.len() as u32,
        },
        out_data: OutData::User {
            addr: output,
            size: payload.len() as u32,
        },
        buffers: Vec::new(),
    };
    let returned = file.submit(board.space.as_ref(), &request).unwrap();
    assert!(returned.is_empty());
    let mut echoed = vec![0; payload.len()];
    board.space.copy_from_user(output, &mut echoed).unwrap();
    echoed
}

fn page_of(board: &SimBoard, vaddr: u64) -> u64 {
    align_down(board.space.resolve(vaddr).unwrap(), PAGE_SIZE)
}

#[test]
#[serial]
fn small_user_payloads_travel_inline() {
    let board = boot(config());
    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let input = board.space.alloc_anonymous(PAGE_SIZE, true).unwrap();
    let output = board.space.alloc_anonymous(PAGE_SIZE, true).unwrap();
    assert_eq!(user_echo(&board, &file, input, output, b"tiny"), b"tiny");
    assert!(!board.space.is_dirty(page_of(&board, output)));
}

#[test]
#[serial]
fn contiguous_user_payloads_are_shared_in_place() {
    let board = boot(config());
    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let input = board.space.alloc_anonymous(PAGE_SIZE, true).unwrap();
    let output = board.space.alloc_anonymous(PAGE_SIZE, true).unwrap();
    let payload = pattern(200, 4);
    assert_eq!(user_echo(&board, &file, input, output, &payload), payload);
    assert!(board.space.is_dirty(page_of(&board, output)));
    assert_eq!(board.space.pin_count(page_of(&board, input)), 0);
    assert_eq!(board.space.pin_count(page_of(&board, output)), 0);
}

#[test]
#[serial]
fn scattered_user_payloads_are_shadowed_and_written_back() {
    let board = boot(config());
    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let input = board.space.alloc_anonymous(2 * PAGE_SIZE, false).unwrap();
    let output = board.space.alloc_anonymous(2 * PAGE_SIZE, false).unwrap();
    // Straddle the page boundary so the range is physically scattered.
    let payload = pattern(100, 8);
    let echoed = user_echo(&board, &file, input + PAGE_SIZE - 50, output + PAGE_SIZE - 50, &payload);
    assert_eq!(echoed, payload);
    for vaddr in [input, input + PAGE_SIZE, output, output + PAGE_SIZE] {
        assert_eq!(board.space.pin_count(page_of(&board, vaddr)), 0);
    }
}

#[test]
#[serial]
fn failed_mapping_releases_buffers_already_shared() {
    let board = boot(config());
    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let pinned = board.space.alloc_anonymous(PAGE_SIZE, true).unwrap();
    let mut request = copy_request(pinned, 0x10, 0x100);
    request.buffers[0].flags = BufferFlags::READ_WRITE;

    assert!(matches!(
        file.submit(board.space.as_ref(), &request),
        Err(XrpError::InvalidArgument(_))
    ));
    assert_eq!(board.space.pin_count(page_of(&board, pinned)), 0);
    assert_eq!(board.dsp.stats().requests, 0);
}

#[test]
#[serial]
fn large_copy_between_pool_buffers() {
    let board = boot(config());
    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let size = 307_200u32;
    let data = pattern(size as usize, 3);
    let src = filled_source(&board, &file, &data);
    let dst = file.alloc(board.space.as_ref(), u64::from(size)).unwrap();

    file.submit(board.space.as_ref(), &copy_request(src, dst, size))
        .unwrap();

    let mut copied = vec![0; size as usize];
    board.space.copy_from_user(dst, &mut copied).unwrap();
    assert!(copied == data, "copied buffer differs");

    let areas = board.space.area_count();
    file.free(board.space.as_ref(), src).unwrap();
    file.free(board.space.as_ref(), dst).unwrap();
    assert_eq!(board.space.area_count(), areas - 2);
}

#[test]
#[serial]
fn scattered_user_pages_go_through_a_shadow_copy() {
    let board = boot(config());
    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let size = 3 * PAGE_SIZE as u32;
    let data = pattern(size as usize, 9);
    let src = filled_source(&board, &file, &data);
    let dst = board.space.alloc_anonymous(u64::from(size), false).unwrap();

    file.submit(board.space.as_ref(), &copy_request(src, dst, size))
        .unwrap();

    let mut copied = vec![0; size as usize];
    board.space.copy_from_user(dst, &mut copied).unwrap();
    assert!(copied == data, "shadow copy was not written back");
    for page in 0..3 {
        let phys = board.space.resolve(dst + page * PAGE_SIZE).unwrap();
        assert_eq!(board.space.pin_count(align_down(phys, PAGE_SIZE)), 0);
    }
}

#[test]
#[serial]
fn contiguous_user_pages_are_pinned_and_dirtied() {
    let board = boot(config());
    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let size = 2 * PAGE_SIZE as u32;
    let data = pattern(size as usize, 1);
    let src = filled_source(&board, &file, &data);
    let dst = board.space.alloc_anonymous(u64::from(size), true).unwrap();

    file.submit(board.space.as_ref(), &copy_request(src, dst, size))
        .unwrap();

    let phys = board.space.resolve(dst).unwrap();
    assert_eq!(board.device.memory().phys.read_vec(phys, size as usize).unwrap(), data);
    assert!(board.space.is_dirty(phys));
    assert_eq!(board.space.pin_count(phys), 0);
}

#[test]
#[serial]
fn files_only_free_their_own_allocations() {
    let board = boot(config());
    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let other = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let vaddr = file.alloc(board.space.as_ref(), 0x100).unwrap();
    let anon = board.space.alloc_anonymous(0x100, true).unwrap();

    assert!(matches!(
        other.free(board.space.as_ref(), vaddr),
        Err(XrpError::InvalidArgument(_))
    ));
    assert!(matches!(
        file.free(board.space.as_ref(), vaddr + 8),
        Err(XrpError::InvalidArgument(_))
    ));
    assert!(matches!(
        file.free(board.space.as_ref(), anon),
        Err(XrpError::InvalidArgument(_))
    ));
    file.free(board.space.as_ref(), vaddr).unwrap();
    assert!(matches!(
        file.alloc(board.space.as_ref(), 0),
        Err(XrpError::InvalidArgument(_))
    ));
}

#[test]
#[serial]
fn firmware_moves_data_between_physical_buffers() {
    let board = boot(config());
    let pool = &board.device.memory().pool;
    let src = pool.allocate(0x800, 0).unwrap();
    let dst = pool.allocate(0x800, 0).unwrap();
    let data = pattern(0x800, 5);
    board.device.memory().phys.write(src.start(), &data).unwrap();

    board.device.data_move(src.start(), dst.start(), 0x800).unwrap();

    assert_eq!(
        board.device.memory().phys.read_vec(dst.start(), 0x800).unwrap(),
        data
    );
    assert_eq!(board.dsp.stats().data_moves, 1);
    assert!(matches!(
        board.device.data_move(0x10, dst.start(), 4),
        Err(XrpError::Untranslatable(_))
    ));
}

#[test]
#[serial]
fn imported_dma_buffers_are_shared_and_refcounted() {
    let board = boot(config());
    let exporter = board.platform.exporter();
    let space = board.space.as_ref();
    let fd = exporter.create(0x2000, 1).unwrap();

    let vaddr = board.device.import_dmabuf(space, fd, BufferFlags::READ_WRITE).unwrap();
    assert_eq!(board.device.import_dmabuf(space, fd, BufferFlags::READ).unwrap(), vaddr);
    assert_eq!(exporter.counts(), (1, 0));

    let file = DeviceFile::open(Arc::clone(&board.device)).unwrap();
    let data = pattern(0x2000, 7);
    let src = filled_source(&board, &file, &data);
    file.submit(space, &copy_request(src, vaddr, 0x2000)).unwrap();
    board.device.sync_dmabuf(fd, BufferFlags::READ).unwrap();
    let mut seen = vec![0; 0x2000];
    space.copy_from_user(vaddr, &mut seen).unwrap();
    assert!(seen == data, "dma-buf contents differ");

    board.device.release_dmabuf(space, fd).unwrap();
    assert_eq!(exporter.counts(), (1, 0));
    board.device.release_dmabuf(space, fd).unwrap();
    assert_eq!(exporter.counts(), (1, 1));
    assert!(matches!(
        board.device.release_dmabuf(space, fd),
        Err(XrpError::Fault { .. })
    ));
    assert!(matches!(
        board.device.sync_dmabuf(fd, BufferFlags::READ),
        Err(XrpError::Fault { .. })
    ));
}

#[test]
#[serial]
fn scattered_dma_buffers_are_refused() {
    let board = boot(config());
    let exporter = board.platform.exporter();
    let fd = exporter.create(PAGE_SIZE, 2).unwrap();
    assert!(matches!(
        board
            .device
            .import_dmabuf(board.space.as_ref(), fd, BufferFlags::READ),
        Err(XrpError::InvalidArgument(_))
    ));
    assert_eq!(exporter.counts(), (1, 1));
    assert!(matches!(
        board
            .device
            .import_dmabuf(board.space.as_ref(), 99, BufferFlags::empty()),
        Err(XrpError::InvalidArgument(_))
    ));
}
