// Author: Lukas Bower

use std::sync::{Arc, Mutex};
use std::thread;

use xrp::hal::{PageProvider, PAGE_SIZE};
use xrp::pool::{FreeListPool, MemoryPool};
use xrp::sim::SimPageProvider;

const BASE: u64 = 0x100_0000;
const SIZE: u64 = 0x40_0000;

fn lcg(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    *state >> 33
}

#[test]
fn concurrent_allocations_never_overlap_and_coalesce_on_release() {
    let primary = Arc::new(FreeListPool::new(BASE, SIZE));
    let pool = Arc::new(MemoryPool::new(Some(Arc::clone(&primary)), None));
    let live = Arc::new(Mutex::new(Vec::new()));

    thread::scope(|scope| {
        for worker in 0..4u64 {
            let pool = Arc::clone(&pool);
            let live = Arc::clone(&live);
            scope.spawn(move || {
                let mut seed = worker + 1;
                let mut mine = Vec::new();
                for _ in 0..200 {
                    let size = (lcg(&mut seed) % 5 + 1) * PAGE_SIZE - lcg(&mut seed) % 64;
                    let align = PAGE_SIZE << (lcg(&mut seed) % 3);
                    if let Ok(block) = pool.allocate(size, align) {
                        assert_eq!(block.start() % align, 0);
                        assert!(block.size() >= size);
                        mine.push(block);
                    }
                    if mine.len() > 8 {
                        let victim = (lcg(&mut seed) as usize) % mine.len();
                        mine.swap_remove(victim);
                    }
                }
                live.lock().unwrap().extend(mine);
            });
        }
    });

    let mut ranges: Vec<(u64, u64)> = live
        .lock()
        .unwrap()
        .iter()
        .map(|b| (b.start(), b.end()))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{pair:x?} overlap");
    }
    assert!(ranges.iter().all(|&(s, e)| s >= BASE && e <= BASE + SIZE));

    live.lock().unwrap().clear();
    assert_eq!(primary.free_blocks(), vec![(BASE, SIZE)]);
}

#[test]
fn exhausted_pool_falls_back_to_pages() {
    let primary = Arc::new(FreeListPool::new(BASE, 4 * PAGE_SIZE));
    let pages = Arc::new(SimPageProvider::new(0x200_0000, 0x10_0000, 6));
    let pool = MemoryPool::new(
        Some(Arc::clone(&primary)),
        Some(Arc::clone(&pages) as Arc<dyn PageProvider>),
    );

    let carved = pool.allocate(4 * PAGE_SIZE, 0).unwrap();
    assert_eq!(carved.start(), BASE);
    let spilled = pool.allocate(3 * PAGE_SIZE, 0).unwrap();
    assert!(spilled.start() >= 0x200_0000);
    assert_eq!(pages.outstanding_pages(), 4);

    drop(spilled);
    assert_eq!(pages.outstanding_pages(), 0);
    drop(carved);
    assert_eq!(primary.free_bytes(), 4 * PAGE_SIZE);
    assert!(pool.allocate(PAGE_SIZE << 7, 0).is_err());
}
