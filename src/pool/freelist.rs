// Author: Lukas Bower
// Purpose: Address-ordered first-fit free list over one physical carve-out.

use std::sync::Mutex;

use log::{debug, trace};

use super::{Pool, PoolError};
use crate::hal::align_up;

#[derive(Debug, Clone, Copy)]
struct Node {
    start: u64,
    size: u64,
    next: Option<usize>,
}

impl Node {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Index-linked free list. Nodes live in `nodes`; `spare` recycles slots.
#[derive(Debug, Default)]
struct FreeList {
    nodes: Vec<Node>,
    spare: Vec<usize>,
    head: Option<usize>,
}

impl FreeList {
    fn insert_node(&mut self, start: u64, size: u64, next: Option<usize>) -> usize {
        let node = Node { start, size, next };
        match self.spare.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release_node(&mut self, idx: usize) {
        self.spare.push(idx);
    }

    fn link(&mut self, prev: Option<usize>, idx: Option<usize>) {
        match prev {
            Some(p) => self.nodes[p].next = idx,
            None => self.head = idx,
        }
    }

    fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = self.nodes[idx];
            let start = align_up(node.start, align);
            let end = start.checked_add(size)?;
            if end <= node.end() && start >= node.start {
                if start == node.start && end == node.end() {
                    self.link(prev, node.next);
                    self.release_node(idx);
                } else if start == node.start {
                    self.nodes[idx].start = end;
                    self.nodes[idx].size = node.end() - end;
                } else if end == node.end() {
                    self.nodes[idx].size = start - node.start;
                } else {
                    let tail = self.insert_node(end, node.end() - end, node.next);
                    self.nodes[idx].size = start - node.start;
                    self.nodes[idx].next = Some(tail);
                }
                return Some(start);
            }
            prev = cursor;
            cursor = node.next;
        }
        None
    }

    fn free(&mut self, start: u64, size: u64) {
        let end = start + size;
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            if self.nodes[idx].start >= start {
                break;
            }
            prev = cursor;
            cursor = self.nodes[idx].next;
        }

        if let Some(p) = prev {
            if self.nodes[p].end() == start {
                self.nodes[p].size += size;
                if let Some(n) = cursor {
                    if self.nodes[p].end() == self.nodes[n].start {
                        self.nodes[p].size += self.nodes[n].size;
                        self.nodes[p].next = self.nodes[n].next;
                        self.release_node(n);
                    }
                }
                return;
            }
        }

        if let Some(n) = cursor {
            if self.nodes[n].start == end {
                self.nodes[n].start = start;
                self.nodes[n].size += size;
                return;
            }
        }

        let idx = self.insert_node(start, size, cursor);
        self.link(prev, Some(idx));
    }

    fn blocks(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            out.push((self.nodes[idx].start, self.nodes[idx].size));
            cursor = self.nodes[idx].next;
        }
        out
    }
}

/// Private pool over `[base, base + size)`.
#[derive(Debug)]
pub struct FreeListPool {
    base: u64,
    size: u64,
    list: Mutex<FreeList>,
}

impl FreeListPool {
    /// Pool whose free list starts as one block spanning the whole range.
    #[must_use]
    pub fn new(base: u64, size: u64) -> Self {
        let mut list = FreeList::default();
        if size > 0 {
            list.head = Some(list.insert_node(base, size, None));
        }
        debug!(target: "xrp-pool", "[pool] private pool {base:#x}+{size:#x}");
        Self {
            base,
            size,
            list: Mutex::new(list),
        }
    }

    /// Physical base of the carve-out.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Length of the carve-out.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Free blocks in address order as `(start, size)`.
    #[must_use]
    pub fn free_blocks(&self) -> Vec<(u64, u64)> {
        self.list.lock().expect("poisoned pool lock").blocks()
    }

    /// Total bytes currently free.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_blocks().iter().map(|(_, size)| size).sum()
    }
}

impl Pool for FreeListPool {
    fn alloc(&self, size: u64, align: u64) -> Result<u64, PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }
        if !align.is_power_of_two() {
            return Err(PoolError::InvalidAlignment(align));
        }
        let start = self
            .list
            .lock()
            .expect("poisoned pool lock")
            .alloc(size, align)
            .ok_or(PoolError::OutOfMemory { size })?;
        trace!(target: "xrp-pool", "[pool] alloc {start:#x}+{size:#x} align={align:#x}");
        Ok(start)
    }

    fn free(&self, start: u64, size: u64) {
        trace!(target: "xrp-pool", "[pool] free {start:#x}+{size:#x}");
        self.list.lock().expect("poisoned pool lock").free(start, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x8000_0000;

    #[test]
    fn exact_head_tail_and_split_cases() {
        let pool = FreeListPool::new(BASE, 0x10000);
        let a = pool.alloc(0x1000, 0x1000).unwrap();
        assert_eq!(a, BASE);
        assert_eq!(pool.free_blocks(), vec![(BASE + 0x1000, 0xf000)]);

        let b = pool.alloc(0x1000, 0x4000).unwrap();
        assert_eq!(b, BASE + 0x4000);
        assert_eq!(
            pool.free_blocks(),
            vec![(BASE + 0x1000, 0x3000), (BASE + 0x5000, 0xb000)]
        );

        let c = pool.alloc(0x3000, 0x1000).unwrap();
        assert_eq!(c, BASE + 0x1000);
        assert_eq!(pool.free_blocks(), vec![(BASE + 0x5000, 0xb000)]);

        let d = pool.alloc(0x1000, 0x10000).unwrap_err();
        assert_eq!(d, PoolError::OutOfMemory { size: 0x1000 });
    }

    #[test]
    fn free_merges_with_both_neighbours() {
        let pool = FreeListPool::new(BASE, 0x3000);
        let a = pool.alloc(0x1000, 0x1000).unwrap();
        let b = pool.alloc(0x1000, 0x1000).unwrap();
        let c = pool.alloc(0x1000, 0x1000).unwrap();
        assert!(pool.free_blocks().is_empty());
        pool.free(a, 0x1000);
        pool.free(c, 0x1000);
        assert_eq!(pool.free_blocks(), vec![(a, 0x1000), (c, 0x1000)]);
        pool.free(b, 0x1000);
        assert_eq!(pool.free_blocks(), vec![(BASE, 0x3000)]);
    }

    #[test]
    fn freeing_before_the_head_merges_forward() {
        let pool = FreeListPool::new(BASE, 0x2000);
        let a = pool.alloc(0x1000, 0x1000).unwrap();
        pool.free(a, 0x1000);
        assert_eq!(pool.free_blocks(), vec![(BASE, 0x2000)]);
    }
}
