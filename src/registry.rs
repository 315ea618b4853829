// Author: Lukas Bower
// Purpose: Driver-wide bookkeeping shared by every DSP instance.

//! The registry owns what a kernel driver would keep in globals: the set of
//! open driver files (used to recognise buffers mapped from another device)
//! and the device node ids handed out to instances.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use heapless::String as HeaplessString;
use log::debug;
use spin::Mutex;

/// Maximum length of a device node name.
pub const NODE_NAME_CAPACITY: usize = 16;

/// Identity of one open driver file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(u64);

impl FileId {
    /// Raw identifier.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Process-wide driver state, passed by reference to each device.
#[derive(Debug)]
pub struct Registry {
    files: Mutex<BTreeSet<FileId>>,
    next_file: AtomicU64,
    nodes: Mutex<BTreeSet<u32>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeSet::new()),
            next_file: AtomicU64::new(1),
            nodes: Mutex::new(BTreeSet::new()),
        }
    }

    /// Record a newly opened file.
    pub fn register_file(&self) -> FileId {
        let id = FileId(self.next_file.fetch_add(1, Ordering::Relaxed));
        self.files.lock().insert(id);
        debug!(target: "xrp-registry", "[registry] open file={}", id.0);
        id
    }

    /// Forget a closed file.
    pub fn unregister_file(&self, id: FileId) {
        if self.files.lock().remove(&id) {
            debug!(target: "xrp-registry", "[registry] close file={}", id.0);
        }
    }

    /// Returns true while `id` is open.
    #[must_use]
    pub fn is_known_file(&self, id: FileId) -> bool {
        self.files.lock().contains(&id)
    }

    /// Smallest unused node id.
    pub fn alloc_node(&self) -> u32 {
        let mut nodes = self.nodes.lock();
        let id = (0..).find(|id| !nodes.contains(id)).unwrap_or(u32::MAX);
        nodes.insert(id);
        id
    }

    /// Return a node id.
    pub fn release_node(&self, id: u32) {
        self.nodes.lock().remove(&id);
    }

    /// Node ids currently in use.
    #[must_use]
    pub fn nodes(&self) -> Vec<u32> {
        self.nodes.lock().iter().copied().collect()
    }
}

/// Device node name for `id`, e.g. `xvp0`.
#[must_use]
pub fn node_name(id: u32) -> HeaplessString<NODE_NAME_CAPACITY> {
    let mut name = HeaplessString::new();
    let _ = core::fmt::write(&mut name, format_args!("xvp{id}"));
    name
}
