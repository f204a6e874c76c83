//! Bounded fixed-descriptor registry.
//!
//! A small table of file descriptors pre-registered with the kernel so
//! operations can address them by slot index instead of raw value,
//! skipping the per-operation descriptor lookup. Binding is a two-phase
//! protocol: [`bind`](FdRegistry::bind) is local and immediate,
//! [`commit_with`](FdRegistry::commit_with) pushes every binding change
//! since the previous commit to the kernel in one batched update call.
//!
//! A binding is created on the first use of a given fd and shared by
//! reference count afterwards: further `bind` calls for the same fd return
//! the same slot. The slot returns to the free list when the last
//! reference is released.
//!
//! The registry has exactly one terminal failure state: once the kernel
//! rejects a registration batch, the `degraded` flag is set for the rest
//! of its lifetime and every subsequent allocation is denied, so callers
//! transparently fall back to raw-fd addressing.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use tracing::warn;


/// Marker for an unbound table entry, as the kernel expects it.
const UNBOUND: RawFd = -1;

/// A host-visible handle to a registered descriptor slot.
///
/// Obtained from [`Engine::register_fd`](crate::Engine::register_fd). The
/// holder must not release it while any submitted-but-incomplete operation
/// still references the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedFd {
    pub(crate) slot: u32,
}

impl FixedFd {
    /// Index of this slot in the kernel's fixed-descriptor table.
    pub fn index(&self) -> u32 {
        self.slot
    }
}

/// Fixed-capacity slot table with a free list and deferred kernel sync.
///
/// Owned by the engine and touched only from its thread; no internal
/// synchronization. The registry does not track in-flight operations
/// referencing its slots; each reference holder guarantees its operation
/// has completed before releasing the slot.
pub struct FdRegistry {
    /// Kernel-table image. `-1` marks an unbound slot.
    files: Vec<RawFd>,
    /// References held on each slot's current binding.
    counts: Vec<u32>,
    /// Bindings the kernel has acknowledged.
    confirmed: Vec<bool>,
    /// Unbound slot indices, LIFO.
    free: Vec<u32>,
    /// Slots whose binding changed since the last commit.
    pending: Vec<u32>,
    /// Existing binding per fd, so repeat binds share a slot.
    by_fd: HashMap<RawFd, u32>,
    in_use: usize,
    /// Terminal: a registration batch was rejected.
    degraded: bool,
    /// The sparse table was accepted by the kernel at init.
    enabled: bool,
}

impl FdRegistry {
    /// Create a registry with `capacity` slots. A zero-capacity registry
    /// denies every allocation.
    pub fn new(capacity: u32) -> Self {
        Self {
            files: vec![UNBOUND; capacity as usize],
            counts: vec![0; capacity as usize],
            confirmed: vec![false; capacity as usize],
            free: (0..capacity).rev().collect(),
            pending: Vec::new(),
            by_fd: HashMap::new(),
            in_use: 0,
            degraded: false,
            enabled: false,
        }
    }

    /// Register the (entirely unbound) table with the kernel.
    ///
    /// Must succeed before any binding can be confirmed; rejection leaves
    /// the registry permanently degraded. Returns whether the table was
    /// accepted.
    pub fn init_with(&mut self, register: impl FnOnce(&[RawFd]) -> io::Result<()>) -> bool {
        if self.files.is_empty() {
            return false;
        }
        match register(&self.files) {
            Ok(()) => {
                self.enabled = true;
                true
            }
            Err(err) => {
                warn!(%err, "fixed-descriptor table rejected; using raw descriptors only");
                self.degraded = true;
                false
            }
        }
    }

    /// Bind `fd` to a slot, or take another reference on its existing
    /// binding. A fresh binding is pending until the next
    /// [`commit_with`](Self::commit_with); encoding uses it only once
    /// confirmed. Returns `None` when exhausted or degraded, in which case
    /// the caller addresses the kernel by raw descriptor. Amortized O(1).
    pub fn bind(&mut self, fd: RawFd) -> Option<u32> {
        if !self.enabled || self.degraded {
            return None;
        }
        if let Some(&slot) = self.by_fd.get(&fd) {
            self.counts[slot as usize] += 1;
            return Some(slot);
        }
        let slot = self.free.pop()?;
        self.files[slot as usize] = fd;
        self.counts[slot as usize] = 1;
        self.confirmed[slot as usize] = false;
        self.pending.push(slot);
        self.by_fd.insert(fd, slot);
        self.in_use += 1;
        Some(slot)
    }

    /// Release one reference on a slot. The last release unbinds it,
    /// returns it to the free list, and queues the kernel-side unbind.
    ///
    /// The caller guarantees no submitted-but-incomplete operation of its
    /// own still references the slot.
    pub fn free_slot(&mut self, slot: u32) {
        let idx = slot as usize;
        if self.files.get(idx).copied().unwrap_or(UNBOUND) == UNBOUND {
            return;
        }
        self.counts[idx] -= 1;
        if self.counts[idx] > 0 {
            return;
        }
        self.by_fd.remove(&self.files[idx]);
        self.files[idx] = UNBOUND;
        self.confirmed[idx] = false;
        self.in_use -= 1;
        self.free.push(slot);
        if self.enabled && !self.degraded {
            self.pending.push(slot);
        }
    }

    /// Push every pending binding change to the kernel in one batched
    /// update covering the affected slot range.
    ///
    /// On acceptance the pending bindings become confirmed and usable in
    /// submissions; on rejection the registry is degraded for the rest of
    /// its lifetime and fixed slots are never used again. Returns the
    /// number of slots synced.
    ///
    /// The sync operation is injected so the engine can route it through
    /// the ring's registration syscall while tests simulate rejection.
    pub fn commit_with(
        &mut self,
        sync: impl FnOnce(u32, &[RawFd]) -> io::Result<()>,
    ) -> usize {
        if self.pending.is_empty() || !self.enabled || self.degraded {
            self.pending.clear();
            return 0;
        }
        self.pending.sort_unstable();
        self.pending.dedup();
        let lo = self.pending[0] as usize;
        let hi = *self.pending.last().unwrap() as usize;
        match sync(lo as u32, &self.files[lo..=hi]) {
            Ok(()) => {
                let count = self.pending.len();
                for &slot in &self.pending {
                    if self.files[slot as usize] != UNBOUND {
                        self.confirmed[slot as usize] = true;
                    }
                }
                self.pending.clear();
                count
            }
            Err(err) => {
                warn!(%err, "fixed-descriptor update rejected; registry degraded");
                self.degraded = true;
                self.pending.clear();
                // Conservative: previously confirmed bindings are no
                // longer trusted either.
                self.confirmed.iter_mut().for_each(|c| *c = false);
                0
            }
        }
    }

    /// Whether the kernel has acknowledged this slot's current binding.
    pub fn is_confirmed(&self, slot: u32) -> bool {
        self.enabled
            && !self.degraded
            && self.confirmed.get(slot as usize).copied().unwrap_or(false)
    }

    /// Whether binding changes are waiting for a commit.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether a registration batch has been rejected.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Total slot capacity.
    pub fn capacity(&self) -> usize {
        self.files.len()
    }

    /// Currently bound slots.
    pub fn in_use(&self) -> usize {
        self.in_use
    }
}
