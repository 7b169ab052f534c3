//! The top-level anchor through which producer and consumer rendezvous, plus
//! the small newtypes that stand in for raw addresses. Everything here is a
//! `usize` underneath rather than a real pointer: the struct itself must stay
//! `Send`/`Sync` and hashable (the caller-name cache and lock-to-path cache
//! key off `CallerId`), the same way `linnix-ai-ebpf-common` keeps
//! `ProcessEvent` plain-old-data and pushes raw-pointer work into `cognitod`'s
//! `runtime` module instead of the shared struct itself.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Sentinel identifying a valid tracer anchor (ASCII "ATRC").
pub const ANCHOR_MAGIC: u32 = 0x4154_5243;
pub const ANCHOR_VERSION: u16 = 1;

/// Well-known name the anchor is published under on the host's process-wide
/// name registry.
pub const ANCHOR_NAME: &str = "atrace_patches";

/// Opaque caller identity: the OS scheduler's current-task pointer, as an
/// address rather than a raw pointer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallerId(pub usize);

impl CallerId {
    pub const NONE: CallerId = CallerId(0);

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// A library's base pointer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LibBase(pub usize);

/// The address of a function vector (either the original implementation or a
/// generated stub), retrieved from / installed into a jump-table entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FuncPtr(pub usize);

impl FuncPtr {
    pub const NULL: FuncPtr = FuncPtr(0);
}

/// Anchor-wide state. `global_enable` and `filter_task` are read by stub
/// prologues without holding any lock, so they are atomics; `ring` and
/// `patch_count`/`patches` are write-once-at-creation (or, for `ring`, nulled
/// exactly once at shutdown under the coordination primitive) and so are
/// plain fields guarded by program discipline rather than the type system.
#[repr(C)]
pub struct Anchor {
    magic: u32,
    version: u16,
    pub global_enable: AtomicU32,
    ring: Option<usize>,
    patch_count: u16,
    patches: usize,
    pub event_sequence: AtomicU32,
    pub events_consumed: AtomicU32,
    /// 0 means "no filter installed"; see `CallerId::NONE`.
    filter_task: AtomicUsize,
}

impl Anchor {
    pub fn new(patch_count: u16, patches_addr: usize) -> Self {
        Self {
            magic: ANCHOR_MAGIC,
            version: ANCHOR_VERSION,
            global_enable: AtomicU32::new(1),
            ring: None,
            patch_count,
            patches: patches_addr,
            event_sequence: AtomicU32::new(0),
            events_consumed: AtomicU32::new(0),
            filter_task: AtomicUsize::new(0),
        }
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// `None` once `magic`/`version` don't match what this crate expects —
    /// callers must refuse to attach rather than guess.
    pub fn validate(&self) -> bool {
        self.magic == ANCHOR_MAGIC && self.version == ANCHOR_VERSION
    }

    pub fn patch_count(&self) -> u16 {
        self.patch_count
    }

    pub fn patches_addr(&self) -> usize {
        self.patches
    }

    pub fn ring_addr(&self) -> Option<usize> {
        self.ring
    }

    /// Set once at creation. Panics if called twice — `ring` is write-once
    /// except for the single shutdown nulling via [`Anchor::clear_ring`].
    pub fn set_ring(&mut self, addr: usize) {
        assert!(self.ring.is_none(), "ring address is write-once");
        self.ring = Some(addr);
    }

    /// Only ever called once, by `QUIT`, with the coordination primitive held
    /// exclusively.
    pub fn clear_ring(&mut self) {
        self.ring = None;
    }

    pub fn is_globally_enabled(&self) -> bool {
        self.global_enable.load(Ordering::Acquire) != 0
    }

    pub fn set_global_enable(&self, enabled: bool) {
        self.global_enable
            .store(enabled as u32, Ordering::Release);
    }

    pub fn filter_task(&self) -> Option<CallerId> {
        match self.filter_task.load(Ordering::Acquire) {
            0 => None,
            addr => Some(CallerId(addr)),
        }
    }

    pub fn set_filter_task(&self, task: Option<CallerId>) {
        self.filter_task
            .store(task.map(|c| c.0).unwrap_or(0), Ordering::Release);
    }

    pub fn next_sequence(&self) -> u32 {
        self.event_sequence.fetch_add(1, Ordering::AcqRel)
    }
}

/// Byte offset of `global_enable` within [`Anchor`], for the stub
/// generator's `Displacement` patch sites.
pub const GLOBAL_ENABLE_OFFSET: usize = std::mem::offset_of!(Anchor, global_enable);
/// Byte offset of `filter_task` within [`Anchor`].
pub const FILTER_TASK_OFFSET: usize = std::mem::offset_of!(Anchor, filter_task);
/// Byte offset of `event_sequence` within [`Anchor`].
pub const EVENT_SEQUENCE_OFFSET: usize = std::mem::offset_of!(Anchor, event_sequence);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_anchor_validates() {
        let anchor = Anchor::new(0, 0);
        assert!(anchor.validate());
        assert!(anchor.is_globally_enabled());
        assert!(anchor.filter_task().is_none());
    }

    #[test]
    fn ring_is_write_once_except_shutdown_clear() {
        let mut anchor = Anchor::new(0, 0);
        anchor.set_ring(0x1000);
        assert_eq!(anchor.ring_addr(), Some(0x1000));
        anchor.clear_ring();
        assert_eq!(anchor.ring_addr(), None);
    }

    #[test]
    #[should_panic]
    fn ring_cannot_be_set_twice_without_clearing() {
        let mut anchor = Anchor::new(0, 0);
        anchor.set_ring(0x1000);
        anchor.set_ring(0x2000);
    }

    #[test]
    fn sequence_wraps_like_a_plain_u32() {
        let anchor = Anchor::new(0, 0);
        anchor.event_sequence.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(anchor.next_sequence(), u32::MAX);
        assert_eq!(anchor.event_sequence.load(Ordering::Relaxed), 0);
    }
}
