//! Best-effort POSIX realization of the platform traits, for exercising the
//! tracer core on a development machine that isn't real AmigaOS hardware.
//!
//! There is no real interrupt line to mask and no real Exec semaphore on
//! Linux, so these are *analogues* chosen to honor the contracts spec.md
//! actually cares about (a short, uncontended critical section; shared-read /
//! exclusive-write mutual exclusion discoverable by name) rather than literal
//! translations. Grounded on `cognitod::runtime::sequencer`'s willingness to
//! reach for a raw `libc` call with a logged fallback when the exact kernel
//! primitive isn't available (`advise_hugepages`).

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use atrace_common::CallerId;

use crate::{InterruptGuard, NamedLock, PlatformError};

/// Process-local stand-in for `Forbid`/`Permit`: a spinlock held for the
/// duration of the reservation window. Real interrupt masking isn't
/// available (and wouldn't mean anything for a single hosted process), but
/// the contract that matters — the window is brief and exclusive — holds.
static INTERRUPT_TOKEN: Mutex<()> = Mutex::new(());

pub struct PosixInterruptGuard {
    _guard: std::sync::MutexGuard<'static, ()>,
}

impl InterruptGuard for PosixInterruptGuard {
    fn disable() -> Self {
        let guard = INTERRUPT_TOKEN
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Self { _guard: guard }
    }
}

/// Caller identity backed by the calling OS thread's id. This is a coarser
/// analogue than a real per-task pointer (POSIX threads, not cooperative
/// tasks) but preserves the property the filter engine depends on: distinct
/// execution contexts compare unequal and a context's identity is stable for
/// its lifetime.
pub struct PosixCurrentTask;

fn thread_id_as_usize() -> usize {
    // `ThreadId` has no stable numeric accessor; hash it into a usize so it
    // can live in the same `CallerId` newtype the rest of the crate uses.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() as usize) | 1 // never collide with CallerId::NONE (0)
}

static THREAD_NAMES: OnceLock<Mutex<HashMap<usize, String>>> = OnceLock::new();

impl crate::CurrentTask for PosixCurrentTask {
    fn current() -> CallerId {
        let id = thread_id_as_usize();
        let names = THREAD_NAMES.get_or_init(|| Mutex::new(HashMap::new()));
        let mut names = names.lock().unwrap_or_else(|p| p.into_inner());
        names
            .entry(id)
            .or_insert_with(|| std::thread::current().name().unwrap_or("?").to_string());
        CallerId(id)
    }

    fn name_of(id: CallerId) -> Option<String> {
        let names = THREAD_NAMES.get_or_init(|| Mutex::new(HashMap::new()));
        names.lock().unwrap_or_else(|p| p.into_inner()).get(&id.0).cloned()
    }

    fn ready_and_waiting() -> Vec<CallerId> {
        let names = THREAD_NAMES.get_or_init(|| Mutex::new(HashMap::new()));
        names
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .map(CallerId)
            .collect()
    }
}

/// Named lock backed by a process-wide registry of `RwLock`s, standing in for
/// the anchor's embedded semaphore and the host's name registry together.
pub struct PosixNamedLock {
    name: String,
}

static REGISTRY: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();
static LOCKS: OnceLock<Mutex<HashMap<String, &'static RwLock<()>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, usize>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn locks() -> &'static Mutex<HashMap<String, &'static RwLock<()>>> {
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub enum PosixLockGuard<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
}

impl NamedLock for PosixNamedLock {
    type Guard<'a> = PosixLockGuard<'a>;

    fn register(name: &str, anchor_addr: usize) -> Result<Self, PlatformError> {
        let mut reg = registry().lock().unwrap_or_else(|p| p.into_inner());
        if reg.contains_key(name) {
            return Err(PlatformError::AlreadyRegistered(name.to_string()));
        }
        reg.insert(name.to_string(), anchor_addr);
        locks()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(name.to_string())
            .or_insert_with(|| Box::leak(Box::new(RwLock::new(()))));
        Ok(Self { name: name.to_string() })
    }

    fn find(name: &str) -> Option<usize> {
        registry()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .copied()
    }

    fn attach(name: &str) -> Option<Self> {
        registry()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
            .then(|| Self { name: name.to_string() })
    }

    fn shared(&self) -> PosixLockGuard<'_> {
        let lock = *locks()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&self.name)
            .expect("lock registered alongside name");
        PosixLockGuard::Read(lock.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn try_shared(&self) -> Option<PosixLockGuard<'_>> {
        let lock = *locks().lock().unwrap_or_else(|p| p.into_inner()).get(&self.name)?;
        lock.try_read().ok().map(PosixLockGuard::Read)
    }

    fn try_exclusive(&self) -> Option<PosixLockGuard<'_>> {
        let lock = *locks()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&self.name)?;
        lock.try_write().ok().map(PosixLockGuard::Write)
    }

    fn unregister(self) {
        registry()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.name);
    }
}
