//! In-process fakes for the platform traits, used by every unit test in this
//! workspace (and available to any crate that turns on the default `sim`
//! feature). This is what makes spec.md §8's testable properties checkable
//! without real AmigaOS hardware: a simulated library base with a jump
//! table, a simulated scheduler whose "current task" a test can set
//! directly, and a simulated named semaphore.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use atrace_common::{CallerId, FuncPtr, LibBase};

use crate::{CurrentTask, InterruptGuard, LibraryBase, NamedLock, PlatformError};

/// A fake library jump table: a map from LVO to the installed vector.
pub struct SimLibrary {
    base: LibBase,
    vectors: Mutex<HashMap<i16, FuncPtr>>,
}

impl SimLibrary {
    pub fn new(base_addr: usize) -> Self {
        Self {
            base: LibBase(base_addr),
            vectors: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the original implementation a test expects `swap_vector` to
    /// return the first time it patches a given LVO.
    pub fn seed(&self, lvo: i16, original: FuncPtr) {
        self.vectors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(lvo, original);
    }
}

impl LibraryBase for SimLibrary {
    fn base(&self) -> LibBase {
        self.base
    }

    fn read_vector(&self, lvo: i16) -> FuncPtr {
        self.vectors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&lvo)
            .copied()
            .unwrap_or(FuncPtr::NULL)
    }

    unsafe fn swap_vector(&self, lvo: i16, new: FuncPtr) -> FuncPtr {
        let mut table = self.vectors.lock().unwrap_or_else(|p| p.into_inner());
        let previous = table.get(&lvo).copied().unwrap_or(FuncPtr::NULL);
        table.insert(lvo, new);
        previous
    }
}

/// Counts concurrent holders so tests can assert the reservation window is
/// never entered re-entrantly from the same logical thread of control.
static DISABLE_DEPTH: Mutex<u32> = Mutex::new(0);

pub struct SimInterruptGuard;

impl InterruptGuard for SimInterruptGuard {
    fn disable() -> Self {
        *DISABLE_DEPTH.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Self
    }
}

impl Drop for SimInterruptGuard {
    fn drop(&mut self) {
        *DISABLE_DEPTH.lock().unwrap_or_else(|p| p.into_inner()) -= 1;
    }
}

pub fn disable_depth() -> u32 {
    *DISABLE_DEPTH.lock().unwrap_or_else(|p| p.into_inner())
}

thread_local! {
    static CURRENT: Cell<CallerId> = const { Cell::new(CallerId(0x1000)) };
}

static TASK_NAMES: OnceLock<Mutex<HashMap<CallerId, String>>> = OnceLock::new();

fn task_names() -> &'static Mutex<HashMap<CallerId, String>> {
    TASK_NAMES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Set the simulated current task for the calling thread for the rest of
/// this scope (a test helper, not part of the public trait surface).
pub fn set_current(id: CallerId) {
    CURRENT.with(|c| c.set(id));
}

pub fn name_task(id: CallerId, name: impl Into<String>) {
    task_names()
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(id, name.into());
}

pub struct SimCurrentTask;

impl CurrentTask for SimCurrentTask {
    fn current() -> CallerId {
        CURRENT.with(|c| c.get())
    }

    fn name_of(id: CallerId) -> Option<String> {
        task_names().lock().unwrap_or_else(|p| p.into_inner()).get(&id).cloned()
    }

    fn ready_and_waiting() -> Vec<CallerId> {
        task_names()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect()
    }
}

struct SimLockState {
    anchor_addr: usize,
    lock: RwLock<()>,
}

static SIM_LOCKS: OnceLock<Mutex<HashMap<String, &'static SimLockState>>> = OnceLock::new();

fn sim_locks() -> &'static Mutex<HashMap<String, &'static SimLockState>> {
    SIM_LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct SimNamedLock {
    name: String,
}

pub enum SimLockGuard<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
}

impl NamedLock for SimNamedLock {
    type Guard<'a> = SimLockGuard<'a>;

    fn register(name: &str, anchor_addr: usize) -> Result<Self, PlatformError> {
        let mut locks = sim_locks().lock().unwrap_or_else(|p| p.into_inner());
        if locks.contains_key(name) {
            return Err(PlatformError::AlreadyRegistered(name.to_string()));
        }
        let state: &'static SimLockState = Box::leak(Box::new(SimLockState {
            anchor_addr,
            lock: RwLock::new(()),
        }));
        locks.insert(name.to_string(), state);
        Ok(Self { name: name.to_string() })
    }

    fn find(name: &str) -> Option<usize> {
        sim_locks()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(|s| s.anchor_addr)
    }

    fn attach(name: &str) -> Option<Self> {
        sim_locks()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
            .then(|| Self { name: name.to_string() })
    }

    fn shared(&self) -> SimLockGuard<'_> {
        let state = *sim_locks()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&self.name)
            .expect("lock registered");
        SimLockGuard::Read(state.lock.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn try_shared(&self) -> Option<SimLockGuard<'_>> {
        let state = *sim_locks()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&self.name)?;
        state.lock.try_read().ok().map(SimLockGuard::Read)
    }

    fn try_exclusive(&self) -> Option<SimLockGuard<'_>> {
        let state = *sim_locks()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&self.name)?;
        state.lock.try_write().ok().map(SimLockGuard::Write)
    }

    fn unregister(self) {
        sim_locks()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.name);
    }
}
