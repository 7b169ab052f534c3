//! Host-abstraction traits for the atrace tracer core.
//!
//! spec.md assumes AmigaOS exec.library semantics throughout: a per-library
//! negative-offset jump table, `Forbid`/`Permit`-style interrupt disable, a
//! named Exec semaphore, and the scheduler's current-task pointer as caller
//! identity. None of that exists on a hosted Rust toolchain, so this crate
//! gives the rest of the workspace a seam to call into it through traits —
//! the same shape as `cognitod` keeping `aya::Ebpf` calls behind its own
//! `runtime` module instead of scattering them through business logic.
//!
//! The `sim` module (default feature) backs every unit test in this
//! workspace; `posix` is a best-effort realization usable for manual
//! exercising on a development machine.

use atrace_common::{CallerId, FuncPtr, LibBase};
use thiserror::Error;

pub mod exec_page;
pub mod sim;

#[cfg(feature = "posix")]
pub mod posix;

pub use exec_page::ExecPage;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("named primitive {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("named primitive {0:?} was not found")]
    NotFound(String),
    #[error("executable memory allocation failed: {0}")]
    Alloc(#[source] std::io::Error),
}

/// A library's jump table: discover its base, read an entry, and atomically
/// swap one under interrupt-disable.
pub trait LibraryBase {
    fn base(&self) -> LibBase;
    fn read_vector(&self, lvo: i16) -> FuncPtr;
    /// Swap the vector at `lvo` to `new`, returning the previous value.
    /// Callers must hold an [`InterruptGuard`] for the duration.
    ///
    /// # Safety
    /// `new` must be a valid function pointer with the calling convention
    /// the jump table entry expects.
    unsafe fn swap_vector(&self, lvo: i16, new: FuncPtr) -> FuncPtr;
}

/// RAII interrupt-disable window. Held only for a handful of instructions —
/// ring reservation, jump-table swap — never across a suspension point.
pub trait InterruptGuard: Sized {
    fn disable() -> Self;
}

/// Caller identity and name resolution, backing the caller-name cache
/// (spec.md §4.5.1).
pub trait CurrentTask {
    fn current() -> CallerId;
    fn name_of(id: CallerId) -> Option<String>;
    /// Walk the OS's ready and waiting task lists, used to refresh the
    /// caller-name cache every N polls.
    fn ready_and_waiting() -> Vec<CallerId>;
}

/// Shared-read / exclusive-write lock discoverable by name, standing in for
/// the anchor's embedded named semaphore.
pub trait NamedLock: Sized {
    type Guard<'a>
    where
        Self: 'a;

    fn register(name: &str, anchor_addr: usize) -> Result<Self, PlatformError>;
    fn find(name: &str) -> Option<usize>;
    /// Open a handle to a lock some other party already [`register`]ed, by
    /// name. This is the consumer's half of the relationship: it never
    /// creates the named primitive, only discovers and opens what the
    /// producer published.
    fn attach(name: &str) -> Option<Self>;
    fn shared(&self) -> Self::Guard<'_>;
    /// Non-blocking shared acquire. The consumer's poll loop uses this
    /// rather than [`NamedLock::shared`] — spec.md §4.4 step 1 requires a
    /// poll to be *skipped*, not stalled, while the producer is
    /// reconfiguring or shutting down.
    fn try_shared(&self) -> Option<Self::Guard<'_>>;
    fn try_exclusive(&self) -> Option<Self::Guard<'_>>;
    fn unregister(self);
}
