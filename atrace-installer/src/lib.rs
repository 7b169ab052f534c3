//! Patch installer (spec.md §4.1): allocates the anchor, ring, and patch
//! array; generates and swaps in a stub for every entry in the static
//! function table; and drives the `STATUS`/`ENABLE`/`DISABLE`/`QUIT`
//! reconfiguration protocol.
//!
//! Per-function failures during install are logged and skipped rather than
//! aborting the whole install, the same control flow as
//! `cognitod::main::attach_kprobe_optional` wrapping
//! `attach_kprobe_internal` and continuing past a single failed attach.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use atrace_common::{
    Anchor, FuncPtr, FunctionTableEntry, PatchDescriptor, ANCHOR_NAME, DEFAULT_RING_CAPACITY,
    TABLE,
};
use atrace_platform::{InterruptGuard, LibraryBase, NamedLock, PlatformError};
use atrace_ring::{Ring, RingError};
use atrace_stubgen::{GeneratedStub, StubContext, StubError, StubGenerator};
use thiserror::Error;

/// Bound on `DISABLE`'s `use_count` drain poll, per spec.md §5 ("bounded by
/// ~50 polls, ~1 s").
const USE_COUNT_DRAIN_POLLS: u32 = 50;
const USE_COUNT_DRAIN_TICK: Duration = Duration::from_millis(20);
/// Bound on `QUIT`'s wait for the coordination primitive's exclusive side.
const EXCLUSIVE_ACQUIRE_ATTEMPTS: u32 = 200;
const EXCLUSIVE_ACQUIRE_TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("unknown function name {0:?}")]
    UnknownFunction(String),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Stub(#[from] StubError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("no tracer is installed")]
    NotInstalled,
    #[error("a tracer is already installed")]
    AlreadyInstalled,
    #[error("could not acquire the coordination primitive exclusively before shutdown")]
    ExclusiveAcquireTimedOut,
}

pub struct InstallConfig {
    pub ring_capacity: u32,
    pub only: Option<Vec<String>>,
    pub start_disabled: bool,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            only: None,
            start_disabled: false,
        }
    }
}

pub struct InstallReport {
    pub installed: Vec<String>,
    pub failures: Vec<(String, InstallError)>,
}

pub enum ReconfigureCmd {
    Status,
    /// Empty means "global"; non-empty means "these names only".
    Enable(Vec<String>),
    Disable(Vec<String>),
    Quit,
}

#[derive(Debug, Clone)]
pub struct PatchStatus {
    pub name: String,
    pub enabled: bool,
    pub use_count: u32,
}

pub enum ReconfigureReport {
    Status {
        patches: Vec<PatchStatus>,
        globally_enabled: bool,
        overflow: u32,
        events_consumed: u32,
    },
    Enabled(Vec<String>),
    Disabled(Vec<String>),
    Quit,
}

fn qualified(entry: &FunctionTableEntry) -> String {
    format!("{}.{}", entry.lib_name, entry.func_name)
}

fn resolve_names(names: &[String]) -> Result<Vec<usize>, InstallError> {
    names
        .iter()
        .map(|n| {
            TABLE
                .iter()
                .position(|e| e.func_name.eq_ignore_ascii_case(n))
                .ok_or_else(|| InstallError::UnknownFunction(n.clone()))
        })
        .collect()
}

/// A named subset of high-frequency primitives auto-disabled on a fresh
/// install unless explicitly named, per spec.md §4.1's noise policy.
/// Grounded on the teacher's `ProbesConfig::enable_page_faults`: an
/// off-by-default high-frequency probe a caller must opt into by name.
pub fn noise_function_names() -> Vec<&'static str> {
    atrace_common::function_table::noise_function_names()
}

struct Installed<N> {
    anchor: Box<Anchor>,
    patches: Box<[PatchDescriptor]>,
    ring: Option<Arc<Ring>>,
    stubs: Vec<Option<GeneratedStub>>,
    lock: Option<N>,
    /// Saved noise-function enable state while a run-mode claim has them
    /// force-enabled (spec.md §4.5.3 step 3/6).
    saved_noise_state: Option<Vec<(usize, bool)>>,
}

pub struct Installer<L, G, N> {
    libraries: HashMap<u8, L>,
    installed: Option<Installed<N>>,
    _guard: PhantomData<G>,
}

impl<L, G, N> Installer<L, G, N>
where
    L: LibraryBase,
    G: InterruptGuard,
    N: NamedLock,
{
    pub fn new(libraries: HashMap<u8, L>) -> Self {
        Self {
            libraries,
            installed: None,
            _guard: PhantomData,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    /// Borrow the resident anchor, for a consumer sharing this process with
    /// its installer (the combined producer+consumer binary a hosted build
    /// runs in lieu of two real OS processes rendezvousing through a real
    /// shared region — see `atraced`).
    pub fn installed_anchor(&self) -> Option<&Anchor> {
        self.installed.as_ref().map(|i| i.anchor.as_ref())
    }

    pub fn installed_patches(&self) -> Option<&[PatchDescriptor]> {
        self.installed.as_ref().map(|i| &*i.patches)
    }

    pub fn installed_ring(&self) -> Option<Arc<Ring>> {
        self.installed.as_ref().and_then(|i| i.ring.clone())
    }

    pub fn install(&mut self, cfg: InstallConfig) -> Result<InstallReport, InstallError> {
        if self.installed.is_some() {
            return Err(InstallError::AlreadyInstalled);
        }

        // Unknown function name in an explicit list is fatal before any
        // allocation (spec.md §4.1).
        let only_indices = match &cfg.only {
            Some(names) => Some(resolve_names(names)?),
            None => None,
        };

        let ring = Arc::new(Ring::new(cfg.ring_capacity)?);

        let mut patches = Vec::with_capacity(TABLE.len());
        for (i, entry) in TABLE.iter().enumerate() {
            let enabled = if cfg.start_disabled {
                false
            } else if let Some(indices) = &only_indices {
                indices.contains(&i)
            } else {
                !entry.noise
            };
            patches.push(PatchDescriptor {
                lib_id: entry.lib_id,
                lvo: entry.lvo,
                func_id: i as u16,
                arg_count: entry.arg_count,
                enabled: std::sync::atomic::AtomicU32::new(enabled as u32),
                use_count: std::sync::atomic::AtomicU32::new(0),
                original: FuncPtr::NULL,
                stub_addr: 0,
                stub_size: 0,
                arg_regs: entry.arg_regs,
                string_args: entry.string_args,
            });
        }
        let mut patches = patches.into_boxed_slice();

        let mut anchor = Box::new(Anchor::new(TABLE.len() as u16, patches.as_ptr() as usize));
        anchor.set_ring(ring_address(&ring));
        let anchor_addr = &*anchor as *const Anchor as usize;

        let mut installed_names = Vec::new();
        let mut failures = Vec::new();
        let mut stubs: Vec<Option<GeneratedStub>> = (0..TABLE.len()).map(|_| None).collect();

        for (i, entry) in TABLE.iter().enumerate() {
            match self.install_one(entry, &mut patches[i], anchor_addr, &ring) {
                Ok(stub) => {
                    stubs[i] = Some(stub);
                    installed_names.push(qualified(entry));
                }
                Err(err) => {
                    log::warn!("stub install failed for {}: {err}", qualified(entry));
                    failures.push((qualified(entry), err));
                }
            }
        }

        let lock = N::register(ANCHOR_NAME, anchor_addr)?;

        self.installed = Some(Installed {
            anchor,
            patches,
            ring: Some(ring),
            stubs,
            lock: Some(lock),
            saved_noise_state: None,
        });

        Ok(InstallReport {
            installed: installed_names,
            failures,
        })
    }

    fn install_one(
        &self,
        entry: &FunctionTableEntry,
        patch: &mut PatchDescriptor,
        anchor_addr: usize,
        ring: &Arc<Ring>,
    ) -> Result<GeneratedStub, InstallError> {
        let lib = self
            .libraries
            .get(&entry.lib_id)
            .ok_or_else(|| InstallError::UnknownFunction(qualified(entry)))?;

        let ctx = StubContext {
            anchor_addr,
            ring_base_addr: ring_address(ring),
            patch_addr: patch as *const PatchDescriptor as usize,
        };
        let mut stub = StubGenerator::generate(patch, &ctx)?;

        // Swap the jump-table entry and patch the stub with what the swap
        // returned under one interrupt-disable window, per spec.md §4.1's
        // install algorithm step 3.
        let _guard = G::disable();
        // SAFETY: stub.page holds len() bytes of writable memory that never
        // moves for the lifetime of this GeneratedStub, which this installer
        // keeps resident for as long as the patch is installed.
        let new_target = FuncPtr(stub.page.as_ptr() as usize);
        let previous = unsafe { lib.swap_vector(entry.lvo, new_target) };
        atrace_stubgen::patch_original(&mut stub, previous);
        drop(_guard);

        patch.original = previous;
        patch.stub_addr = stub.page.as_ptr() as usize;
        patch.stub_size = stub.total_len;

        Ok(stub)
    }

    pub fn reconfigure(&mut self, cmd: ReconfigureCmd) -> Result<ReconfigureReport, InstallError> {
        let installed = self.installed.as_mut().ok_or(InstallError::NotInstalled)?;

        match cmd {
            ReconfigureCmd::Status => {
                let patches = TABLE
                    .iter()
                    .zip(installed.patches.iter())
                    .map(|(entry, patch)| PatchStatus {
                        name: qualified(entry),
                        enabled: patch.is_enabled(),
                        use_count: patch.use_count(),
                    })
                    .collect();
                Ok(ReconfigureReport::Status {
                    patches,
                    globally_enabled: installed.anchor.is_globally_enabled(),
                    overflow: installed
                        .ring
                        .as_ref()
                        .map(|r| r.overflow_count())
                        .unwrap_or(0),
                    events_consumed: installed.anchor.events_consumed.load(Ordering::Relaxed),
                })
            }
            ReconfigureCmd::Enable(names) => {
                if names.is_empty() {
                    installed.anchor.set_global_enable(true);
                    Ok(ReconfigureReport::Enabled(Vec::new()))
                } else {
                    let indices = resolve_names(&names)?;
                    for i in &indices {
                        installed.patches[*i].set_enabled(true);
                    }
                    Ok(ReconfigureReport::Enabled(names))
                }
            }
            ReconfigureCmd::Disable(names) => {
                if names.is_empty() {
                    installed.anchor.set_global_enable(false);
                    drain_use_count(&installed.patches);
                    if let Some(ring) = &installed.ring {
                        let drained = ring.global_disable_drain::<G>();
                        installed
                            .anchor
                            .events_consumed
                            .fetch_add(drained, Ordering::AcqRel);
                    }
                    Ok(ReconfigureReport::Disabled(Vec::new()))
                } else {
                    let indices = resolve_names(&names)?;
                    for i in &indices {
                        installed.patches[*i].set_enabled(false);
                    }
                    Ok(ReconfigureReport::Disabled(names))
                }
            }
            ReconfigureCmd::Quit => {
                installed.anchor.set_global_enable(false);
                drain_use_count(&installed.patches);
                if let Some(ring) = &installed.ring {
                    let drained = ring.global_disable_drain::<G>();
                    installed
                        .anchor
                        .events_consumed
                        .fetch_add(drained, Ordering::AcqRel);
                }

                let lock = installed.lock.as_ref().ok_or(InstallError::NotInstalled)?;
                let mut acquired = false;
                for _ in 0..EXCLUSIVE_ACQUIRE_ATTEMPTS {
                    if let Some(_guard) = lock.try_exclusive() {
                        installed.anchor.clear_ring();
                        acquired = true;
                        break;
                    }
                    std::thread::sleep(EXCLUSIVE_ACQUIRE_TICK);
                }
                if !acquired {
                    return Err(InstallError::ExclusiveAcquireTimedOut);
                }

                // Ring buffer itself is freed; anchor, patch array, and stub
                // code remain resident (spec.md §4.1: "intentional, because
                // outstanding in-flight calls may still be inside a stub").
                installed.ring = None;
                if let Some(lock) = installed.lock.take() {
                    lock.unregister();
                }
                Ok(ReconfigureReport::Quit)
            }
        }
    }
}

fn ring_address(ring: &Arc<Ring>) -> usize {
    Arc::as_ptr(ring) as usize
}

fn drain_use_count(patches: &[PatchDescriptor]) {
    for _ in 0..USE_COUNT_DRAIN_POLLS {
        if patches.iter().all(|p| p.use_count() == 0) {
            return;
        }
        std::thread::sleep(USE_COUNT_DRAIN_TICK);
    }
    if let Some(stuck) = patches.iter().find(|p| p.use_count() != 0) {
        log::warn!(
            "use_count drain timed out with a non-zero counter (lvo {})",
            stuck.lvo
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrace_common::function_table::{LIB_DOS, LIB_EXEC};
    use atrace_platform::sim::SimLibrary;

    fn libraries() -> HashMap<u8, SimLibrary> {
        let mut map = HashMap::new();
        map.insert(LIB_EXEC, SimLibrary::new(0xE000));
        map.insert(LIB_DOS, SimLibrary::new(0xD000));
        map
    }

    type TestInstaller =
        Installer<SimLibrary, atrace_platform::sim::SimInterruptGuard, atrace_platform::sim::SimNamedLock>;

    #[test]
    fn fresh_install_enables_everything_but_noise_functions() {
        let mut installer = TestInstaller::new(libraries());
        let report = installer.install(InstallConfig::default()).unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(report.installed.len(), TABLE.len());

        let status = match installer.reconfigure(ReconfigureCmd::Status).unwrap() {
            ReconfigureReport::Status { patches, .. } => patches,
            _ => unreachable!(),
        };
        for (entry, status) in TABLE.iter().zip(status.iter()) {
            assert_eq!(status.enabled, !entry.noise, "{}", status.name);
        }
    }

    #[test]
    fn explicit_only_list_overrides_noise_policy() {
        let mut installer = TestInstaller::new(libraries());
        installer
            .install(InstallConfig {
                only: Some(vec!["AllocMem".to_string()]),
                ..Default::default()
            })
            .unwrap();
        let status = match installer.reconfigure(ReconfigureCmd::Status).unwrap() {
            ReconfigureReport::Status { patches, .. } => patches,
            _ => unreachable!(),
        };
        let alloc = status.iter().find(|s| s.name.ends_with("AllocMem")).unwrap();
        assert!(alloc.enabled);
        let open = status.iter().find(|s| s.name.ends_with("OpenLibrary")).unwrap();
        assert!(!open.enabled);
    }

    #[test]
    fn unknown_function_name_is_rejected_before_any_allocation() {
        let mut installer = TestInstaller::new(libraries());
        let err = installer
            .install(InstallConfig {
                only: Some(vec!["NoSuchFunction".to_string()]),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, InstallError::UnknownFunction(_)));
        assert!(!installer.is_installed());
    }

    #[test]
    fn global_disable_then_quit_unregisters_the_anchor_name() {
        let mut installer = TestInstaller::new(libraries());
        installer.install(InstallConfig::default()).unwrap();
        installer
            .reconfigure(ReconfigureCmd::Disable(Vec::new()))
            .unwrap();
        assert!(matches!(
            installer.reconfigure(ReconfigureCmd::Quit).unwrap(),
            ReconfigureReport::Quit
        ));
        assert!(atrace_platform::sim::SimNamedLock::find(ANCHOR_NAME).is_none());
    }

    #[test]
    fn reconfigure_without_install_is_an_error() {
        let mut installer = TestInstaller::new(libraries());
        assert!(matches!(
            installer.reconfigure(ReconfigureCmd::Status),
            Err(InstallError::NotInstalled)
        ));
    }
}
