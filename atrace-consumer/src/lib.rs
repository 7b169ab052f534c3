//! Ring consumer: poll loop, subscriber/filter engine, caller-name and
//! lock-path caches, and line formatting (spec.md §4.4-§4.6).
//!
//! Grounded on `cognitod::runtime::sequencer::SequencerConsumer::poll_batch`'s
//! shape — sample once, drain a bounded batch, fold overflow into a
//! synthetic line — adapted to the single-writer ring and the anchor-wide
//! coordination primitive this tracer uses instead of an eBPF ring map.

pub mod caller_cache;
pub mod filter;
pub mod format;
pub mod lock_path_cache;
pub mod subscriber;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use atrace_common::function_table::{self, FunctionTableEntry};
use atrace_common::{Anchor, CallerId, PatchDescriptor};
use atrace_platform::{CurrentTask, InterruptGuard, NamedLock};
use atrace_ring::Ring;
use thiserror::Error;

pub use caller_cache::CallerNameCache;
pub use filter::Filter;
pub use format::format_event;
pub use lock_path_cache::LockPathCache;
pub use subscriber::{LineSink, Mode, Subscriber, SubscriberId, SubscriberRegistry};

/// Batch bound for one poll tick (spec.md §4.4 step 3).
pub const BATCH_BOUND: usize = 64;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("no tracer installed under the expected name")]
    NotInstalled,
    #[error("anchor magic/version mismatch, refusing to attach")]
    InvalidAnchor,
}

/// The five wire-facing error kinds of spec.md §7, as a single `thiserror`
/// enum the (out-of-scope) control-channel encoder maps onto a stable
/// numeric tag. `ControlApi` implementers use this as their `Error` type.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed command: {0}")]
    Syntax(String),
    #[error("unknown function name or missing directory: {0}")]
    NotFound(String),
    #[error("subscriber is already tracing")]
    InUse,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("subordinate process timed out")]
    Timeout,
}

impl ControlError {
    /// Stable numeric tag for the wire encoder (spec.md §7); order matches
    /// the enum's declaration order.
    pub fn wire_tag(&self) -> u8 {
        match self {
            ControlError::Syntax(_) => 0,
            ControlError::NotFound(_) => 1,
            ControlError::InUse => 2,
            ControlError::Internal(_) => 3,
            ControlError::Timeout => 4,
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// Drained this many events and released the shared lock normally.
    Drained(usize),
    /// Couldn't acquire the shared lock; the producer is mid-reconfigure.
    SkippedReconfiguring,
    /// The producer has shut down. Every subscriber received a terminal
    /// line and end-of-stream; this consumer should not be polled again.
    ShutDown,
}

struct RunClaim {
    task: CallerId,
    saved_noise_state: Vec<(usize, bool)>,
}

/// Attaches to a producer's published anchor/patch-array/ring and drives the
/// poll loop plus the subscriber registry against them.
///
/// `N` is the named-lock implementation (standing in for the anchor's
/// embedded semaphore), `G` the interrupt-disable guard used for the ring's
/// brief critical sections, `T` caller-identity resolution, `S` the
/// subscriber line sink.
pub struct Consumer<'a, N, G, T, S: LineSink> {
    anchor: &'a Anchor,
    patches: &'a [PatchDescriptor],
    ring: Arc<Ring>,
    lock: N,
    caller_cache: CallerNameCache<T>,
    lock_paths: LockPathCache,
    subscribers: SubscriberRegistry<S>,
    active_run: Option<RunClaim>,
    clock: fn() -> u64,
    shut_down: bool,
    _guard: std::marker::PhantomData<G>,
}

fn system_clock_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<'a, N, G, T, S> Consumer<'a, N, G, T, S>
where
    N: NamedLock,
    G: InterruptGuard,
    T: CurrentTask,
    S: LineSink,
{
    /// Attach to an already-registered anchor by opening its named lock.
    /// `lock_name` is normally [`atrace_common::ANCHOR_NAME`].
    pub fn attach(
        anchor: &'a Anchor,
        patches: &'a [PatchDescriptor],
        ring: Arc<Ring>,
        lock_name: &str,
    ) -> Result<Self, ConsumerError> {
        if !anchor.validate() {
            return Err(ConsumerError::InvalidAnchor);
        }
        let lock = N::attach(lock_name).ok_or(ConsumerError::NotInstalled)?;
        Ok(Self {
            anchor,
            patches,
            ring,
            lock,
            caller_cache: CallerNameCache::new(),
            lock_paths: LockPathCache::new(),
            subscribers: SubscriberRegistry::new(),
            active_run: None,
            clock: system_clock_millis,
            shut_down: false,
            _guard: std::marker::PhantomData,
        })
    }

    /// Override the wall-clock source (tests use a fixed value; the daemon
    /// uses the default `system_clock_millis`).
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn subscribers_mut(&mut self) -> &mut SubscriberRegistry<S> {
        &mut self.subscribers
    }

    pub fn subscribers(&self) -> &SubscriberRegistry<S> {
        &self.subscribers
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// `ENABLE`/`DISABLE` with no names: toggle `global_enable` (spec.md
    /// §4.1's reconfigure semantics, exposed here for a consumer-side
    /// `ControlApi` that has no installer of its own to delegate to — the
    /// producer process that installed these patches has already exited).
    pub fn set_global_enable(&self, enabled: bool) {
        self.anchor.set_global_enable(enabled);
    }

    /// `ENABLE`/`DISABLE name…`: set one patch's enable flag by name.
    /// Returns `false` for an unknown function name.
    pub fn set_patch_enabled(&self, name: &str, enabled: bool) -> bool {
        match function_table::find_by_func_name(name) {
            Some((i, _)) => {
                self.patches[i].set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Snapshot for `ControlApi::status` / `TRACE STATUS` (spec.md §6).
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            globally_enabled: self.anchor.is_globally_enabled(),
            overflow: self.ring.overflow_count(),
            events_consumed: self.anchor.events_consumed.load(Ordering::Relaxed),
            subscriber_count: self.subscribers.len(),
        }
    }

    /// One tick of the consumer's event loop (spec.md §4.4). Call at most
    /// once per host scheduler tick.
    pub fn poll_once(&mut self) -> PollOutcome {
        if self.shut_down {
            return PollOutcome::ShutDown;
        }

        let guard = match self.lock.try_shared() {
            Some(guard) => guard,
            None => {
                if !self.anchor.is_globally_enabled() {
                    for sub in self.subscribers.iter_mut() {
                        let _ = sub.sink.send_line("#\tproducer detached");
                        let _ = sub.sink.send_end_of_stream();
                    }
                    self.shut_down = true;
                    return PollOutcome::ShutDown;
                }
                return PollOutcome::SkippedReconfiguring;
            }
        };

        self.caller_cache.tick();
        let timestamp = (self.clock)();

        let mut drained = 0usize;
        let mut broken = Vec::new();
        while drained < BATCH_BOUND {
            let index = self.ring.read_pos();
            let slot = self.ring.peek(index);
            if !slot.is_valid() {
                break;
            }

            let entry = function_table::find_by_lvo(slot.lib_id, slot.lvo);
            let caller_name = self.caller_cache.resolve(CallerId(slot.caller as usize));
            let line = format_event(&slot, timestamp, &caller_name, entry, &mut self.lock_paths);

            for sub in self.subscribers.iter_mut() {
                if !subscriber_matches(sub, &slot, &caller_name, entry) {
                    continue;
                }
                if sub.sink.send_line(&line).is_err() {
                    broken.push(sub.id);
                }
            }

            self.ring.release(index);
            self.anchor.events_consumed.fetch_add(1, Ordering::AcqRel);
            drained += 1;
        }

        let overflow = self.ring.take_overflow::<G>();
        if overflow > 0 {
            let drop_line = format!("#\t{timestamp}\toverflow\t-\t{overflow}\t-\t-");
            for sub in self.subscribers.iter_mut() {
                if sub.sink.send_line(&drop_line).is_err() && !broken.contains(&sub.id) {
                    broken.push(sub.id);
                }
            }
        }

        drop(guard);

        for id in broken {
            if let Some(sub) = self.subscribers.remove(id) {
                self.teardown(sub);
            }
        }

        PollOutcome::Drained(drained)
    }

    /// Tear down a subscriber's trace state (spec.md §5 "Subscriber STOP …
    /// consumer emits end-of-stream and clears trace state"; §4.5.3 step 6
    /// "emit an end-of-run marker, end-of-stream frame, and tear down").
    /// Run-mode subscribers first get one last look at whatever matching
    /// events are already sitting valid in the ring (without consuming them —
    /// the next regular poll still owns draining the ring for every other
    /// subscriber), then an end-of-run marker, then every subscriber gets an
    /// end-of-stream frame before its noise-function/`filter_task` claim (if
    /// any) is released.
    fn teardown(&mut self, mut sub: Subscriber<S>) {
        if let Mode::Run { task, .. } = sub.mode {
            self.final_run_drain(&mut sub);
            let _ = sub.sink.send_line("#\tend-of-run");
            self.end_run(task);
        }
        let _ = sub.sink.send_end_of_stream();
    }

    /// Read-only scan of every currently-valid ring slot matching `sub`'s run
    /// identity and filter, sent to `sub` alone. Doesn't advance `read_pos` or
    /// clear `valid` — ownership of actually consuming the ring stays with
    /// the regular poll loop, which still has to serve every other
    /// subscriber on its own next tick.
    fn final_run_drain(&mut self, sub: &mut Subscriber<S>) {
        let timestamp = (self.clock)();
        let mut index = self.ring.read_pos();
        let write_pos = self.ring.write_pos();
        while index != write_pos {
            let slot = self.ring.peek(index);
            if !slot.is_valid() {
                break;
            }
            let entry = function_table::find_by_lvo(slot.lib_id, slot.lvo);
            let caller_name = self.caller_cache.resolve(CallerId(slot.caller as usize));
            if subscriber_matches(sub, &slot, &caller_name, entry) {
                let line = format_event(&slot, timestamp, &caller_name, entry, &mut self.lock_paths);
                let _ = sub.sink.send_line(&line);
            }
            index = index.wrapping_add(1);
        }
    }

    /// Explicit removal path for STOP / disconnect, used by the control
    /// layer rather than a `Drop` guard (spec.md §4.5.3 step 8).
    pub fn remove_subscriber(&mut self, id: SubscriberId) {
        if let Some(sub) = self.subscribers.remove(id) {
            self.teardown(sub);
        }
    }

    /// Claim (or fall back to local-only filtering on) a "run" trace
    /// (spec.md §4.5.3 steps 3 and 7). Returns the mode the caller's new
    /// subscriber should use.
    pub fn begin_run(&mut self, task: CallerId) -> Mode {
        if self.anchor.filter_task().is_some() || self.active_run.is_some() {
            // Someone else already owns filter_task: fall back to
            // consumer-side filtering only, no noise auto-enable.
            let run_start_sequence = self.anchor.event_sequence.load(Ordering::Acquire);
            return Mode::Run { task, run_start_sequence };
        }

        let saved_noise_state: Vec<(usize, bool)> = function_table::TABLE
            .iter()
            .enumerate()
            .filter(|(_, e)| e.noise)
            .map(|(i, _)| (i, self.patches[i].is_enabled()))
            .collect();
        for (i, _) in &saved_noise_state {
            self.patches[*i].set_enabled(true);
        }
        self.anchor.set_filter_task(Some(task));
        let run_start_sequence = self.anchor.event_sequence.load(Ordering::Acquire);
        self.active_run = Some(RunClaim { task, saved_noise_state });
        Mode::Run { task, run_start_sequence }
    }

    /// Restore noise-function enable state and release `filter_task`
    /// (spec.md §4.5.3 step 6). A no-op if `task` isn't the current claim
    /// holder (e.g. a subscriber that fell back under step 7).
    pub fn end_run(&mut self, task: CallerId) {
        let Some(claim) = &self.active_run else { return };
        if claim.task != task {
            return;
        }
        let claim = self.active_run.take().expect("checked Some above");
        for (i, was_enabled) in claim.saved_noise_state {
            self.patches[i].set_enabled(was_enabled);
        }
        self.anchor.set_filter_task(None);
    }
}

fn subscriber_matches<S: LineSink>(
    sub: &Subscriber<S>,
    slot: &atrace_common::EventSlot,
    caller_name: &str,
    entry: Option<&FunctionTableEntry>,
) -> bool {
    if !sub.filter.matches(slot, caller_name, entry) {
        return false;
    }
    match sub.mode {
        Mode::FreeSubscribe => true,
        Mode::Run { task, run_start_sequence } => {
            slot.caller as usize == task.0 && slot.sequence >= run_start_sequence
        }
    }
}

/// Snapshot used by `ControlApi::status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub globally_enabled: bool,
    pub overflow: u32,
    pub events_consumed: u32,
    pub subscriber_count: usize,
}

/// In-process seam standing in for the subscriber control wire protocol
/// (spec.md §6 "Consumer control"), which is explicitly out of scope for
/// this crate: `atraced` implements this over whatever transport (socket,
/// pipe, in-process channel) it chooses.
pub trait ControlApi {
    type Error;

    fn status(&mut self) -> Result<StatusReport, Self::Error>;
    fn start(&mut self, filter: Filter) -> Result<SubscriberId, Self::Error>;
    fn run(&mut self, filter: Filter, task: CallerId) -> Result<SubscriberId, Self::Error>;
    fn stop(&mut self, id: SubscriberId) -> Result<(), Self::Error>;
    fn enable(&mut self, names: Vec<String>) -> Result<(), Self::Error>;
    fn disable(&mut self, names: Vec<String>) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrace_common::{Anchor, PatchDescriptor, StringArgs};
    use atrace_platform::sim::{SimCurrentTask, SimInterruptGuard, SimNamedLock};
    use std::sync::atomic::AtomicU32;

    struct RecordingSink {
        lines: Vec<String>,
        end_of_stream: bool,
    }

    impl LineSink for RecordingSink {
        type Error = ();
        fn send_line(&mut self, line: &str) -> Result<(), ()> {
            self.lines.push(line.to_string());
            Ok(())
        }
        fn send_end_of_stream(&mut self) -> Result<(), ()> {
            self.end_of_stream = true;
            Ok(())
        }
    }

    struct FailingSink;

    impl LineSink for FailingSink {
        type Error = ();
        fn send_line(&mut self, _line: &str) -> Result<(), ()> {
            Err(())
        }
        fn send_end_of_stream(&mut self) -> Result<(), ()> {
            Err(())
        }
    }

    fn fresh_patches() -> Box<[PatchDescriptor]> {
        function_table::TABLE
            .iter()
            .map(|e| PatchDescriptor {
                lib_id: e.lib_id,
                lvo: e.lvo,
                func_id: 0,
                arg_count: e.arg_count,
                enabled: AtomicU32::new(!e.noise as u32),
                use_count: AtomicU32::new(0),
                original: atrace_common::FuncPtr::NULL,
                stub_addr: 0,
                stub_size: 0,
                arg_regs: e.arg_regs,
                string_args: StringArgs(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice()
    }

    fn fixed_clock() -> u64 {
        42
    }

    fn attach_fixture(
        name: &str,
    ) -> (Anchor, Box<[PatchDescriptor]>, Arc<Ring>) {
        let ring = Arc::new(Ring::new(64).unwrap());
        let mut anchor = Anchor::new(function_table::TABLE.len() as u16, 0);
        anchor.set_ring(Arc::as_ptr(&ring) as usize);
        // Registering (rather than attaching) publishes the name; the
        // returned handle is dropped here, which is harmless since
        // `SimNamedLock` only removes the registry entry via the explicit
        // `unregister` call, never on drop.
        let _ = SimNamedLock::register(name, 0x1234).unwrap();
        (anchor, fresh_patches(), ring)
    }

    #[test]
    fn free_subscribe_receives_a_matching_event() {
        let (anchor, patches, ring) = attach_fixture("consumer_test_free");
        let mut consumer = Consumer::<SimNamedLock, SimInterruptGuard, SimCurrentTask, _>::attach(
            &anchor,
            &patches,
            ring.clone(),
            "consumer_test_free",
        )
        .unwrap()
        .with_clock(fixed_clock);

        consumer
            .subscribers_mut()
            .register(Filter::any(), Mode::FreeSubscribe, RecordingSink { lines: vec![], end_of_stream: false });

        let mut reserved = ring.reserve::<SimInterruptGuard>().unwrap();
        reserved.slot_mut().lib_id = function_table::LIB_EXEC;
        reserved.slot_mut().lvo = -552;
        reserved.slot_mut().retval = 0x8000;
        reserved.commit(0);

        let outcome = consumer.poll_once();
        assert!(matches!(outcome, PollOutcome::Drained(1)));
    }

    #[test]
    fn skips_the_poll_while_reconfiguring() {
        let (anchor, patches, ring) = attach_fixture("consumer_test_skip");
        let mut consumer = Consumer::<SimNamedLock, SimInterruptGuard, SimCurrentTask, RecordingSink>::attach(
            &anchor,
            &patches,
            ring,
            "consumer_test_skip",
        )
        .unwrap()
        .with_clock(fixed_clock);

        let exclusive = SimNamedLock::attach("consumer_test_skip").unwrap();
        let _held = exclusive.try_exclusive().unwrap();
        assert!(matches!(consumer.poll_once(), PollOutcome::SkippedReconfiguring));
    }

    #[test]
    fn shutdown_sends_a_terminal_line_to_every_subscriber() {
        let (anchor, patches, ring) = attach_fixture("consumer_test_shutdown");
        let mut consumer = Consumer::<SimNamedLock, SimInterruptGuard, SimCurrentTask, _>::attach(
            &anchor,
            &patches,
            ring,
            "consumer_test_shutdown",
        )
        .unwrap()
        .with_clock(fixed_clock);

        consumer
            .subscribers_mut()
            .register(Filter::any(), Mode::FreeSubscribe, RecordingSink { lines: vec![], end_of_stream: false });

        anchor.set_global_enable(false);
        let exclusive = SimNamedLock::attach("consumer_test_shutdown").unwrap();
        let _held = exclusive.try_exclusive().unwrap();

        assert!(matches!(consumer.poll_once(), PollOutcome::ShutDown));
        assert!(consumer.is_shut_down());
    }

    #[test]
    fn broken_subscriber_write_triggers_teardown_and_removal() {
        let (anchor, patches, ring) = attach_fixture("consumer_test_broken");
        let mut consumer = Consumer::<SimNamedLock, SimInterruptGuard, SimCurrentTask, _>::attach(
            &anchor,
            &patches,
            ring.clone(),
            "consumer_test_broken",
        )
        .unwrap()
        .with_clock(fixed_clock);

        let id = consumer
            .subscribers_mut()
            .register(Filter::any(), Mode::FreeSubscribe, FailingSink);

        ring.reserve::<SimInterruptGuard>().unwrap().commit(0);
        let _ = consumer.poll_once();
        assert!(consumer.subscribers().iter().all(|s| s.id != id));
    }

    #[test]
    fn begin_run_claims_filter_task_and_enables_noise_functions() {
        let (anchor, patches, ring) = attach_fixture("consumer_test_run");
        let mut consumer = Consumer::<SimNamedLock, SimInterruptGuard, SimCurrentTask, RecordingSink>::attach(
            &anchor,
            &patches,
            ring,
            "consumer_test_run",
        )
        .unwrap();

        let noise_index = function_table::TABLE.iter().position(|e| e.noise).unwrap();
        assert!(!patches[noise_index].is_enabled());

        let task = CallerId(0x7777);
        let mode = consumer.begin_run(task);
        assert!(matches!(mode, Mode::Run { task: t, .. } if t == task));
        assert!(patches[noise_index].is_enabled());
        assert_eq!(anchor.filter_task(), Some(task));

        consumer.end_run(task);
        assert!(!patches[noise_index].is_enabled());
        assert_eq!(anchor.filter_task(), None);
    }

    #[test]
    fn set_patch_enabled_by_name_and_status_report_reflect_each_other() {
        let (anchor, patches, ring) = attach_fixture("consumer_test_enable_by_name");
        let consumer = Consumer::<SimNamedLock, SimInterruptGuard, SimCurrentTask, RecordingSink>::attach(
            &anchor,
            &patches,
            ring,
            "consumer_test_enable_by_name",
        )
        .unwrap();

        assert!(consumer.set_patch_enabled("OpenLibrary", false));
        assert!(!consumer.set_patch_enabled("NoSuchFunction", false));
        let (i, _) = function_table::find_by_func_name("OpenLibrary").unwrap();
        assert!(!patches[i].is_enabled());

        consumer.set_global_enable(false);
        assert!(!consumer.status_report().globally_enabled);
    }

    #[test]
    fn control_error_wire_tags_are_stable() {
        assert_eq!(ControlError::Syntax("x".into()).wire_tag(), 0);
        assert_eq!(ControlError::NotFound("x".into()).wire_tag(), 1);
        assert_eq!(ControlError::InUse.wire_tag(), 2);
        assert_eq!(ControlError::Internal("x".into()).wire_tag(), 3);
        assert_eq!(ControlError::Timeout.wire_tag(), 4);
    }

    #[test]
    fn second_run_falls_back_to_local_filtering_without_touching_noise() {
        let (anchor, patches, ring) = attach_fixture("consumer_test_run_fallback");
        let mut consumer = Consumer::<SimNamedLock, SimInterruptGuard, SimCurrentTask, RecordingSink>::attach(
            &anchor,
            &patches,
            ring,
            "consumer_test_run_fallback",
        )
        .unwrap();

        let first = CallerId(0x1111);
        let second = CallerId(0x2222);
        consumer.begin_run(first);
        let noise_index = function_table::TABLE.iter().position(|e| e.noise).unwrap();
        let noise_state_after_first_claim = patches[noise_index].is_enabled();

        let mode = consumer.begin_run(second);
        assert!(matches!(mode, Mode::Run { task, .. } if task == second));
        // Noise state untouched by the fallback claim.
        assert_eq!(patches[noise_index].is_enabled(), noise_state_after_first_claim);
        assert_eq!(anchor.filter_task(), Some(first));
    }

    /// A sink that records into shared state, so a test can inspect what it
    /// received after the `Subscriber` owning it has been consumed by
    /// `teardown`.
    #[derive(Clone)]
    struct HandleSink(std::rc::Rc<std::cell::RefCell<(Vec<String>, bool)>>);

    impl HandleSink {
        fn new() -> Self {
            Self(std::rc::Rc::new(std::cell::RefCell::new((Vec::new(), false))))
        }
        fn lines(&self) -> Vec<String> {
            self.0.borrow().0.clone()
        }
        fn got_end_of_stream(&self) -> bool {
            self.0.borrow().1
        }
    }

    impl LineSink for HandleSink {
        type Error = ();
        fn send_line(&mut self, line: &str) -> Result<(), ()> {
            self.0.borrow_mut().0.push(line.to_string());
            Ok(())
        }
        fn send_end_of_stream(&mut self) -> Result<(), ()> {
            self.0.borrow_mut().1 = true;
            Ok(())
        }
    }

    #[test]
    fn remove_subscriber_sends_end_of_stream() {
        let (anchor, patches, ring) = attach_fixture("consumer_test_stop");
        let mut consumer = Consumer::<SimNamedLock, SimInterruptGuard, SimCurrentTask, HandleSink>::attach(
            &anchor,
            &patches,
            ring,
            "consumer_test_stop",
        )
        .unwrap();

        let handle = HandleSink::new();
        let id = consumer
            .subscribers_mut()
            .register(Filter::any(), Mode::FreeSubscribe, handle.clone());

        assert!(!handle.got_end_of_stream());
        consumer.remove_subscriber(id);
        assert!(handle.got_end_of_stream());
        assert!(consumer.subscribers().iter().all(|s| s.id != id));
    }

    #[test]
    fn run_teardown_emits_end_of_run_marker_and_end_of_stream() {
        let (anchor, patches, ring) = attach_fixture("consumer_test_run_teardown");
        let mut consumer = Consumer::<SimNamedLock, SimInterruptGuard, SimCurrentTask, HandleSink>::attach(
            &anchor,
            &patches,
            ring.clone(),
            "consumer_test_run_teardown",
        )
        .unwrap()
        .with_clock(fixed_clock);

        let task = CallerId(0x9999);
        let mode = consumer.begin_run(task);
        let run_start_sequence = match mode {
            Mode::Run { run_start_sequence, .. } => run_start_sequence,
            _ => unreachable!(),
        };

        // An event from the traced task, already valid in the ring but not
        // yet drained by a regular poll — the run-exit teardown should still
        // surface it via the final read-only scan.
        let mut reserved = ring.reserve::<SimInterruptGuard>().unwrap();
        reserved.slot_mut().lib_id = function_table::LIB_EXEC;
        reserved.slot_mut().lvo = -552;
        reserved.slot_mut().caller = task.0 as u32;
        reserved.commit(run_start_sequence);

        let handle = HandleSink::new();
        let id = consumer.subscribers_mut().register(
            Filter::any(),
            Mode::Run { task, run_start_sequence },
            handle.clone(),
        );

        consumer.remove_subscriber(id);

        let lines = handle.lines();
        assert!(lines.iter().any(|l| l.contains("OpenLibrary")));
        assert_eq!(lines.last().map(String::as_str), Some("#\tend-of-run"));
        assert!(handle.got_end_of_stream());

        let noise_index = function_table::TABLE.iter().position(|e| e.noise).unwrap();
        assert!(!patches[noise_index].is_enabled());
        assert_eq!(anchor.filter_task(), None);

        // The event itself is still sitting valid in the ring: the final
        // scan is read-only and leaves draining to the regular poll loop.
        assert!(ring.peek(ring.read_pos()).is_valid());
    }
}
