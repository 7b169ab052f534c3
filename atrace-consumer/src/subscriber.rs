//! Subscriber registry (spec.md §4.5): independent filter state per
//! subscriber, plus the free-subscribe / run mode split. Teardown is an
//! explicit method call driven by the poll loop or the control layer, rather
//! than a `Drop` guard — the wire-facing half of a subscriber (its send
//! channel) outlives this registry entry in the real daemon, so there is no
//! single owning scope whose `Drop` could run it.

use atrace_common::CallerId;

use crate::filter::Filter;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Filters chosen freely, tracing whatever the filter matches.
    FreeSubscribe,
    /// This subscriber launched a program under trace and (if it won the
    /// claim) owns the anchor-wide `filter_task`.
    Run {
        task: CallerId,
        run_start_sequence: u32,
    },
}

/// Sink for formatted lines, one per subscriber. The real implementation is
/// whatever framed transport the daemon's control layer uses; this crate
/// only needs to know a line can be sent and can fail.
pub trait LineSink {
    type Error;
    fn send_line(&mut self, line: &str) -> Result<(), Self::Error>;
    fn send_end_of_stream(&mut self) -> Result<(), Self::Error>;
}

pub struct Subscriber<S: LineSink> {
    pub id: SubscriberId,
    pub filter: Filter,
    pub mode: Mode,
    pub sink: S,
}

#[derive(Default)]
pub struct SubscriberRegistry<S: LineSink> {
    next_id: u64,
    subscribers: Vec<Subscriber<S>>,
}

impl<S: LineSink> SubscriberRegistry<S> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn register(&mut self, filter: Filter, mode: Mode, sink: S) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, filter, mode, sink });
        id
    }

    /// Remove and return a subscriber so the caller can run its teardown
    /// (run-mode noise restore, `filter_task` release). Returns `None` if
    /// `id` is already gone — removal is idempotent.
    pub fn remove(&mut self, id: SubscriberId) -> Option<Subscriber<S>> {
        let position = self.subscribers.iter().position(|s| s.id == id)?;
        Some(self.subscribers.remove(position))
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subscriber<S>> {
        self.subscribers.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscriber<S>> {
        self.subscribers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        lines: Vec<String>,
        fail: bool,
    }

    impl LineSink for RecordingSink {
        type Error = ();
        fn send_line(&mut self, line: &str) -> Result<(), ()> {
            if self.fail {
                return Err(());
            }
            self.lines.push(line.to_string());
            Ok(())
        }
        fn send_end_of_stream(&mut self) -> Result<(), ()> {
            if self.fail {
                Err(())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn register_then_remove_round_trips() {
        let mut registry = SubscriberRegistry::new();
        let id = registry.register(
            Filter::any(),
            Mode::FreeSubscribe,
            RecordingSink { lines: vec![], fail: false },
        );
        assert_eq!(registry.len(), 1);
        let removed = registry.remove(id).expect("present");
        assert_eq!(removed.id, id);
        assert_eq!(registry.len(), 0);
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn ids_are_assigned_in_increasing_order() {
        let mut registry = SubscriberRegistry::new();
        let a = registry.register(Filter::any(), Mode::FreeSubscribe, RecordingSink { lines: vec![], fail: false });
        let b = registry.register(Filter::any(), Mode::FreeSubscribe, RecordingSink { lines: vec![], fail: false });
        assert!(a.0 < b.0);
    }
}
