//! Caller-name cache (spec.md §4.5.1): a bounded table refreshed every N
//! polls by walking the OS's ready/waiting task lists, with a one-shot
//! fallback read on a miss. Grounded on the cache-with-refresh-tick shape of
//! the teacher's lineage cache referenced from `stream_listener.rs` —
//! bounded, periodically refreshed, with a documented fallback path.

use std::collections::HashMap;
use std::marker::PhantomData;

use atrace_common::CallerId;
use atrace_platform::CurrentTask;

/// 64 entries, refreshed roughly every 50 polls (~5s at a 20ms tick).
pub const CACHE_CAPACITY: usize = 64;
pub const REFRESH_EVERY_N_POLLS: u32 = 50;

pub struct CallerNameCache<T> {
    entries: HashMap<CallerId, String>,
    polls_since_refresh: u32,
    _task: PhantomData<T>,
}

impl<T: CurrentTask> CallerNameCache<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(CACHE_CAPACITY),
            polls_since_refresh: 0,
            _task: PhantomData,
        }
    }

    /// Call once per poll tick; refreshes the whole table every N ticks.
    pub fn tick(&mut self) {
        self.polls_since_refresh += 1;
        if self.polls_since_refresh >= REFRESH_EVERY_N_POLLS {
            self.refresh();
            self.polls_since_refresh = 0;
        }
    }

    fn refresh(&mut self) {
        self.entries.clear();
        for id in T::ready_and_waiting().into_iter().take(CACHE_CAPACITY) {
            if let Some(name) = T::name_of(id) {
                self.entries.insert(id, name);
            }
        }
    }

    /// Resolve a caller id to a display name, falling back to a one-shot
    /// lookup (and caching the result) on a miss.
    pub fn resolve(&mut self, id: CallerId) -> String {
        if let Some(name) = self.entries.get(&id) {
            return name.clone();
        }
        let name = T::name_of(id).unwrap_or_else(|| format!("0x{:x}", id.0));
        if self.entries.len() < CACHE_CAPACITY {
            self.entries.insert(id, name.clone());
        }
        name
    }
}

impl<T: CurrentTask> Default for CallerNameCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrace_platform::sim::{self, SimCurrentTask};

    #[test]
    fn miss_falls_back_to_one_shot_lookup_and_caches_it() {
        let id = CallerId(0x4242);
        sim::name_task(id, "shell");
        let mut cache = CallerNameCache::<SimCurrentTask>::new();
        assert_eq!(cache.resolve(id), "shell");
    }

    #[test]
    fn refresh_populates_from_ready_and_waiting() {
        let id = CallerId(0x5252);
        sim::name_task(id, "editor");
        let mut cache = CallerNameCache::<SimCurrentTask>::new();
        for _ in 0..REFRESH_EVERY_N_POLLS {
            cache.tick();
        }
        assert_eq!(cache.resolve(id), "editor");
    }

    #[test]
    fn unknown_caller_falls_back_to_a_hex_address() {
        let mut cache = CallerNameCache::<SimCurrentTask>::new();
        assert_eq!(cache.resolve(CallerId(0xabcd)), "0xabcd");
    }
}
