//! Lock-to-path cache (spec.md §4.5.2): maps an opaque resource handle
//! returned by a lock-like function (`Open`, `Lock`) to the path string that
//! was captured when the handle was created, so later events that consume
//! the handle (`Close`, `UnLock`, `Read`, `Write`) can display something
//! readable instead of a bare address. FIFO, 32 entries, cleared at session
//! start (i.e. on construction).

use std::collections::{HashMap, VecDeque};

pub const CAPACITY: usize = 32;

#[derive(Default)]
pub struct LockPathCache {
    order: VecDeque<u32>,
    paths: HashMap<u32, String>,
}

impl LockPathCache {
    pub fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(CAPACITY),
            paths: HashMap::with_capacity(CAPACITY),
        }
    }

    pub fn insert(&mut self, handle: u32, path: String) {
        if self.paths.insert(handle, path).is_none() {
            if self.order.len() >= CAPACITY {
                if let Some(oldest) = self.order.pop_front() {
                    self.paths.remove(&oldest);
                }
            }
            self.order.push_back(handle);
        }
    }

    pub fn get(&self, handle: u32) -> Option<&str> {
        self.paths.get(&handle).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_handle() {
        let mut cache = LockPathCache::new();
        cache.insert(0x100, "dh0:work/file.txt".to_string());
        assert_eq!(cache.get(0x100), Some("dh0:work/file.txt"));
        assert_eq!(cache.get(0x200), None);
    }

    #[test]
    fn evicts_oldest_entry_past_capacity() {
        let mut cache = LockPathCache::new();
        for i in 0..(CAPACITY as u32 + 1) {
            cache.insert(i, format!("path-{i}"));
        }
        assert_eq!(cache.get(0), None);
        assert_eq!(cache.get(CAPACITY as u32), Some("path-32"));
    }
}
