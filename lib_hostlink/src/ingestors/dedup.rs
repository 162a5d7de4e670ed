//! # Dedup Window
//!
//! Remembers the most recent `capacity` dedup keys. When full, the oldest key
//! is evicted first. Eviction is driven by size only; a key stays for as long
//! as fewer than `capacity` newer keys have been inserted.

use std::collections::{HashSet, VecDeque};

/// Default number of keys remembered.
pub const DEFAULT_DEDUP_CAPACITY: usize = 5000;

/// Bounded FIFO set of recently seen keys.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl DedupWindow {
    /// Creates an empty window. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// True if `key` is currently remembered.
    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    /// Remembers `key`. Returns false, changing nothing, when it is already
    /// present.
    pub fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.to_string());
        self.seen.insert(key.to_string());
        true
    }

    /// Keys currently remembered.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing has been inserted yet.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of keys remembered.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
