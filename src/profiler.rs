//! Invocation profiler. Every call to a bytecode method bumps a counter
//! keyed by the method's identity; once a counter reaches the threshold the
//! method is considered hot and gets compiled.
use std::collections::HashMap;

use crate::program::MethodKey;

#[derive(Debug)]
pub struct Profiler {
    // Invocations before a method is considered hot.
    threshold: u64,
    // Invocation counts per method.
    records: HashMap<MethodKey, u64>,
}

impl Profiler {
    pub fn new(threshold: u64) -> Profiler {
        Profiler {
            threshold,
            records: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Counts one invocation and returns the updated count.
    pub fn count_invocation(&mut self, key: &MethodKey) -> u64 {
        match self.records.get_mut(key) {
            Some(record) => {
                *record += 1;
                *record
            }
            None => {
                self.records.insert(key.clone(), 1);
                1
            }
        }
    }

    pub fn count(&self, key: &MethodKey) -> u64 {
        self.records.get(key).copied().unwrap_or(0)
    }

    pub fn is_hot(&self, key: &MethodKey) -> bool {
        self.count(key) >= self.threshold
    }

    /// Drops the counters of every method of `class`.
    pub fn forget_class(&mut self, class: &str) {
        self.records.retain(|key, _| key.class != class);
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new(10)
    }
}
