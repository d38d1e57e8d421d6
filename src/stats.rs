//! Counter sink.
//!
//! The file writer increments named counters but does not own them; a Scope
//! supplied at construction hands out the counter handles. IsolatedScope is
//! the in-memory implementation used by the proxy's isolated stats domains
//! and by the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Shared handle to a single monotonically increasing counter. Cloning the
/// handle aliases the underlying value.
#[derive(Clone)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Counter {
        Counter(Arc::new(AtomicU64::new(0)))
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Source of named counters. Requesting the same name twice must return
/// handles to the same underlying counter.
pub trait Scope: Send + Sync {
    fn counter(&self, name: &str) -> Counter;
}

/// Standalone scope backed by a name-to-counter map.
pub struct IsolatedScope {
    counters: Mutex<HashMap<String, Counter>>,
}

impl IsolatedScope {
    pub fn new() -> IsolatedScope {
        IsolatedScope {
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl Scope for IsolatedScope {
    fn counter(&self, name: &str) -> Counter {
        let mut counters = self.counters.lock().unwrap(); // Panic if lock fails
        counters
            .entry(name.to_string())
            .or_insert_with(Counter::new)
            .clone()
    }
}
