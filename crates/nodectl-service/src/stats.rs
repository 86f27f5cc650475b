//! Process-wide traffic counter store.
//!
//! Counters are named, shared by `Arc` between the engine's accounting path
//! and any number of readers, and only ever go down through an explicit
//! `set`. Names for per-user traffic follow
//! `user>>>{email}>>>traffic>>>{uplink|downlink}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::ServiceError;
use crate::types::Direction;

/// Builds the counter name for a user's traffic in one direction.
pub fn traffic_counter_name(email: &str, direction: Direction) -> String {
    format!("user>>>{email}>>>traffic>>>{}", direction.as_str())
}

/// A settable, incrementable 64-bit accumulator.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Stores `value` and returns the previous value.
    pub fn set(&self, value: i64) -> i64 {
        self.value.swap(value, Ordering::AcqRel)
    }

    /// Adds `delta` and returns the new value.
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::AcqRel) + delta
    }
}

/// Thread-safe registry of named counters.
pub struct StatsManager {
    counters: DashMap<String, Arc<Counter>>,
}

impl Default for StatsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsManager {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Registers a new counter. Fails if the name is taken.
    pub fn register_counter(&self, name: &str) -> Result<Arc<Counter>, ServiceError> {
        match self.counters.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(ServiceError::Conflict(format!(
                "counter '{name}' already registered"
            ))),
            Entry::Vacant(slot) => {
                let counter = Arc::new(Counter::new());
                slot.insert(Arc::clone(&counter));
                Ok(counter)
            }
        }
    }

    /// Returns the counter with this name, creating it if needed.
    pub fn get_or_register_counter(&self, name: &str) -> Arc<Counter> {
        if let Some(existing) = self.counters.get(name) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.counters
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Counter::new()))
                .value(),
        )
    }

    pub fn get_counter(&self, name: &str) -> Option<Arc<Counter>> {
        self.counters.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Removes a counter. Handles already held by readers stay usable but
    /// are no longer reachable by name. Returns whether it existed.
    pub fn unregister_counter(&self, name: &str) -> bool {
        self.counters.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
