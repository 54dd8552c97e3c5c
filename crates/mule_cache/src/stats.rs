use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, PoisonError,
};

use serde::{Deserialize, Serialize};

/// A monotonic, thread-safe counter.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Request counters for one cache instance.
///
/// `hits` counts records already ready at request time, `misses` new records
/// whose download this caller initiated, `near_misses` requests coalesced
/// onto another caller's download, `failures` requests that terminated in a
/// failed record, and `duplicates` puts of names already cached.
#[derive(Debug)]
pub(crate) struct Statistics {
    since: Mutex<String>,
    pub gets: Counter,
    pub puts: Counter,
    pub hits: Counter,
    pub misses: Counter,
    pub near_misses: Counter,
    pub failures: Counter,
    pub duplicates: Counter,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            since: Mutex::new(timestamp()),
            gets: Counter::default(),
            puts: Counter::default(),
            hits: Counter::default(),
            misses: Counter::default(),
            near_misses: Counter::default(),
            failures: Counter::default(),
            duplicates: Counter::default(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            since: self
                .since
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            gets: self.gets.value(),
            puts: self.puts.value(),
            hits: self.hits.value(),
            misses: self.misses.value(),
            near_misses: self.near_misses.value(),
            failures: self.failures.value(),
            duplicates: self.duplicates.value(),
        }
    }

    /// Zero every counter and restart the observation window.
    pub fn reset(&self) {
        for counter in [
            &self.gets,
            &self.puts,
            &self.hits,
            &self.misses,
            &self.near_misses,
            &self.failures,
            &self.duplicates,
        ] {
            counter.reset();
        }
        *self.since.lock().unwrap_or_else(PoisonError::into_inner) = timestamp();
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%a %b %e %H:%M:%S %Y").to_string()
}

/// A point-in-time copy of the statistics, as returned by the `stats` RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub since: String,
    pub gets: u64,
    pub puts: u64,
    pub hits: u64,
    pub misses: u64,
    pub near_misses: u64,
    pub failures: u64,
    pub duplicates: u64,
}
