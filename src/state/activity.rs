//! Per-transfer activity counters
//!
//! Every read and write through a handle bumps the counter of its transfer
//! base. An external reaper can poll [`ActivityMonitor::snapshot`] to find
//! idle transfers; no idle policy lives here.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Activity on one transfer base
#[derive(Debug)]
pub struct ActivityCounter {
    /// Transfer base, `/{project}/{user}`
    key: String,
    count: AtomicU64,
    /// Count seen at the last observation, and when it last moved
    seen: Mutex<(u64, Instant)>,
}

impl ActivityCounter {
    fn new(key: &str) -> Self {
        ActivityCounter {
            key: key.to_string(),
            count: AtomicU64::new(0),
            seen: Mutex::new((0, Instant::now())),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Record the current count; moves `last_changed` forward if the count
    /// grew since the previous observation.
    pub fn observe(&self) -> u64 {
        let current = self.count();
        let mut seen = self.seen.lock();
        if current != seen.0 {
            *seen = (current, Instant::now());
        }
        current
    }

    /// When the count was last observed to change
    pub fn last_changed(&self) -> Instant {
        self.seen.lock().1
    }

    /// Time since the count was last observed to change
    pub fn idle_for(&self) -> Duration {
        self.observe();
        self.last_changed().elapsed()
    }
}

/// Point-in-time view of one counter
#[derive(Debug, Clone)]
pub struct ActivitySnapshot {
    pub transfer_base: String,
    pub count: u64,
    pub idle_for: Duration,
}

/// Registry of activity counters keyed by transfer base
#[derive(Debug, Default)]
pub struct ActivityMonitor {
    counters: RwLock<HashMap<String, Arc<ActivityCounter>>>,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `transfer_base`, created on first use
    pub fn get_or_create(&self, transfer_base: &str) -> Arc<ActivityCounter> {
        if let Some(counter) = self.counters.read().get(transfer_base) {
            return Arc::clone(counter);
        }

        let mut counters = self.counters.write();
        Arc::clone(
            counters
                .entry(transfer_base.to_string())
                .or_insert_with(|| Arc::new(ActivityCounter::new(transfer_base))),
        )
    }

    pub fn get(&self, transfer_base: &str) -> Option<Arc<ActivityCounter>> {
        self.counters.read().get(transfer_base).cloned()
    }

    /// Observe every counter
    pub fn snapshot(&self) -> Vec<ActivitySnapshot> {
        let counters: Vec<Arc<ActivityCounter>> = self.counters.read().values().cloned().collect();
        let mut snapshots: Vec<ActivitySnapshot> = counters
            .iter()
            .map(|c| ActivitySnapshot {
                transfer_base: c.key().to_string(),
                idle_for: c.idle_for(),
                count: c.count(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.transfer_base.cmp(&b.transfer_base));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_get_or_create_shares_counter() {
        let monitor = ActivityMonitor::new();
        let a = monitor.get_or_create("/1/2");
        let b = monitor.get_or_create("/1/2");
        a.increment();
        b.increment();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(monitor.get("/1/2").unwrap().count(), 2);
        assert!(monitor.get("/1/3").is_none());
        assert_eq!(monitor.len(), 1);
    }

    #[test]
    fn test_concurrent_increments() {
        let monitor = Arc::new(ActivityMonitor::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        monitor.get_or_create("/5/6").increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(monitor.get("/5/6").unwrap().count(), 8000);
    }

    #[test]
    fn test_observe_moves_last_changed() {
        let monitor = ActivityMonitor::new();
        let counter = monitor.get_or_create("/1/1");
        let before = counter.last_changed();
        thread::sleep(Duration::from_millis(5));

        counter.observe();
        assert_eq!(counter.last_changed(), before);

        counter.increment();
        counter.observe();
        assert!(counter.last_changed() > before);

        let snap = monitor.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].count, 1);
    }
}
