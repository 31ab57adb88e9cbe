//! Bounded, insertion-ordered store of recent readings.
//!
//! Appends evict the oldest entry once capacity is reached. Readers take a
//! snapshot under a short read lock, so a reading is either fully visible or
//! not visible at all.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::reading::Reading;

/// Number of readings retained when no capacity is configured.
pub const DEFAULT_CAPACITY: usize = 1000;

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct History {
    entries: Arc<RwLock<VecDeque<Arc<Reading>>>>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Store a reading, evicting the oldest entry if the buffer is full.
    pub fn append(&self, reading: Reading) -> Arc<Reading> {
        let reading = Arc::new(reading);
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(Arc::clone(&reading));
        reading
    }

    pub fn latest(&self) -> Option<Arc<Reading>> {
        self.entries.read().back().cloned()
    }

    /// Readings captured within the last `span`, oldest first.
    pub fn window(&self, span: Duration) -> Window {
        let cutoff = Instant::now().checked_sub(span);
        let entries = self.entries.read();
        let readings = entries
            .iter()
            .filter(|r| cutoff.map_or(true, |c| r.captured() >= c))
            .cloned()
            .collect();
        Window { readings }
    }

    /// Drop every reading whose wall-clock timestamp is older than `cutoff`.
    /// Returns how many were removed.
    pub fn purge_before(&self, cutoff: OffsetDateTime) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|r| r.timestamp() >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Window snapshot
// ---------------------------------------------------------------------------

/// A consistent snapshot of part of the history. Iterating does not consume
/// it, so the same window can be walked as many times as needed.
#[derive(Debug, Clone, Default)]
pub struct Window {
    readings: Vec<Arc<Reading>>,
}

impl Window {
    pub fn iter(&self) -> impl Iterator<Item = &Reading> + '_ {
        self.readings.iter().map(|r| r.as_ref())
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn first(&self) -> Option<&Reading> {
        self.readings.first().map(|r| r.as_ref())
    }

    pub fn last(&self) -> Option<&Reading> {
        self.readings.last().map(|r| r.as_ref())
    }
}

impl<'a> IntoIterator for &'a Window {
    type Item = &'a Reading;
    type IntoIter =
        std::iter::Map<std::slice::Iter<'a, Arc<Reading>>, fn(&'a Arc<Reading>) -> &'a Reading>;

    fn into_iter(self) -> Self::IntoIter {
        fn as_reading(r: &Arc<Reading>) -> &Reading {
            r
        }
        self.readings
            .iter()
            .map(as_reading as fn(&'a Arc<Reading>) -> &'a Reading)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Measurements;

    fn reading(temperature: f64) -> Reading {
        Reading::new(Measurements {
            temperature,
            humidity: 55.0,
            soil_moisture: 0.5,
            co2_level: 700.0,
            ..Default::default()
        })
        .unwrap()
    }

    fn temps(w: &Window) -> Vec<f64> {
        w.iter().map(|r| r.temperature()).collect()
    }

    // -- Eviction ------------------------------------------------------------

    #[test]
    fn keeps_most_recent_capacity_entries_in_order() {
        let h = History::new(3);
        for t in 0..7 {
            h.append(reading(t as f64));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(temps(&h.window(Duration::from_secs(3600))), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn zero_capacity_is_treated_as_one() {
        let h = History::new(0);
        h.append(reading(1.0));
        h.append(reading(2.0));
        assert_eq!(h.len(), 1);
        assert_eq!(h.latest().unwrap().temperature(), 2.0);
    }

    #[test]
    fn latest_on_empty_is_none() {
        let h = History::default();
        assert!(h.latest().is_none());
        assert!(h.is_empty());
        assert_eq!(h.capacity(), DEFAULT_CAPACITY);
    }

    // -- Window --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn window_excludes_entries_older_than_span() {
        let h = History::new(10);
        h.append(reading(1.0));
        tokio::time::advance(Duration::from_secs(120)).await;
        h.append(reading(2.0));
        tokio::time::advance(Duration::from_secs(30)).await;
        h.append(reading(3.0));

        let w = h.window(Duration::from_secs(60));
        assert_eq!(temps(&w), vec![2.0, 3.0]);

        let cutoff = Instant::now() - Duration::from_secs(60);
        assert!(w.iter().all(|r| r.captured() >= cutoff));
    }

    #[tokio::test(start_paused = true)]
    async fn window_with_nothing_recent_is_empty() {
        let h = History::new(10);
        h.append(reading(1.0));
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(h.window(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn window_is_restartable() {
        let h = History::new(10);
        h.append(reading(1.0));
        h.append(reading(2.0));
        let w = h.window(Duration::from_secs(60));
        let first: Vec<f64> = (&w).into_iter().map(|r| r.temperature()).collect();
        let second = temps(&w);
        assert_eq!(first, second);
        assert_eq!(w.first().unwrap().temperature(), 1.0);
        assert_eq!(w.last().unwrap().temperature(), 2.0);
    }

    #[test]
    fn window_is_a_snapshot() {
        let h = History::new(10);
        h.append(reading(1.0));
        let w = h.window(Duration::from_secs(60));
        h.append(reading(2.0));
        assert_eq!(w.len(), 1);
    }

    // -- Retention -----------------------------------------------------------

    #[test]
    fn purge_removes_only_older_entries() {
        let h = History::new(10);
        let now = OffsetDateTime::now_utc();
        let old = Measurements {
            temperature: 1.0,
            humidity: 50.0,
            soil_moisture: 0.5,
            co2_level: 600.0,
            ..Default::default()
        };
        h.append(
            Reading::captured_at(old, Instant::now(), now - time::Duration::days(40)).unwrap(),
        );
        h.append(reading(2.0));

        let removed = h.purge_before(now - time::Duration::days(30));
        assert_eq!(removed, 1);
        assert_eq!(h.latest().unwrap().temperature(), 2.0);
    }

    // -- Concurrency ---------------------------------------------------------

    #[test]
    fn concurrent_appends_respect_capacity() {
        let h = History::new(50);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let h = h.clone();
                std::thread::spawn(move || {
                    for t in 0..100 {
                        h.append(reading(t as f64));
                        let _ = h.window(Duration::from_secs(60)).len();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(h.len(), 50);
    }
}
