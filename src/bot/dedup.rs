//! Duplicate packet suppression.
//!
//! Meshtastic nodes rebroadcast packets, so the same packet id can arrive
//! several times through different neighbours. The filter remembers ids it has
//! let through, bounded both by count and by age.
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::config::DedupConfig;

/// Seen packet ids with the time of first sighting.
pub struct DedupFilter {
    cache: Mutex<LruCache<u32, Instant>>,
    window: Duration,
}

impl DedupFilter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            window,
        }
    }

    pub fn from_config(cfg: &DedupConfig) -> Self {
        Self::new(cfg.capacity, Duration::from_secs(cfg.window_seconds))
    }

    /// True (and remember the id) the first time an id is seen, false after.
    /// Id 0 means "no id" and always passes.
    pub fn should_process(&self, packet_id: u32) -> bool {
        self.should_process_at(packet_id, Instant::now())
    }

    pub fn should_process_at(&self, packet_id: u32, now: Instant) -> bool {
        if packet_id == 0 {
            return true;
        }
        let mut cache = self.lock();

        // Lookups use peek so the eviction order stays first-sighting order
        if let Some(&seen_at) = cache.peek(&packet_id) {
            if now.saturating_duration_since(seen_at) < self.window {
                return false;
            }
            cache.pop(&packet_id);
        }
        self.prune_expired(&mut cache, now);

        cache.put(packet_id, now);
        true
    }

    /// Forget everything (called on reconnect).
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<u32, Instant>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn prune_expired(&self, cache: &mut LruCache<u32, Instant>, now: Instant) {
        while let Some((_, &seen_at)) = cache.peek_lru() {
            if now.saturating_duration_since(seen_at) < self.window {
                break;
            }
            cache.pop_lru();
        }
    }
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sighting_is_rejected() {
        let f = DedupFilter::default();
        assert!(f.should_process(42));
        assert!(!f.should_process(42));
        assert!(!f.should_process(42));
        assert!(f.should_process(43));
    }

    #[test]
    fn zero_id_always_passes_and_is_not_recorded() {
        let f = DedupFilter::default();
        assert!(f.should_process(0));
        assert!(f.should_process(0));
        assert!(f.is_empty());
    }

    #[test]
    fn clear_forgets_ids() {
        let f = DedupFilter::default();
        assert!(f.should_process(7));
        f.clear();
        assert!(f.should_process(7));
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let f = DedupFilter::new(2, Duration::from_secs(600));
        let t0 = Instant::now();
        assert!(f.should_process_at(1, t0));
        assert!(f.should_process_at(2, t0));
        assert!(f.should_process_at(3, t0));
        assert_eq!(f.len(), 2);
        // 1 was evicted, 2 and 3 remain
        assert!(!f.should_process_at(2, t0));
        assert!(!f.should_process_at(3, t0));
        assert!(f.should_process_at(1, t0));
    }

    #[test]
    fn ids_expire_after_window() {
        let f = DedupFilter::new(16, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(f.should_process_at(5, t0));
        assert!(!f.should_process_at(5, t0 + Duration::from_secs(9)));
        assert!(f.should_process_at(5, t0 + Duration::from_secs(11)));
    }

    #[test]
    fn expired_ids_are_pruned_on_insert() {
        let f = DedupFilter::new(16, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(f.should_process_at(1, t0));
        assert!(f.should_process_at(2, t0 + Duration::from_secs(5)));
        assert!(f.should_process_at(3, t0 + Duration::from_secs(12)));
        // 1 aged out, 2 is still inside its window
        assert_eq!(f.len(), 2);
        assert!(!f.should_process_at(2, t0 + Duration::from_secs(12)));
    }

    #[test]
    fn zero_capacity_still_remembers_one_id() {
        let f = DedupFilter::new(0, Duration::from_secs(600));
        assert!(f.should_process(8));
        assert!(!f.should_process(8));
    }

    #[test]
    fn concurrent_callers_admit_one() {
        use std::sync::Arc;
        let f = Arc::new(DedupFilter::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = f.clone();
                std::thread::spawn(move || f.should_process(99))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
