use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Per-worker memory of recently accepted plates. Entries expire lazily: an
/// entry older than the window is treated as absent and dropped on lookup.
#[derive(Debug)]
pub struct DebounceCache {
    window: Duration,
    seen: HashMap<String, DateTime<Utc>>,
}

impl DebounceCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// True when `plate` was accepted less than one window before `now`.
    pub fn is_recent(&mut self, plate: &str, now: DateTime<Utc>) -> bool {
        match self.seen.get(plate) {
            Some(at) if now - *at < self.window => true,
            Some(_) => {
                self.seen.remove(plate);
                false
            }
            None => false,
        }
    }

    pub fn accept(&mut self, plate: &str, now: DateTime<Utc>) {
        self.seen.insert(plate.to_string(), now);
    }

    /// Forget `plate`, so the next sighting is processed again.
    pub fn forget(&mut self, plate: &str) {
        self.seen.remove(plate);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_within_window() {
        let mut cache = DebounceCache::new(Duration::seconds(30));
        let t0 = Utc::now();
        assert!(!cache.is_recent("京A12345", t0));
        cache.accept("京A12345", t0);
        assert!(cache.is_recent("京A12345", t0 + Duration::seconds(5)));
        assert!(!cache.is_recent("沪B99999", t0 + Duration::seconds(5)));
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let mut cache = DebounceCache::new(Duration::seconds(30));
        let t0 = Utc::now();
        cache.accept("京A12345", t0);
        assert!(!cache.is_recent("京A12345", t0 + Duration::seconds(30)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_forget_allows_retry() {
        let mut cache = DebounceCache::new(Duration::seconds(30));
        let t0 = Utc::now();
        cache.accept("京A12345", t0);
        cache.forget("京A12345");
        assert!(!cache.is_recent("京A12345", t0));
        assert_eq!(cache.len(), 0);
    }
}
