use crate::relay::util::path_key;
use crate::store::SharedStore;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Per-file attempt counter backed by the shared store. Store failures fail
/// open: the count reads as zero and mutations are skipped, so files are
/// retried rather than lost.
pub struct RetryTracker {
    store: SharedStore,
    prefix: String,
    max_retry: u32,
    expire: Duration,
}

impl RetryTracker {
    pub fn new(store: SharedStore, prefix: &str, max_retry: u32, expire: Duration) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            max_retry,
            expire,
        }
    }

    pub fn key(&self, path: &Path) -> String {
        format!("{}_{}", self.prefix, path_key(path))
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn count(&self, path: &Path) -> u32 {
        match self.store.get(&self.key(path)) {
            Ok(Some(raw)) => raw.trim().parse::<u32>().unwrap_or(0),
            Ok(None) => 0,
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "retry counter unreadable");
                0
            }
        }
    }

    /// Returns the new count, or 0 when the store could not be reached.
    pub fn increment(&self, path: &Path) -> u32 {
        match self.store.incr_with_expiry(&self.key(path), self.expire) {
            Ok(n) => u32::try_from(n.max(0)).unwrap_or(u32::MAX),
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "retry counter not incremented");
                0
            }
        }
    }

    pub fn reset(&self, path: &Path) {
        if let Err(err) = self.store.delete(&self.key(path)) {
            warn!(path = %path.display(), error = %format!("{err:#}"), "retry counter not reset");
        }
    }

    #[cfg(test)]
    pub fn is_exhausted(&self, path: &Path) -> bool {
        self.count(path) >= self.max_retry
    }
}

#[cfg(test)]
mod tests {
    use super::RetryTracker;
    use crate::store::memory::{FailingStore, MemoryStore};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn exhausted_after_exactly_max_increments() {
        let tracker = RetryTracker::new(
            Arc::new(MemoryStore::new()),
            "retry_cycle",
            3,
            Duration::from_secs(60),
        );
        let file = Path::new("/w/1/p/email/r.csv");
        for attempt in 1..=3 {
            assert!(!tracker.is_exhausted(file), "exhausted before attempt {attempt}");
            assert_eq!(tracker.increment(file), attempt);
        }
        assert!(tracker.is_exhausted(file));

        tracker.reset(file);
        assert_eq!(tracker.count(file), 0);
    }

    #[test]
    fn keys_are_prefixed_path_hashes() {
        let tracker =
            RetryTracker::new(Arc::new(MemoryStore::new()), "rc", 5, Duration::from_secs(60));
        let key = tracker.key(Path::new("/w/a.csv"));
        assert!(key.starts_with("rc_"));
        assert_eq!(key.len(), 3 + 64);
        assert_ne!(key, tracker.key(Path::new("/w/b.csv")));
    }

    #[test]
    fn unreachable_store_fails_open() {
        let tracker =
            RetryTracker::new(Arc::new(FailingStore), "rc", 1, Duration::from_secs(60));
        let file = Path::new("/w/a.csv");
        assert_eq!(tracker.increment(file), 0);
        assert_eq!(tracker.count(file), 0);
        assert!(!tracker.is_exhausted(file));
        tracker.reset(file);
    }
}
