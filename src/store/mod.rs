//! Key/value backends shared by the run lock and the retry tracker.
//!
//! Every operation is a single-key atomic step; callers never need
//! multi-key transactions.

pub mod file;
#[cfg(test)]
pub mod memory;
pub mod redis;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub trait KvStore: Send + Sync {
    /// Human-readable location, used in logs and `status`.
    fn describe(&self) -> String;

    /// Store `value` under `key` with an expiry only when the key is absent.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only when it currently holds `value`.
    fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool>;

    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Increment an integer counter. An absent counter is created at zero
    /// with `expire` before the increment; an existing one keeps its expiry.
    fn incr_with_expiry(&self, key: &str, expire: Duration) -> Result<i64>;

    fn delete(&self, key: &str) -> Result<()>;
}

pub type SharedStore = Arc<dyn KvStore>;

/// Build a store from its configured location.
pub fn open_store(location: &str, timeout: Duration) -> Result<SharedStore> {
    let trimmed = location.trim();
    if trimmed.starts_with("redis://")
        || trimmed.starts_with("rediss://")
        || trimmed.starts_with("redis+unix://")
    {
        return Ok(Arc::new(redis::RedisStore::open(trimmed, timeout)?));
    }
    let dir = trimmed.strip_prefix("file://").unwrap_or(trimmed);
    if dir.is_empty() {
        anyhow::bail!("empty store location");
    }
    Ok(Arc::new(file::FileStore::open(PathBuf::from(dir))?))
}

pub fn open_stores(locations: &[String], timeout: Duration) -> Result<Vec<SharedStore>> {
    locations
        .iter()
        .map(|location| open_store(location, timeout))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::open_store;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn bare_paths_and_file_urls_open_file_stores() {
        let tmp = tempdir().expect("tempdir");
        let bare = open_store(&tmp.path().join("a").display().to_string(), Duration::from_secs(1))
            .expect("bare path");
        assert!(bare.describe().starts_with("file://"));

        let url = format!("file://{}", tmp.path().join("b").display());
        let store = open_store(&url, Duration::from_secs(1)).expect("file url");
        assert!(store.describe().ends_with("/b"));
    }

    #[test]
    fn redis_urls_open_lazily() {
        let store = open_store("redis://127.0.0.1:1", Duration::from_millis(50))
            .expect("client construction does not connect");
        assert!(store.describe().starts_with("redis://"));
    }

    #[test]
    fn empty_file_location_is_rejected() {
        assert!(open_store("file://", Duration::from_secs(1)).is_err());
    }
}
