//! In-process stores for unit tests.

use super::KvStore;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<T>(&self, f: impl FnOnce(&mut HashMap<String, (String, Instant)>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        f(&mut entries)
    }
}

impl KvStore for MemoryStore {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        Ok(self.live(|entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
            true
        }))
    }

    fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        Ok(self.live(|entries| {
            if entries.get(key).is_some_and(|(v, _)| v == value) {
                entries.remove(key);
                true
            } else {
                false
            }
        }))
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live(|entries| entries.get(key).map(|(v, _)| v.clone())))
    }

    fn incr_with_expiry(&self, key: &str, expire: Duration) -> Result<i64> {
        self.live(|entries| {
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| ("0".to_string(), Instant::now() + expire));
            let next = entry.0.parse::<i64>()? + 1;
            entry.0 = next.to_string();
            Ok(next)
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.live(|entries| entries.remove(key));
        Ok(())
    }
}

/// Every call errors, like an unreachable node.
pub struct FailingStore;

impl KvStore for FailingStore {
    fn describe(&self) -> String {
        "failing://".to_string()
    }

    fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool> {
        anyhow::bail!("store unavailable")
    }

    fn compare_and_delete(&self, _key: &str, _value: &str) -> Result<bool> {
        anyhow::bail!("store unavailable")
    }

    fn get(&self, _key: &str) -> Result<Option<String>> {
        anyhow::bail!("store unavailable")
    }

    fn incr_with_expiry(&self, _key: &str, _expire: Duration) -> Result<i64> {
        anyhow::bail!("store unavailable")
    }

    fn delete(&self, _key: &str) -> Result<()> {
        anyhow::bail!("store unavailable")
    }
}
