use super::KvStore;
use crate::relay::util::now_epoch_millis;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

const DATA_FILE: &str = "store.json";
const LOCK_FILE: &str = "store.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: String,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|at| at > now_ms)
    }
}

/// Directory-backed store for single-host deployments. Each operation holds
/// an exclusive `flock` on `store.lock` for the whole read-modify-write, and
/// the data file is replaced atomically.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create store dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn with_entries<T>(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, Entry>, u64) -> T,
    ) -> Result<T> {
        let lock_path = self.dir.join(LOCK_FILE);
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;
        lock.lock_exclusive()
            .with_context(|| format!("failed to lock {}", lock_path.display()))?;

        let data_path = self.dir.join(DATA_FILE);
        let mut entries: BTreeMap<String, Entry> = if data_path.exists() {
            let raw = fs::read_to_string(&data_path)
                .with_context(|| format!("failed to read {}", data_path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse {}", data_path.display()))?
            }
        } else {
            BTreeMap::new()
        };

        let now_ms = now_epoch_millis();
        let before = entries.len();
        entries.retain(|_, entry| entry.live(now_ms));
        let pruned = entries.len() != before;

        let snapshot = entries.clone();
        let out = mutate(&mut entries, now_ms);
        if pruned || !same_entries(&snapshot, &entries) {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
                .with_context(|| format!("failed to stage write in {}", self.dir.display()))?;
            tmp.write_all(serde_json::to_string_pretty(&entries)?.as_bytes())?;
            tmp.persist(&data_path)
                .with_context(|| format!("failed to replace {}", data_path.display()))?;
        }

        fs2::FileExt::unlock(&lock)?;
        Ok(out)
    }
}

fn same_entries(a: &BTreeMap<String, Entry>, b: &BTreeMap<String, Entry>) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| {
            ka == kb && va.value == vb.value && va.expires_at_ms == vb.expires_at_ms
        })
}

impl KvStore for FileStore {
    fn describe(&self) -> String {
        format!("file://{}", self.dir.display())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let acquired = self.with_entries(|entries, now_ms| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at_ms: Some(now_ms + ttl.as_millis() as u64),
                },
            );
            true
        })?;
        Ok(acquired)
    }

    fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let deleted = self.with_entries(|entries, _| {
            if entries.get(key).is_some_and(|entry| entry.value == value) {
                entries.remove(key);
                true
            } else {
                false
            }
        })?;
        Ok(deleted)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.with_entries(|entries, _| entries.get(key).map(|e| e.value.clone()))?;
        Ok(value)
    }

    fn incr_with_expiry(&self, key: &str, expire: Duration) -> Result<i64> {
        let next = self.with_entries(|entries, now_ms| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at_ms: Some(now_ms + expire.as_millis() as u64),
            });
            let current = entry.value.trim().parse::<i64>();
            match current {
                Ok(n) => {
                    entry.value = (n + 1).to_string();
                    Ok(n + 1)
                }
                Err(_) => Err(format!("value under {key} is not an integer")),
            }
        })?;
        next.map_err(anyhow::Error::msg)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_entries(|entries, _| {
            entries.remove(key);
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FileStore;
    use crate::store::KvStore;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn set_if_absent_refuses_a_held_key() {
        let tmp = tempdir().expect("tempdir");
        let store = FileStore::open(tmp.path().to_path_buf()).expect("open");

        assert!(store.set_if_absent("run", "a", Duration::from_secs(30)).expect("set"));
        assert!(!store.set_if_absent("run", "b", Duration::from_secs(30)).expect("set"));
        assert_eq!(store.get("run").expect("get"), Some("a".to_string()));
    }

    #[test]
    fn expired_keys_can_be_taken_again() {
        let tmp = tempdir().expect("tempdir");
        let store = FileStore::open(tmp.path().to_path_buf()).expect("open");

        assert!(store.set_if_absent("run", "a", Duration::from_millis(40)).expect("set"));
        thread::sleep(Duration::from_millis(80));
        assert!(store.set_if_absent("run", "b", Duration::from_secs(30)).expect("set"));
    }

    #[test]
    fn compare_and_delete_ignores_foreign_tokens() {
        let tmp = tempdir().expect("tempdir");
        let store = FileStore::open(tmp.path().to_path_buf()).expect("open");
        store.set_if_absent("run", "mine", Duration::from_secs(30)).expect("set");

        assert!(!store.compare_and_delete("run", "theirs").expect("cad"));
        assert!(store.compare_and_delete("run", "mine").expect("cad"));
        assert_eq!(store.get("run").expect("get"), None);
    }

    #[test]
    fn counters_survive_reopening_the_store() {
        let tmp = tempdir().expect("tempdir");
        {
            let store = FileStore::open(tmp.path().to_path_buf()).expect("open");
            assert_eq!(store.incr_with_expiry("k", Duration::from_secs(60)).expect("incr"), 1);
            assert_eq!(store.incr_with_expiry("k", Duration::from_secs(60)).expect("incr"), 2);
        }
        let reopened = FileStore::open(tmp.path().to_path_buf()).expect("reopen");
        assert_eq!(reopened.get("k").expect("get"), Some("2".to_string()));
        reopened.delete("k").expect("delete");
        assert_eq!(reopened.get("k").expect("get"), None);
    }

    #[test]
    fn counter_expiry_resets_the_count() {
        let tmp = tempdir().expect("tempdir");
        let store = FileStore::open(tmp.path().to_path_buf()).expect("open");
        store.incr_with_expiry("k", Duration::from_millis(40)).expect("incr");
        store.incr_with_expiry("k", Duration::from_millis(40)).expect("incr");
        thread::sleep(Duration::from_millis(80));
        assert_eq!(store.incr_with_expiry("k", Duration::from_secs(60)).expect("incr"), 1);
    }
}
