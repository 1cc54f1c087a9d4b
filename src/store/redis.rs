use super::KvStore;
use crate::error::RelayError;
use anyhow::{Context, Result};
use std::time::Duration;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// One Redis instance. The client is built eagerly but connections are opened
/// per operation, so an unreachable node only fails the call that needs it.
pub struct RedisStore {
    client: redis::Client,
    label: String,
    timeout: Duration,
}

fn redact(url: &str) -> String {
    match (url.split_once("://"), url.rfind('@')) {
        (Some((scheme, _)), Some(at)) => format!("{scheme}://{}", &url[at + 1..]),
        _ => url.to_string(),
    }
}

impl RedisStore {
    pub fn open(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis location {}", redact(url)))?;
        Ok(Self {
            client,
            label: redact(url),
            timeout,
        })
    }

    fn connection(&self) -> Result<redis::Connection> {
        let conn = self
            .client
            .get_connection_with_timeout(self.timeout)
            .map_err(|err| RelayError::StoreUnavailable(format!("{}: {err}", self.label)))?;
        conn.set_read_timeout(Some(self.timeout))?;
        conn.set_write_timeout(Some(self.timeout))?;
        Ok(conn)
    }
}

impl KvStore for RedisStore {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query(&mut conn)
            .with_context(|| format!("SET NX failed on {}", self.label))?;
        Ok(reply.is_some())
    }

    fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let removed: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(value)
            .invoke(&mut conn)
            .with_context(|| format!("compare-and-delete failed on {}", self.label))?;
        Ok(removed > 0)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection()?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .with_context(|| format!("GET failed on {}", self.label))?;
        Ok(value)
    }

    fn incr_with_expiry(&self, key: &str, expire: Duration) -> Result<i64> {
        let mut conn = self.connection()?;
        let _: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(0)
            .arg("NX")
            .arg("EX")
            .arg(expire.as_secs().max(1))
            .query(&mut conn)
            .with_context(|| format!("SET NX EX failed on {}", self.label))?;
        let next: i64 = redis::cmd("INCR")
            .arg(key)
            .query(&mut conn)
            .with_context(|| format!("INCR failed on {}", self.label))?;
        Ok(next)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query(&mut conn)
            .with_context(|| format!("DEL failed on {}", self.label))?;
        Ok(())
    }
}
