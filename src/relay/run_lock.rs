//! Quorum lock over independent key/value stores.
//!
//! A lock is held while a majority of stores carry this run's token under the
//! resource key and the validity window (TTL minus elapsed time and a drift
//! allowance) has not run out. Crashed holders are released by the TTL.

use crate::store::SharedStore;
use rand::Rng;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const CLOCK_DRIFT_FACTOR: f64 = 0.01;
const CLOCK_DRIFT_FLOOR_MS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub resource: String,
    pub token: String,
    pub validity: Duration,
}

pub struct RunLock {
    stores: Vec<SharedStore>,
    retry_count: u32,
    retry_delay: Duration,
}

impl RunLock {
    pub fn new(stores: Vec<SharedStore>, retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            stores,
            retry_count: retry_count.max(1),
            retry_delay,
        }
    }

    pub fn quorum(&self) -> usize {
        self.stores.len() / 2 + 1
    }

    /// Try up to `retry_count` times. `None` means another holder has the
    /// resource, which callers treat as a normal skip.
    pub fn acquire(&self, resource: &str, ttl: Duration, metadata: &[(&str, &str)]) -> Option<Lock> {
        let token = new_token(metadata);
        let drift = drift_for(ttl);

        for attempt in 1..=self.retry_count {
            let started = Instant::now();
            let acknowledged = self
                .stores
                .iter()
                .filter(|store| match store.set_if_absent(resource, &token, ttl) {
                    Ok(set) => set,
                    Err(err) => {
                        warn!(store = %store.describe(), error = %format!("{err:#}"), "lock store did not answer");
                        false
                    }
                })
                .count();

            let validity = ttl.checked_sub(started.elapsed() + drift);
            if acknowledged >= self.quorum()
                && let Some(validity) = validity.filter(|v| !v.is_zero())
            {
                debug!(resource, attempt, acknowledged, "run lock acquired");
                return Some(Lock {
                    resource: resource.to_string(),
                    token,
                    validity,
                });
            }

            self.release_token(resource, &token);
            debug!(resource, attempt, acknowledged, quorum = self.quorum(), "run lock not acquired");
            if attempt < self.retry_count {
                thread::sleep(self.backoff());
            }
        }
        None
    }

    pub fn release(&self, lock: &Lock) {
        self.release_token(&lock.resource, &lock.token);
    }

    fn release_token(&self, resource: &str, token: &str) {
        for store in &self.stores {
            if let Err(err) = store.compare_and_delete(resource, token) {
                warn!(store = %store.describe(), error = %format!("{err:#}"), "lock release failed");
            }
        }
    }

    /// Uniform in `[delay/2, delay]`.
    fn backoff(&self) -> Duration {
        let max = self.retry_delay.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(max / 2..=max))
    }
}

fn drift_for(ttl: Duration) -> Duration {
    let scaled = (ttl.as_millis() as f64 * CLOCK_DRIFT_FACTOR) as u64;
    Duration::from_millis(scaled + CLOCK_DRIFT_FLOOR_MS)
}

fn new_token(metadata: &[(&str, &str)]) -> String {
    let mut token = uuid::Uuid::new_v4().to_string();
    for (key, value) in metadata {
        token.push_str(&format!("-{key}_{value}"));
    }
    token
}
