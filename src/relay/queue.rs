//! Producer/consumer job queue for the legacy import mode, plus the ledger of
//! file hashes that were already queued.
//!
//! The spool implementation keeps one JSON file per job under
//! `{queue_dir}/{tube}/{ready,reserved,buried}/`. Claiming a job is a rename,
//! so two workers never hold the same job.

use crate::relay::util::{move_file, now_epoch_millis, now_epoch_secs};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: String,
    payload: String,
    priority: u32,
    ttr_secs: u64,
    enqueued_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    buried_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReservedJob {
    pub id: String,
    pub payload: String,
    pub ttr: Duration,
    file_name: String,
    reserved_path: PathBuf,
}

pub trait JobQueue {
    fn put(&self, payload: &str, priority: u32, delay: Duration, ttr: Duration) -> Result<String>;

    /// Claim the most urgent ready job, if any.
    fn reserve(&self) -> Result<Option<ReservedJob>>;

    fn delete(&self, job: &ReservedJob) -> Result<()>;

    /// Park the job for manual inspection.
    fn bury(&self, job: &ReservedJob, reason: &str) -> Result<()>;
}

pub struct SpoolQueue {
    ready: PathBuf,
    reserved: PathBuf,
    buried: PathBuf,
}

impl SpoolQueue {
    pub fn open(queue_dir: &Path, tube: &str) -> Result<Self> {
        let root = queue_dir.join(tube);
        let queue = Self {
            ready: root.join("ready"),
            reserved: root.join("reserved"),
            buried: root.join("buried"),
        };
        for dir in [&queue.ready, &queue.reserved, &queue.buried] {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(queue)
    }

    fn sorted_names(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && name.ends_with(".json")
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_envelope(path: &Path) -> Result<Envelope> {
        let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn write_atomic(dir: &Path, name: &str, envelope: &Envelope) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string(envelope)?.as_bytes())?;
        tmp.persist(dir.join(name))
            .with_context(|| format!("failed to write job {name}"))?;
        Ok(())
    }

    /// Return jobs whose reservation outlived their TTR to the ready set.
    pub fn requeue_expired(&self) -> Result<usize> {
        let now = now_epoch_millis();
        let mut requeued = 0;
        for name in Self::sorted_names(&self.reserved)? {
            let Some((reserved_at, original)) = name.split_once('-') else {
                continue;
            };
            let Ok(reserved_at) = reserved_at.parse::<u64>() else {
                continue;
            };
            let path = self.reserved.join(&name);
            let ttr_ms = match Self::read_envelope(&path) {
                Ok(envelope) => envelope.ttr_secs.saturating_mul(1000),
                Err(err) => {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "unreadable reserved job");
                    continue;
                }
            };
            if now.saturating_sub(reserved_at) > ttr_ms {
                move_file(&path, &self.ready.join(original))?;
                requeued += 1;
                debug!(job = original, "reservation expired, job requeued");
            }
        }
        Ok(requeued)
    }

    pub fn counts(&self) -> Result<(usize, usize, usize)> {
        Ok((
            Self::sorted_names(&self.ready)?.len(),
            Self::sorted_names(&self.reserved)?.len(),
            Self::sorted_names(&self.buried)?.len(),
        ))
    }
}

/// `{priority}-{ready_at_ms}-{id}.json`: lexical order is claim order.
fn job_file_name(priority: u32, ready_at_ms: u64, id: &str) -> String {
    format!("{priority:010}-{ready_at_ms:013}-{id}.json")
}

fn ready_at_ms(name: &str) -> Option<u64> {
    name.split('-').nth(1)?.parse().ok()
}

impl JobQueue for SpoolQueue {
    fn put(&self, payload: &str, priority: u32, delay: Duration, ttr: Duration) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = now_epoch_millis();
        let envelope = Envelope {
            id: id.clone(),
            payload: payload.to_string(),
            priority,
            ttr_secs: ttr.as_secs().max(1),
            enqueued_at_ms: now,
            buried_reason: None,
        };
        let name = job_file_name(priority, now + delay.as_millis() as u64, &id);
        Self::write_atomic(&self.ready, &name, &envelope)?;
        Ok(id)
    }

    fn reserve(&self) -> Result<Option<ReservedJob>> {
        self.requeue_expired()?;
        let now = now_epoch_millis();
        for name in Self::sorted_names(&self.ready)? {
            if ready_at_ms(&name).is_some_and(|at| at > now) {
                continue;
            }
            let from = self.ready.join(&name);
            let to = self.reserved.join(format!("{now:013}-{name}"));
            match fs::rename(&from, &to) {
                Ok(()) => {}
                // another worker won the race
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to reserve {}", from.display()));
                }
            }
            let envelope = Self::read_envelope(&to)?;
            return Ok(Some(ReservedJob {
                id: envelope.id,
                payload: envelope.payload,
                ttr: Duration::from_secs(envelope.ttr_secs),
                file_name: name,
                reserved_path: to,
            }));
        }
        Ok(None)
    }

    fn delete(&self, job: &ReservedJob) -> Result<()> {
        fs::remove_file(&job.reserved_path)
            .with_context(|| format!("failed to delete job {}", job.id))
    }

    fn bury(&self, job: &ReservedJob, reason: &str) -> Result<()> {
        let mut envelope = Self::read_envelope(&job.reserved_path)?;
        envelope.buried_reason = Some(reason.to_string());
        Self::write_atomic(&self.buried, &job.file_name, &envelope)?;
        fs::remove_file(&job.reserved_path)
            .with_context(|| format!("failed to release buried job {}", job.id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    hash: String,
    file_path: String,
    queued_at_epoch_secs: u64,
}

/// Append-only record of content hashes already handed to the queue.
pub struct QueuedLedger {
    path: PathBuf,
    hashes: HashSet<String>,
}

impl QueuedLedger {
    pub fn load(queue_dir: &Path) -> Result<Self> {
        let path = queue_dir.join("queued.jsonl");
        let mut hashes = HashSet::new();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
                match serde_json::from_str::<LedgerEntry>(line) {
                    Ok(entry) => {
                        hashes.insert(entry.hash);
                    }
                    Err(err) => warn!(path = %path.display(), error = %err, "skipping bad ledger line"),
                }
            }
        }
        Ok(Self { path, hashes })
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    /// Distinct hashes queued so far.
    pub fn recorded(&self) -> usize {
        self.hashes.len()
    }

    pub fn record(&mut self, hash: &str, file: &Path) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entry = LedgerEntry {
            hash: hash.to_string(),
            file_path: file.display().to_string(),
            queued_at_epoch_secs: now_epoch_secs()?,
        };
        let mut out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(out, "{}", serde_json::to_string(&entry)?)?;
        self.hashes.insert(hash.to_string());
        Ok(())
    }
}
