use crate::error::RelayError;
use anyhow::Result;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RelayPaths {
    pub relay_home: PathBuf,
    pub watch_root: PathBuf,
    pub processed_dir: PathBuf,
    pub invalid_dir: PathBuf,
    pub zip_archive_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub store_dir: PathBuf,
    pub queue_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<RelayPaths> {
    let relay_home = match env::var("RELAY_HOME") {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => required_home_dir()?.join(".report-relay"),
    };

    let watch_root = env_or_default_path("RELAY_WATCH_ROOT", relay_home.join("watch"));
    let processed_dir = env_or_default_path("RELAY_PROCESSED_DIR", relay_home.join("processed"));
    let invalid_dir = env_or_default_path("RELAY_INVALID_DIR", relay_home.join("invalid"));
    let zip_archive_dir =
        env_or_default_path("RELAY_ZIP_ARCHIVE_DIR", relay_home.join("zip-archive"));
    let logs_dir = env_or_default_path("RELAY_LOGS_DIR", relay_home.join("logs"));
    let store_dir = env_or_default_path("RELAY_STORE_DIR", relay_home.join("store"));
    let queue_dir = env_or_default_path("RELAY_QUEUE_DIR", relay_home.join("queue"));

    Ok(RelayPaths {
        relay_home,
        watch_root,
        processed_dir,
        invalid_dir,
        zip_archive_dir,
        logs_dir,
        store_dir,
        queue_dir,
    })
}

fn ensure_dir(path: &Path, label: &str) -> Result<(), RelayError> {
    if !path.is_dir() {
        fs::create_dir_all(path).map_err(|err| {
            RelayError::UnusableDirectory(format!(
                "cannot create {label} {}: {err}",
                path.display()
            ))
        })?;
    }
    Ok(())
}

fn ensure_writable(path: &Path, label: &str) -> Result<(), RelayError> {
    tempfile::tempfile_in(path).map(drop).map_err(|err| {
        RelayError::UnusableDirectory(format!("{label} {} is not writable: {err}", path.display()))
    })
}

impl RelayPaths {
    /// Create every working directory and check the watch root is readable
    /// and the archive areas writable. Any failure here aborts the run before
    /// a single file is touched.
    pub fn prepare(&self) -> Result<(), RelayError> {
        ensure_dir(&self.watch_root, "watch root")?;
        fs::read_dir(&self.watch_root).map_err(|err| {
            RelayError::UnusableDirectory(format!(
                "watch root {} is not readable: {err}",
                self.watch_root.display()
            ))
        })?;

        for (label, dir) in [
            ("processed dir", &self.processed_dir),
            ("invalid dir", &self.invalid_dir),
            ("zip archive dir", &self.zip_archive_dir),
            ("logs dir", &self.logs_dir),
        ] {
            ensure_dir(dir, label)?;
            ensure_writable(dir, label)?;
        }
        Ok(())
    }
}
