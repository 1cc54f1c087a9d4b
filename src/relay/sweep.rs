use crate::relay::config::WatchConfig;
use crate::relay::util::extension_lowercase;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepOutcome {
    pub incompatible: Vec<PathBuf>,
    pub deleted: usize,
    pub pruned_dirs: usize,
}

fn is_compatible(path: &Path, watch: &WatchConfig) -> bool {
    match extension_lowercase(path) {
        Some(ext) => ext == watch.metadata_extension || watch.supported_extensions.contains(&ext),
        None => false,
    }
}

/// Find files under `root` that are neither reports nor sidecars. With
/// `delete`, remove them and then every directory left empty below `root`.
pub fn sweep_incompatible(root: &Path, watch: &WatchConfig, delete: bool) -> Result<SweepOutcome> {
    let mut outcome = SweepOutcome::default();
    if !root.is_dir() {
        return Ok(outcome);
    }

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if entry.file_type().is_file() && !is_compatible(entry.path(), watch) {
            outcome.incompatible.push(entry.into_path());
        }
    }

    if !delete {
        return Ok(outcome);
    }

    for path in &outcome.incompatible {
        match fs::remove_file(path) {
            Ok(()) => {
                outcome.deleted += 1;
                info!(path = %path.display(), "incompatible file deleted");
            }
            Err(err) => warn!(path = %path.display(), error = %err, "failed to delete incompatible file"),
        }
    }

    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let empty = fs::read_dir(entry.path())
            .map(|mut it| it.next().is_none())
            .unwrap_or(false);
        if empty && fs::remove_dir(entry.path()).is_ok() {
            outcome.pruned_dirs += 1;
        }
    }
    Ok(outcome)
}
