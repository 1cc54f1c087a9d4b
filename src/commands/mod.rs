pub mod data_sources;
pub mod enqueue_jobs;
pub mod import_new_files;
pub mod status;
pub mod sweep;
pub mod work_jobs;

use crate::relay::audit::append_event;
use crate::relay::paths::RelayPaths;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn merge(&mut self, mut other: CommandReport) {
        self.ok &= other.ok;
        self.details.append(&mut other.details);
        self.issues.append(&mut other.issues);
    }
}

/// Write an audit line, downgrading a failed write to a warning so the
/// caller's decision stands.
pub(crate) fn audit(
    paths: &RelayPaths,
    phase: &str,
    status: &str,
    path: Option<&Path>,
    message: &str,
) {
    let display = path.map(|p| p.display().to_string());
    if let Err(err) = append_event(paths, phase, status, display.as_deref(), message) {
        tracing::warn!(error = %format!("{err:#}"), "failed to append audit event");
    }
}

#[cfg(test)]
mod tests {
    use super::CommandReport;

    #[test]
    fn merge_carries_failures_over() {
        let mut main = CommandReport::new("run");
        main.detail("found 2 new files");
        let mut sub = CommandReport::new("sub");
        sub.issue("store unreachable");

        main.merge(sub);

        assert!(!main.ok);
        assert_eq!(main.details, vec!["found 2 new files".to_string()]);
        assert_eq!(main.issues, vec!["store unreachable".to_string()]);
    }
}
