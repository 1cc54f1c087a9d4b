//! Downstream reporting API: destination lookup, file submission and the
//! remote report download used by metadata-only drops.

pub mod client;

use crate::relay::metadata::Metadata;
use crate::relay::routing::SourceModule;
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub use client::RestClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationResult {
    pub data_source: String,
    pub ok: bool,
    pub message: String,
}

/// Outcome of one multipart submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitResult {
    /// Overall code: the `code` field of the body when present, else the
    /// HTTP status.
    pub status_code: u16,
    pub too_large: bool,
    pub requested: usize,
    pub destinations: Vec<DestinationResult>,
}

impl SubmitResult {
    /// Unit-level success. Individual destinations may still have failed.
    pub fn is_success(&self) -> bool {
        !self.too_large && self.status_code == 200
    }

    pub fn succeeded(&self) -> usize {
        self.destinations.iter().filter(|d| d.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.requested.saturating_sub(self.succeeded())
    }

    pub fn summary(&self) -> String {
        if self.too_large {
            return format!(
                "rejected for {} data sources, code 413 (file too large)",
                self.requested
            );
        }
        if self.status_code != 200 {
            return format!(
                "rejected for {} data sources, code {}",
                self.requested, self.status_code
            );
        }
        let errors = self
            .destinations
            .iter()
            .filter(|d| !d.ok)
            .map(|d| format!("[dataSource: {}, error: {}]", d.data_source, d.message))
            .collect::<String>();
        format!(
            "{} data sources successfully, {} data sources fail. Error: {}",
            self.succeeded(),
            self.failed(),
            if errors.is_empty() { "none" } else { &errors }
        )
    }
}

pub trait ReportApi {
    fn data_sources_by_email(&self, publisher_id: u64, email: &str) -> Result<Vec<i64>>;

    fn data_sources_by_integration(&self, publisher_id: u64, integration: &str)
    -> Result<Vec<i64>>;

    fn submit(
        &self,
        file: &Path,
        metadata: &Metadata,
        data_source_ids: &[i64],
        module: SourceModule,
    ) -> Result<SubmitResult>;

    /// Stream `url` to `dest_stem` plus an inferred extension and return the
    /// written path.
    fn download(&self, url: &str, dest_stem: &Path) -> Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::{DestinationResult, SubmitResult};

    fn dest(id: &str, ok: bool, message: &str) -> DestinationResult {
        DestinationResult {
            data_source: id.to_string(),
            ok,
            message: message.to_string(),
        }
    }

    #[test]
    fn partial_destination_failure_is_still_unit_success() {
        let result = SubmitResult {
            status_code: 200,
            too_large: false,
            requested: 2,
            destinations: vec![dest("3", true, ""), dest("4", false, "bad header")],
        };
        assert!(result.is_success());
        assert_eq!(result.failed(), 1);
        assert!(result.summary().contains("[dataSource: 4, error: bad header]"));
    }

    #[test]
    fn oversized_payload_is_a_failure() {
        let result = SubmitResult {
            status_code: 200,
            too_large: true,
            requested: 1,
            destinations: Vec::new(),
        };
        assert!(!result.is_success());
        assert!(result.summary().contains("413"));
    }
}
