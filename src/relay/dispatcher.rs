//! Per-unit delivery state machine.
//!
//! `Pending -> Routing -> Resolved -> Delivering` ends in exactly one
//! [`UnitOutcome`]. Nothing in here returns `Err`: unit failures are outcomes,
//! and only configuration problems may abort a run.

use crate::api::ReportApi;
use crate::relay::archive::ArchiveMover;
use crate::relay::content::is_effectively_empty;
use crate::relay::pairing::{MetadataRefCounts, PairedUnit};
use crate::relay::retry::RetryTracker;
use crate::relay::routing::{EmailTemplate, RoutingError, RoutingParameters, SourceModule, parse_routing};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const UNKNOWN_SEGMENT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingReport,
    MalformedPath,
    UnsupportedSourceModule,
    InvalidPublisher,
    MissingPartner,
    NoDestinations,
}

impl From<&RoutingError> for SkipReason {
    fn from(err: &RoutingError) -> Self {
        match err {
            RoutingError::Malformed => Self::MalformedPath,
            RoutingError::UnsupportedModule(_) => Self::UnsupportedSourceModule,
            RoutingError::InvalidPublisher(_) => Self::InvalidPublisher,
            RoutingError::MissingPartner => Self::MissingPartner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Delivered {
        report: PathBuf,
        archived_to: PathBuf,
        /// Archived without a POST because it held no data rows.
        empty: bool,
        summary: String,
    },
    RetryScheduled {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },
    Invalidated {
        path: PathBuf,
        moved_to: PathBuf,
        reason: String,
    },
    Skipped {
        path: Option<PathBuf>,
        reason: SkipReason,
        deleted: bool,
    },
}

impl UnitOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::Invalidated { .. } => "invalidated",
            Self::Skipped { deleted: true, .. } => "deleted",
            Self::Skipped { .. } => "skipped",
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Delivered { report, .. } => Some(report),
            Self::RetryScheduled { path, .. } | Self::Invalidated { path, .. } => Some(path),
            Self::Skipped { path, .. } => path.as_deref(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Delivered {
                archived_to,
                empty: true,
                ..
            } => format!("empty report archived to {}", archived_to.display()),
            Self::Delivered {
                archived_to,
                summary,
                ..
            } => format!("{summary}; archived to {}", archived_to.display()),
            Self::RetryScheduled {
                attempts, reason, ..
            } => format!("attempt {attempts} failed: {reason}"),
            Self::Invalidated {
                moved_to, reason, ..
            } => format!("{reason}; moved to {}", moved_to.display()),
            Self::Skipped {
                reason, deleted, ..
            } => format!("{reason:?}{}", if *deleted { ", file deleted" } else { "" }),
        }
    }
}

enum Delivery {
    Sent(String),
    Empty,
}

pub struct Dispatcher<'a> {
    api: &'a dyn ReportApi,
    retry: &'a RetryTracker,
    mover: &'a ArchiveMover,
    watch_root: &'a Path,
    email_template: EmailTemplate,
    metadata_extension: String,
    delete_unroutable_fetcher_files: bool,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        api: &'a dyn ReportApi,
        retry: &'a RetryTracker,
        mover: &'a ArchiveMover,
        watch_root: &'a Path,
        email_template: EmailTemplate,
    ) -> Self {
        Self {
            api,
            retry,
            mover,
            watch_root,
            email_template,
            metadata_extension: "meta".to_string(),
            delete_unroutable_fetcher_files: true,
        }
    }

    pub fn metadata_extension(mut self, ext: &str) -> Self {
        self.metadata_extension = ext.to_string();
        self
    }

    pub fn delete_unroutable_fetcher_files(mut self, delete: bool) -> Self {
        self.delete_unroutable_fetcher_files = delete;
        self
    }

    pub fn dispatch(&self, unit: &PairedUnit, refs: &mut MetadataRefCounts) -> UnitOutcome {
        let report = match &unit.report {
            Some(report) => report.clone(),
            None => match self.fetch_remote_report(unit) {
                Ok(report) => report,
                Err(outcome) => return outcome,
            },
        };

        let routing = match parse_routing(self.watch_root, &report) {
            Ok(routing) => routing,
            Err(err) => {
                warn!(path = %report.display(), reason = %err, "report skipped");
                return UnitOutcome::Skipped {
                    path: Some(report),
                    reason: SkipReason::from(&err),
                    deleted: false,
                };
            }
        };

        let ids = match routing.module {
            SourceModule::Email => {
                let email = self
                    .email_template
                    .render(routing.publisher_id, &routing.partner);
                match self.api.data_sources_by_email(routing.publisher_id, &email) {
                    Ok(ids) if ids.is_empty() => {
                        warn!(
                            path = %report.display(),
                            publisher = routing.publisher_id,
                            email = %email,
                            "no data sources for webhook email"
                        );
                        return UnitOutcome::Skipped {
                            path: Some(report),
                            reason: SkipReason::NoDestinations,
                            deleted: false,
                        };
                    }
                    Ok(ids) => ids,
                    Err(err) => {
                        return self.delivery_failed(
                            unit,
                            &report,
                            &routing,
                            refs,
                            format!("data source lookup failed: {err:#}"),
                        );
                    }
                }
            }
            SourceModule::Fetcher => match unit.metadata.data_source_id() {
                Some(id) => vec![id],
                None => return self.drop_unroutable_fetcher_report(unit, &report, &routing, refs),
            },
        };

        match self.deliver(unit, &report, &routing, &ids) {
            Ok(delivery) => self.delivered(unit, &report, &routing, refs, delivery),
            Err(reason) => self.delivery_failed(unit, &report, &routing, refs, reason),
        }
    }

    fn deliver(
        &self,
        unit: &PairedUnit,
        report: &Path,
        routing: &RoutingParameters,
        ids: &[i64],
    ) -> Result<Delivery, String> {
        if routing.module == SourceModule::Fetcher {
            match is_effectively_empty(report) {
                Ok(true) => return Ok(Delivery::Empty),
                Ok(false) => {}
                Err(err) => {
                    warn!(path = %report.display(), error = %format!("{err:#}"), "emptiness check failed");
                }
            }
        }

        let result = self
            .api
            .submit(report, &unit.metadata, ids, routing.module)
            .map_err(|err| format!("{err:#}"))?;
        if !result.is_success() {
            return Err(result.summary());
        }
        if result.failed() > 0 {
            warn!(
                path = %report.display(),
                publisher = routing.publisher_id,
                partner = %routing.partner,
                detail = %result.summary(),
                "some data sources rejected the report"
            );
        }
        Ok(Delivery::Sent(result.summary()))
    }

    fn delivered(
        &self,
        unit: &PairedUnit,
        report: &Path,
        routing: &RoutingParameters,
        refs: &mut MetadataRefCounts,
        delivery: Delivery,
    ) -> UnitOutcome {
        self.retry.reset(report);
        let publisher = routing.publisher_id.to_string();
        match self.mover.move_to_processed(report, &publisher, &routing.partner) {
            Ok(archived_to) => {
                self.release_metadata(unit, refs, &publisher, &routing.partner);
                let (empty, summary) = match delivery {
                    Delivery::Sent(summary) => (false, summary),
                    Delivery::Empty => (true, "empty report, not posted".to_string()),
                };
                info!(
                    path = %report.display(),
                    publisher = routing.publisher_id,
                    partner = %routing.partner,
                    archived_to = %archived_to.display(),
                    "{summary}"
                );
                UnitOutcome::Delivered {
                    report: report.to_path_buf(),
                    archived_to,
                    empty,
                    summary,
                }
            }
            Err(err) => {
                error!(path = %report.display(), error = %format!("{err:#}"), "delivered report could not be archived");
                UnitOutcome::RetryScheduled {
                    path: report.to_path_buf(),
                    attempts: self.retry.count(report),
                    reason: format!("archive failed: {err:#}"),
                }
            }
        }
    }

    fn delivery_failed(
        &self,
        unit: &PairedUnit,
        report: &Path,
        routing: &RoutingParameters,
        refs: &mut MetadataRefCounts,
        reason: String,
    ) -> UnitOutcome {
        let attempts = self.retry.increment(report);
        if attempts < self.retry.max_retry() {
            warn!(
                path = %report.display(),
                publisher = routing.publisher_id,
                partner = %routing.partner,
                attempts,
                reason = %reason,
                "delivery failed, will retry"
            );
            return UnitOutcome::RetryScheduled {
                path: report.to_path_buf(),
                attempts,
                reason,
            };
        }

        let publisher = routing.publisher_id.to_string();
        match self.mover.move_to_processed(report, &publisher, &routing.partner) {
            Ok(moved_to) => {
                self.retry.reset(report);
                self.release_metadata(unit, refs, &publisher, &routing.partner);
                error!(
                    path = %report.display(),
                    publisher = routing.publisher_id,
                    partner = %routing.partner,
                    attempts,
                    reason = %reason,
                    "retries exhausted, report archived undelivered"
                );
                UnitOutcome::Invalidated {
                    path: report.to_path_buf(),
                    moved_to,
                    reason: format!("gave up after {attempts} attempts: {reason}"),
                }
            }
            Err(err) => {
                error!(path = %report.display(), error = %format!("{err:#}"), "exhausted report could not be archived");
                UnitOutcome::RetryScheduled {
                    path: report.to_path_buf(),
                    attempts,
                    reason: format!("{reason}; archive failed: {err:#}"),
                }
            }
        }
    }

    fn drop_unroutable_fetcher_report(
        &self,
        unit: &PairedUnit,
        report: &Path,
        routing: &RoutingParameters,
        refs: &mut MetadataRefCounts,
    ) -> UnitOutcome {
        if !self.delete_unroutable_fetcher_files {
            warn!(path = %report.display(), publisher = routing.publisher_id, partner = %routing.partner, "fetcher report has no dataSourceId, left in place");
            return UnitOutcome::Skipped {
                path: Some(report.to_path_buf()),
                reason: SkipReason::NoDestinations,
                deleted: false,
            };
        }

        let deleted = match fs::remove_file(report) {
            Ok(()) => true,
            Err(err) => {
                error!(path = %report.display(), error = %err, "failed to delete unroutable fetcher report");
                false
            }
        };
        if deleted {
            self.retry.reset(report);
            self.release_metadata(unit, refs, &routing.publisher_id.to_string(), &routing.partner);
        }
        warn!(
            path = %report.display(),
            publisher = routing.publisher_id,
            partner = %routing.partner,
            deleted,
            "fetcher report has no dataSourceId"
        );
        UnitOutcome::Skipped {
            path: Some(report.to_path_buf()),
            reason: SkipReason::NoDestinations,
            deleted,
        }
    }

    /// Archive the sidecar beside the report once no other report of this run
    /// still needs it.
    fn release_metadata(
        &self,
        unit: &PairedUnit,
        refs: &mut MetadataRefCounts,
        publisher: &str,
        partner: &str,
    ) {
        let Some(meta) = unit.metadata_path.as_deref() else {
            return;
        };
        if !refs.release(meta) || !meta.exists() {
            return;
        }
        if let Err(err) = self.mover.move_to_processed(meta, publisher, partner) {
            error!(path = %meta.display(), error = %format!("{err:#}"), "metadata could not be archived");
        }
    }

    /// Metadata-only unit: pull the report from `reportFileUrl` into the
    /// sidecar's directory.
    fn fetch_remote_report(&self, unit: &PairedUnit) -> Result<PathBuf, UnitOutcome> {
        let Some(meta) = unit.metadata_path.as_deref() else {
            return Err(UnitOutcome::Skipped {
                path: None,
                reason: SkipReason::MissingReport,
                deleted: false,
            });
        };
        let Some(url) = unit.metadata.report_file_url() else {
            info!(path = %meta.display(), "metadata without report file or reportFileUrl");
            return Err(UnitOutcome::Skipped {
                path: Some(meta.to_path_buf()),
                reason: SkipReason::MissingReport,
                deleted: false,
            });
        };

        let stem = self.strip_metadata_suffix(meta);
        match self.api.download(url, &stem) {
            Ok(report) => {
                self.retry.reset(meta);
                info!(path = %meta.display(), url, report = %report.display(), "remote report downloaded");
                Ok(report)
            }
            Err(err) => Err(self.download_failed(unit, meta, format!("{err:#}"))),
        }
    }

    fn download_failed(&self, unit: &PairedUnit, meta: &Path, reason: String) -> UnitOutcome {
        let attempts = self.retry.increment(meta);
        if attempts < self.retry.max_retry() {
            warn!(path = %meta.display(), attempts, reason = %reason, "report download failed, will retry");
            return UnitOutcome::RetryScheduled {
                path: meta.to_path_buf(),
                attempts,
                reason,
            };
        }

        let publisher = unit
            .metadata
            .publisher_id()
            .unwrap_or_else(|| UNKNOWN_SEGMENT.to_string());
        let partner = unit
            .metadata
            .integration_cname()
            .unwrap_or_else(|| UNKNOWN_SEGMENT.to_string());
        match self.mover.move_to_invalid(meta, &publisher, &partner) {
            Ok(moved_to) => {
                self.retry.reset(meta);
                error!(
                    path = %meta.display(),
                    publisher = %publisher,
                    partner = %partner,
                    attempts,
                    reason = %reason,
                    "report download retries exhausted, metadata invalidated"
                );
                UnitOutcome::Invalidated {
                    path: meta.to_path_buf(),
                    moved_to,
                    reason: format!("download failed {attempts} times: {reason}"),
                }
            }
            Err(err) => {
                error!(path = %meta.display(), error = %format!("{err:#}"), "metadata could not be invalidated");
                UnitOutcome::RetryScheduled {
                    path: meta.to_path_buf(),
                    attempts,
                    reason: format!("{reason}; invalidation failed: {err:#}"),
                }
            }
        }
    }

    fn strip_metadata_suffix(&self, meta: &Path) -> PathBuf {
        let suffix = format!(".{}", self.metadata_extension);
        let name = meta
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stripped = name
            .strip_suffix(&suffix)
            .or_else(|| {
                name.len()
                    .checked_sub(suffix.len())
                    .filter(|cut| name.is_char_boundary(*cut))
                    .filter(|cut| name[*cut..].eq_ignore_ascii_case(&suffix))
                    .map(|cut| &name[..cut])
            })
            .unwrap_or(&name);
        meta.with_file_name(stripped)
    }
}
