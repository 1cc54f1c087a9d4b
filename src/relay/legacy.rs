//! Job payloads for the queue-based import mode, derived from the legacy
//! `{partner}/{publisherId}/{exec}-{start}-{end}/...` layout.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use thiserror::Error;

const LEGACY_DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJob {
    #[serde(rename = "filePath")]
    pub file_path: String,
    pub publisher: u64,
    #[serde(rename = "partnerCName")]
    pub partner_cname: String,
    /// Present only for single-day reports, as `YYYY-MM-DD`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LegacyPathError {
    #[error("not under {{partner}}/{{publisherId}}/...")]
    TooShallow,
    #[error("publisher id `{0}` is not a positive integer")]
    InvalidPublisher(String),
    #[error("date folder `{0}` is not {{exec}}-{{start}}-{{end}} in YYYYMMDD")]
    InvalidDateFolder(String),
}

pub fn parse_legacy_job(watch_root: &Path, file: &Path) -> Result<ImportJob, LegacyPathError> {
    let relative = file
        .strip_prefix(watch_root)
        .map_err(|_| LegacyPathError::TooShallow)?;
    let segments = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>();
    // partner, publisher, date folder, file
    if segments.len() < 4 {
        return Err(LegacyPathError::TooShallow);
    }

    let partner = segments[0].trim();
    if partner.is_empty() {
        return Err(LegacyPathError::TooShallow);
    }
    let publisher = segments[1]
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| LegacyPathError::InvalidPublisher(segments[1].clone()))?;

    let folder = segments[2].as_str();
    let dates = folder
        .split('-')
        .map(|part| NaiveDate::parse_from_str(part, LEGACY_DATE_FORMAT))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| LegacyPathError::InvalidDateFolder(folder.to_string()))?;
    if dates.len() < 3 {
        return Err(LegacyPathError::InvalidDateFolder(folder.to_string()));
    }
    let (start, end) = (dates[1], dates[2]);

    Ok(ImportJob {
        file_path: file.display().to_string(),
        publisher,
        partner_cname: partner.to_string(),
        date: (start == end).then(|| start.format("%Y-%m-%d").to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::{ImportJob, LegacyPathError, parse_legacy_job};
    use std::path::Path;

    const ROOT: &str = "/srv/watch";

    fn parse(rel: &str) -> Result<ImportJob, LegacyPathError> {
        parse_legacy_job(Path::new(ROOT), &Path::new(ROOT).join(rel))
    }

    #[test]
    fn single_day_report_carries_its_date() {
        let job = parse("acme/12/20240502-20240501-20240501/r.csv").expect("job");
        assert_eq!(job.publisher, 12);
        assert_eq!(job.partner_cname, "acme");
        assert_eq!(job.date.as_deref(), Some("2024-05-01"));

        let payload = serde_json::to_value(&job).expect("json");
        assert_eq!(payload["filePath"], "/srv/watch/acme/12/20240502-20240501-20240501/r.csv");
        assert_eq!(payload["partnerCName"], "acme");
        assert_eq!(payload["date"], "2024-05-01");
    }

    #[test]
    fn date_range_omits_the_date_field() {
        let job = parse("acme/12/20240502-20240401-20240430/r.csv").expect("job");
        assert_eq!(job.date, None);
        let payload = serde_json::to_string(&job).expect("json");
        assert!(!payload.contains("\"date\""));
    }

    #[test]
    fn malformed_layouts_are_rejected() {
        assert_eq!(parse("acme/r.csv"), Err(LegacyPathError::TooShallow));
        assert!(matches!(
            parse("acme/pub/20240502-20240501-20240501/r.csv"),
            Err(LegacyPathError::InvalidPublisher(_))
        ));
        assert!(matches!(
            parse("acme/12/20240502-20240501/r.csv"),
            Err(LegacyPathError::InvalidDateFolder(_))
        ));
        assert!(matches!(
            parse("acme/12/2024-05-01/r.csv"),
            Err(LegacyPathError::InvalidDateFolder(_))
        ));
    }

    #[test]
    fn payload_round_trips_from_queue_json() {
        let raw = r#"{"filePath":"/w/a.csv","publisher":3,"partnerCName":"p"}"#;
        let job: ImportJob = serde_json::from_str(raw).expect("decode");
        assert_eq!(job.date, None);
        assert_eq!(job.partner_cname, "p");
    }
}
