use crate::relay::config::{PUBLISHER_ID_MACRO, TOKEN_MACRO};
use serde::Serialize;
use std::fmt;
use std::path::{Component, Path};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceModule {
    Email,
    Fetcher,
}

impl SourceModule {
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "email" => Some(Self::Email),
            "fetcher" => Some(Self::Fetcher),
            _ => None,
        }
    }

    /// Value of the multipart `source` field.
    pub fn api_source(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Fetcher => "integration",
        }
    }
}

impl fmt::Display for SourceModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Email => "email",
            Self::Fetcher => "fetcher",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingParameters {
    pub publisher_id: u64,
    /// Partner canonical name for fetcher drops, webhook token for email drops.
    pub partner: String,
    pub module: SourceModule,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("path is too shallow below the watch root")]
    Malformed,
    #[error("unsupported source module `{0}`")]
    UnsupportedModule(String),
    #[error("publisher id `{0}` is not a positive integer")]
    InvalidPublisher(String),
    #[error("partner segment is empty")]
    MissingPartner,
}

/// Derive routing from `{publisherId}/{partnerOrToken}/{module}/...` relative
/// to the watch root. Deeper nesting below the module directory (for example
/// a folder created by zip expansion) is allowed.
pub fn parse_routing(watch_root: &Path, file: &Path) -> Result<RoutingParameters, RoutingError> {
    let relative = file.strip_prefix(watch_root).map_err(|_| RoutingError::Malformed)?;
    let segments = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>();
    if segments.len() < 2 {
        return Err(RoutingError::Malformed);
    }
    // the last segment is the file itself
    let dirs = &segments[..segments.len() - 1];

    let publisher_raw = segments[0].trim();
    let publisher_id = publisher_raw
        .parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| RoutingError::InvalidPublisher(publisher_raw.to_string()))?;

    let partner = dirs.get(1).map(|s| s.trim()).unwrap_or_default();
    if partner.is_empty() {
        return Err(RoutingError::MissingPartner);
    }

    let module_raw = dirs.get(2).map(|s| s.trim()).unwrap_or_default();
    let module = SourceModule::from_segment(module_raw)
        .ok_or_else(|| RoutingError::UnsupportedModule(module_raw.to_string()))?;

    Ok(RoutingParameters {
        publisher_id,
        partner: partner.to_string(),
        module,
    })
}

/// Recipient address template for webhook drops, checked at config load to
/// carry both macros.
#[derive(Debug, Clone)]
pub struct EmailTemplate(String);

impl EmailTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn render(&self, publisher_id: u64, token: &str) -> String {
        self.0
            .replace(PUBLISHER_ID_MACRO, &publisher_id.to_string())
            .replace(TOKEN_MACRO, token)
    }
}
