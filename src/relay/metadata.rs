use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use tracing::warn;

pub const REPORT_FILE_URL: &str = "reportFileUrl";
pub const DATA_SOURCE_ID: &str = "dataSourceId";
pub const PUBLISHER_ID: &str = "publisherId";
pub const INTEGRATION_CNAME: &str = "integrationCName";

/// Parsed metadata sidecar. Only a handful of keys mean anything to the
/// relay; everything else is kept as-is and forwarded with the report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    fields: Map<String, Value>,
}

fn non_empty_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Metadata {
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Read a sidecar. Unreadable or non-object content is logged and treated
    /// as an empty map so the paired report can still be routed by its path.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "metadata file unreadable");
                return Self::default();
            }
        };
        if raw.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(fields)) => Self::from_map(fields),
            Ok(_) => {
                warn!(path = %path.display(), "metadata is not a JSON object");
                Self::default()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "metadata is not valid JSON");
                Self::default()
            }
        }
    }

    pub fn report_file_url(&self) -> Option<&str> {
        self.fields
            .get(REPORT_FILE_URL)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Accepts a number or a numeric string.
    pub fn data_source_id(&self) -> Option<i64> {
        match self.fields.get(DATA_SOURCE_ID)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .filter(|id| *id > 0)
    }

    pub fn publisher_id(&self) -> Option<String> {
        self.fields.get(PUBLISHER_ID).and_then(non_empty_scalar)
    }

    pub fn integration_cname(&self) -> Option<String> {
        self.fields.get(INTEGRATION_CNAME).and_then(non_empty_scalar)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }
}
