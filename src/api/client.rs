use super::{DestinationResult, ReportApi, SubmitResult};
use crate::error::RelayError;
use crate::relay::config::ApiConfig;
use crate::relay::metadata::Metadata;
use crate::relay::routing::SourceModule;
use crate::relay::util::extension_lowercase;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response, multipart};
use serde_json::Value;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

const DOWNLOAD_CHUNK_BYTES: usize = 8 * 1024;
const NGINX_413_MARKER: &str = "<head><title>413";
const FALLBACK_EXTENSION: &str = "bin";

/// Bearer-token REST client. The token is fetched lazily, reused for every
/// call, and refreshed once when a call comes back 401.
pub struct RestClient {
    http: Client,
    cfg: ApiConfig,
    token: Mutex<Option<String>>,
}

impl RestClient {
    pub fn new(cfg: &ApiConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs.max(1)))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            cfg: cfg.clone(),
            token: Mutex::new(None),
        })
    }

    fn token(&self, force: bool) -> Result<String> {
        let mut cached = self.token.lock().unwrap_or_else(|p| p.into_inner());
        if !force && let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let response = self
            .http
            .post(&self.cfg.token_url)
            .form(&[
                ("username", self.cfg.username.as_str()),
                ("password", self.cfg.password.as_str()),
            ])
            .send()
            .with_context(|| format!("token request to {} failed", self.cfg.token_url))?;
        let body: Value = response.json().context("token response is not JSON")?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                RelayError::Api(format!("could not authenticate user {}", self.cfg.username))
            })?
            .to_string();
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Send an authenticated request, retrying once with a fresh token on 401.
    fn send_authorized(&self, build: impl Fn(&str) -> Result<RequestBuilder>) -> Result<Response> {
        let response = build(&self.token(false)?)?.send()?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        debug!("token rejected, refreshing");
        Ok(build(&self.token(true)?)?.send()?)
    }

    fn lookup(&self, url: &str, publisher_id: u64, key: &str, value: &str) -> Result<Vec<i64>> {
        let publisher = publisher_id.to_string();
        let response = self
            .send_authorized(|token| {
                Ok(self
                    .http
                    .get(url)
                    .bearer_auth(token)
                    .query(&[("publisher", publisher.as_str()), (key, value)]))
            })
            .with_context(|| format!("data source lookup by {key} failed"))?;
        let body: Value = response
            .json()
            .with_context(|| format!("data source lookup by {key} returned invalid JSON"))?;
        parse_data_source_ids(&body)
    }
}

impl ReportApi for RestClient {
    fn data_sources_by_email(&self, publisher_id: u64, email: &str) -> Result<Vec<i64>> {
        self.lookup(&self.cfg.data_sources_by_email_url, publisher_id, "email", email)
    }

    fn data_sources_by_integration(
        &self,
        publisher_id: u64,
        integration: &str,
    ) -> Result<Vec<i64>> {
        self.lookup(
            &self.cfg.data_sources_by_integration_url,
            publisher_id,
            "integration",
            integration,
        )
    }

    fn submit(
        &self,
        file: &Path,
        metadata: &Metadata,
        data_source_ids: &[i64],
        module: SourceModule,
    ) -> Result<SubmitResult> {
        let ids = serde_json::to_string(data_source_ids)?;
        let meta = metadata.to_json();
        let response = self
            .send_authorized(|token| {
                let form = multipart::Form::new()
                    .text("source", module.api_source())
                    .text("ids", ids.clone())
                    .text("metadata", meta.clone())
                    .file("file_content", file)
                    .with_context(|| format!("failed to attach {}", file.display()))?;
                Ok(self
                    .http
                    .post(&self.cfg.receive_file_url)
                    .bearer_auth(token)
                    .multipart(form))
            })
            .with_context(|| format!("posting {} failed", file.display()))?;

        let status = response.status().as_u16();
        let body = response.text().context("failed to read submit response")?;
        interpret_submit_response(status, &body, data_source_ids.len())
    }

    fn download(&self, url: &str, dest_stem: &Path) -> Result<PathBuf> {
        let mut response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("download of {url} failed"))?;
        if !response.status().is_success() {
            anyhow::bail!("download of {url} failed with status {}", response.status());
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        let dest = download_destination(dest_stem, &infer_extension(url, content_type.as_deref()));
        let dir = dest
            .parent()
            .with_context(|| format!("{} has no parent directory", dest.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to stage download in {}", dir.display()))?;
        let mut buf = [0u8; DOWNLOAD_CHUNK_BYTES];
        loop {
            let n = response
                .read(&mut buf)
                .with_context(|| format!("download of {url} interrupted"))?;
            if n == 0 {
                break;
            }
            tmp.write_all(&buf[..n])?;
        }
        tmp.persist(&dest)
            .with_context(|| format!("failed to write {}", dest.display()))?;
        Ok(dest)
    }
}

/// Lookup bodies are a list of objects carrying an `id`; an object with a
/// non-200 `code` is an error.
pub fn parse_data_source_ids(body: &Value) -> Result<Vec<i64>> {
    if let Some(code) = body.get("code").and_then(Value::as_i64)
        && code != 200
    {
        anyhow::bail!("data source lookup failed, code {code}");
    }
    let Some(items) = body.as_array() else {
        return Ok(Vec::new());
    };
    Ok(items
        .iter()
        .filter_map(|item| match item.get("id")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        })
        .collect())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn scalar_or_unknown(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => "unknown".to_string(),
    }
}

/// Each destination entry is a list whose first element carries `status`,
/// `dataSource` and `message`. Entries without a `status` are ignored.
pub fn interpret_submit_response(
    http_status: u16,
    body: &str,
    requested: usize,
) -> Result<SubmitResult> {
    if http_status == 413 || body.contains(NGINX_413_MARKER) {
        return Ok(SubmitResult {
            status_code: 413,
            too_large: true,
            requested,
            destinations: Vec::new(),
        });
    }

    let parsed: Value = serde_json::from_str(body)
        .with_context(|| format!("submit response is not JSON (HTTP {http_status})"))?;

    let body_code = parsed
        .get("code")
        .and_then(Value::as_u64)
        .and_then(|c| u16::try_from(c).ok());
    let status_code = match body_code {
        Some(code) => code,
        None if (200..300).contains(&http_status) => 200,
        None => http_status,
    };

    let entries: Vec<&Value> = match &parsed {
        Value::Array(items) => items.iter().collect(),
        Value::Object(fields) => fields.values().collect(),
        _ => Vec::new(),
    };
    let destinations = entries
        .into_iter()
        .filter_map(|entry| entry.as_array()?.first())
        .filter_map(|first| {
            let status = first.get("status")?;
            Some(DestinationResult {
                data_source: scalar_or_unknown(first.get("dataSource")),
                ok: truthy(status),
                message: scalar_or_unknown(first.get("message")),
            })
        })
        .collect();

    Ok(SubmitResult {
        status_code,
        too_large: false,
        requested,
        destinations,
    })
}

/// Extension from the URL path, else from the content type, else `bin`.
pub fn infer_extension(url: &str, content_type: Option<&str>) -> String {
    let from_path = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments()?.next_back().map(ToOwned::to_owned))
        .and_then(|name| extension_lowercase(Path::new(&name)))
        .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    if let Some(ext) = from_path {
        return ext;
    }

    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match mime.as_str() {
        "text/csv" | "application/csv" => "csv",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/json" => "json",
        "application/zip" | "application/x-zip-compressed" => "zip",
        _ => FALLBACK_EXTENSION,
    }
    .to_string()
}

/// `remote.meta` becomes `remote.csv`; `remote.csv.meta` stays `remote.csv`
/// rather than doubling the extension. A file already at that path is never
/// overwritten: the download lands at `remote-1.csv`, `remote-2.csv`, ...
pub fn download_destination(dest_stem: &Path, ext: &str) -> PathBuf {
    let base = if extension_lowercase(dest_stem).as_deref() == Some(ext) {
        dest_stem.with_extension("")
    } else {
        dest_stem.to_path_buf()
    };
    let with_suffix = |suffix: String| {
        let mut name = base.as_os_str().to_owned();
        name.push(suffix);
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    };

    let mut candidate = with_suffix(String::new());
    let mut n = 1u32;
    while candidate.exists() {
        candidate = with_suffix(format!("-{n}"));
        n += 1;
    }
    candidate
}
