use crate::error::RelayError;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const PUBLISHER_ID_MACRO: &str = "$PUBLISHER_ID$";
pub const TOKEN_MACRO: &str = "$TOKEN$";
const DEFAULT_QUEUE_TTR_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub supported_extensions: Vec<String>,
    pub metadata_extension: String,
    pub lock_marker_extension: String,
    pub archive_extensions: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            supported_extensions: vec![
                "csv".to_string(),
                "xls".to_string(),
                "xlsx".to_string(),
                "json".to_string(),
            ],
            metadata_extension: "meta".to_string(),
            lock_marker_extension: "lock".to_string(),
            archive_extensions: vec!["zip".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub email_template: String,
    pub max_retry: u32,
    pub retry_expire_secs: u64,
    pub retry_key_prefix: String,
    pub delete_unroutable_fetcher_files: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            email_template: "pub$PUBLISHER_ID$.$TOKEN$@unified-report.dev".to_string(),
            max_retry: 5,
            retry_expire_secs: 86_400,
            retry_key_prefix: "retry_cycle".to_string(),
            delete_unroutable_fetcher_files: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub resource: String,
    pub ttl_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    /// `redis://host:port`, `file:///dir` or a bare directory path. Empty
    /// means a single file store under the relay home.
    pub stores: Vec<String>,
    pub store_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            resource: "ur:post_files_to_unified_report_api".to_string(),
            ttl_ms: 3_600_000,
            retry_count: 3,
            retry_delay_ms: 200,
            stores: Vec::new(),
            store_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub username: String,
    pub password: String,
    pub token_url: String,
    pub data_sources_by_email_url: String,
    pub data_sources_by_integration_url: String,
    pub receive_file_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            token_url: String::new(),
            data_sources_by_email_url: String::new(),
            data_sources_by_integration_url: String::new(),
            receive_file_url: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ArchiveConfig {
    /// IANA timezone for the dated archive folders; local time when unset.
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub tube: String,
    pub priority: u32,
    pub delay_secs: u64,
    pub ttr_secs: u64,
    pub import_command: Option<String>,
    pub worker_time_limit_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tube: "unified-report-files".to_string(),
            priority: 1024,
            delay_secs: 0,
            ttr_secs: DEFAULT_QUEUE_TTR_SECS,
            import_command: None,
            worker_time_limit_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    pub watch: WatchConfig,
    pub delivery: DeliveryConfig,
    pub lock: LockConfig,
    pub api: ApiConfig,
    pub archive: ArchiveConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRelayConfig {
    watch: Option<WatchConfig>,
    delivery: Option<DeliveryConfig>,
    lock: Option<LockConfig>,
    api: Option<ApiConfig>,
    archive: Option<ArchiveConfig>,
    queue: Option<QueueConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_optional_string(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

fn normalize_extensions(list: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for raw in list {
        let ext = raw.trim().trim_start_matches('.').to_ascii_lowercase();
        if !ext.is_empty() && !out.contains(&ext) {
            out.push(ext);
        }
    }
    out
}

pub fn validate(cfg: &RelayConfig) -> Result<(), RelayError> {
    let template = &cfg.delivery.email_template;
    if !template.contains(PUBLISHER_ID_MACRO) || !template.contains(TOKEN_MACRO) {
        return Err(RelayError::InvalidConfig(format!(
            "email template `{template}` is missing {PUBLISHER_ID_MACRO} or {TOKEN_MACRO} macro"
        )));
    }
    if cfg.watch.supported_extensions.is_empty() {
        return Err(RelayError::InvalidConfig(
            "supported extensions must list at least one report extension".to_string(),
        ));
    }
    if cfg.watch.metadata_extension.trim().is_empty() {
        return Err(RelayError::InvalidConfig(
            "metadata extension cannot be empty".to_string(),
        ));
    }
    if cfg.watch.lock_marker_extension.trim().is_empty() {
        return Err(RelayError::InvalidConfig(
            "lock marker extension cannot be empty".to_string(),
        ));
    }
    if cfg.delivery.max_retry == 0 {
        return Err(RelayError::InvalidConfig(
            "max retry must be >= 1".to_string(),
        ));
    }
    if cfg.delivery.retry_expire_secs == 0 {
        return Err(RelayError::InvalidConfig(
            "retry expiry must be >= 1 second".to_string(),
        ));
    }
    if cfg.lock.ttl_ms == 0 {
        return Err(RelayError::InvalidConfig("lock ttl must be > 0".to_string()));
    }
    if cfg.lock.retry_count == 0 {
        return Err(RelayError::InvalidConfig(
            "lock retry count must be >= 1".to_string(),
        ));
    }
    if cfg.lock.stores.is_empty() {
        return Err(RelayError::InvalidConfig(
            "at least one lock store is required".to_string(),
        ));
    }
    if let Some(tz) = &cfg.archive.timezone
        && tz.parse::<chrono_tz::Tz>().is_err()
    {
        return Err(RelayError::InvalidConfig(format!(
            "archive timezone `{tz}` is not a known IANA zone"
        )));
    }
    if cfg.queue.tube.trim().is_empty() {
        return Err(RelayError::InvalidConfig(
            "queue tube cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn resolve_config_path(relay_home: &Path) -> PathBuf {
    if let Ok(custom) = env::var("RELAY_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    relay_home.join("relay.toml")
}

fn merge_file_config(base: &mut RelayConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: PartialRelayConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse relay config {}: {err}", path.display()))?;
    if let Some(watch) = parsed.watch {
        base.watch = watch;
    }
    if let Some(delivery) = parsed.delivery {
        base.delivery = delivery;
    }
    if let Some(lock) = parsed.lock {
        base.lock = lock;
    }
    if let Some(api) = parsed.api {
        base.api = api;
    }
    if let Some(archive) = parsed.archive {
        base.archive = archive;
    }
    if let Some(queue) = parsed.queue {
        base.queue = queue;
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut RelayConfig) {
    cfg.watch.supported_extensions =
        env_or_csv("RELAY_SUPPORTED_EXTENSIONS", &cfg.watch.supported_extensions);

    cfg.delivery.email_template =
        env_or_string("RELAY_EMAIL_TEMPLATE", &cfg.delivery.email_template);
    cfg.delivery.max_retry = env_or_u32("RELAY_MAX_RETRY", cfg.delivery.max_retry);
    cfg.delivery.retry_expire_secs =
        env_or_u64("RELAY_RETRY_EXPIRE_SECS", cfg.delivery.retry_expire_secs);
    cfg.delivery.delete_unroutable_fetcher_files = env_or_bool(
        "RELAY_DELETE_UNROUTABLE_FETCHER_FILES",
        cfg.delivery.delete_unroutable_fetcher_files,
    );

    cfg.lock.resource = env_or_string("RELAY_LOCK_RESOURCE", &cfg.lock.resource);
    cfg.lock.ttl_ms = env_or_u64("RELAY_LOCK_TTL_MS", cfg.lock.ttl_ms);
    cfg.lock.retry_count = env_or_u32("RELAY_LOCK_RETRY_COUNT", cfg.lock.retry_count);
    cfg.lock.retry_delay_ms = env_or_u64("RELAY_LOCK_RETRY_DELAY_MS", cfg.lock.retry_delay_ms);
    cfg.lock.stores = env_or_csv("RELAY_LOCK_STORES", &cfg.lock.stores);

    cfg.api.username = env_or_string("RELAY_API_USERNAME", &cfg.api.username);
    cfg.api.password = env_or_string("RELAY_API_PASSWORD", &cfg.api.password);
    cfg.api.token_url = env_or_string("RELAY_API_TOKEN_URL", &cfg.api.token_url);
    cfg.api.data_sources_by_email_url = env_or_string(
        "RELAY_API_EMAIL_LOOKUP_URL",
        &cfg.api.data_sources_by_email_url,
    );
    cfg.api.data_sources_by_integration_url = env_or_string(
        "RELAY_API_INTEGRATION_LOOKUP_URL",
        &cfg.api.data_sources_by_integration_url,
    );
    cfg.api.receive_file_url =
        env_or_string("RELAY_API_RECEIVE_FILE_URL", &cfg.api.receive_file_url);
    cfg.api.request_timeout_secs =
        env_or_u64("RELAY_API_TIMEOUT_SECS", cfg.api.request_timeout_secs);

    cfg.archive.timezone =
        env_or_optional_string("RELAY_ARCHIVE_TIMEZONE", cfg.archive.timezone.take());

    cfg.queue.tube = env_or_string("RELAY_QUEUE_TUBE", &cfg.queue.tube);
    cfg.queue.priority = env_or_u32("RELAY_QUEUE_PRIORITY", cfg.queue.priority);
    cfg.queue.delay_secs = env_or_u64("RELAY_QUEUE_DELAY_SECS", cfg.queue.delay_secs);
    cfg.queue.ttr_secs = env_or_u64("RELAY_QUEUE_TTR_SECS", cfg.queue.ttr_secs);
    cfg.queue.import_command =
        env_or_optional_string("RELAY_IMPORT_COMMAND", cfg.queue.import_command.take());
    cfg.queue.worker_time_limit_secs = env_or_u64(
        "RELAY_WORKER_TIME_LIMIT_SECS",
        cfg.queue.worker_time_limit_secs,
    );
}

/// Fill the values that depend on resolved paths and tidy user input.
fn finalize(cfg: &mut RelayConfig, store_dir: &Path) {
    let metadata_ext = cfg
        .watch
        .metadata_extension
        .trim()
        .trim_start_matches('.')
        .to_ascii_lowercase();
    cfg.watch.supported_extensions = normalize_extensions(&cfg.watch.supported_extensions)
        .into_iter()
        .filter(|ext| *ext != metadata_ext)
        .collect();
    cfg.watch.archive_extensions = normalize_extensions(&cfg.watch.archive_extensions);
    cfg.watch.metadata_extension = metadata_ext;
    cfg.watch.lock_marker_extension = cfg
        .watch
        .lock_marker_extension
        .trim()
        .trim_start_matches('.')
        .to_ascii_lowercase();

    if cfg.lock.stores.is_empty() {
        cfg.lock.stores = vec![format!("file://{}", store_dir.display())];
    }
    if cfg.queue.ttr_secs == 0 {
        cfg.queue.ttr_secs = DEFAULT_QUEUE_TTR_SECS;
    }
}

pub fn load_config(relay_home: &Path, store_dir: &Path) -> Result<RelayConfig> {
    let mut cfg = RelayConfig::default();
    merge_file_config(&mut cfg, &resolve_config_path(relay_home))?;
    apply_env_overrides(&mut cfg);
    finalize(&mut cfg, store_dir);
    validate(&cfg)?;
    Ok(cfg)
}
