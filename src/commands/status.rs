use crate::commands::CommandReport;
use crate::relay::config::{RelayConfig, load_config};
use crate::relay::paths::{RelayPaths, resolve_paths};
use crate::relay::queue::{QueuedLedger, SpoolQueue};
use crate::store::{SharedStore, open_store};
use anyhow::Result;
use std::env;
use std::time::Duration;

include!(concat!(env!("OUT_DIR"), "/relay_env_allowlist.rs"));

const ENV_PREFIX: &str = "RELAY_";
const PROBE_KEY: &str = "relay:status:probe";

/// Prefixed variable names that no part of the binary reads.
fn unknown_env_keys<I>(names: I, allowlist: &[&str]) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = names
        .into_iter()
        .filter(|name| name.starts_with(ENV_PREFIX) && !allowlist.contains(&name.as_str()))
        .collect::<Vec<_>>();
    out.sort();
    out
}

fn check_paths(paths: &RelayPaths, report: &mut CommandReport) {
    report.detail(format!("relay_home={}", paths.relay_home.display()));
    for (name, path) in [
        ("watch_root", &paths.watch_root),
        ("processed_dir", &paths.processed_dir),
        ("invalid_dir", &paths.invalid_dir),
        ("zip_archive_dir", &paths.zip_archive_dir),
        ("logs_dir", &paths.logs_dir),
        ("queue_dir", &paths.queue_dir),
    ] {
        if path.is_dir() {
            report.detail(format!("path.{name}=ok ({})", path.display()));
        } else {
            report.detail(format!("path.{name}=missing ({})", path.display()));
        }
    }
}

fn check_store(store: &SharedStore) -> CommandReport {
    let mut report = CommandReport::new("store");
    match store.get(PROBE_KEY) {
        Ok(_) => report.detail(format!("store={} reachable", store.describe())),
        Err(err) => report.issue(format!("store={} unreachable ({err:#})", store.describe())),
    }
    report
}

fn check_stores(cfg: &RelayConfig, report: &mut CommandReport) {
    let timeout = Duration::from_millis(cfg.lock.store_timeout_ms);
    let mut reachable = 0usize;
    for location in &cfg.lock.stores {
        match open_store(location, timeout) {
            Ok(store) => {
                let sub = check_store(&store);
                if sub.ok {
                    reachable += 1;
                }
                report.merge(sub);
            }
            Err(err) => report.issue(format!("store={location} invalid ({err:#})")),
        }
    }
    let quorum = cfg.lock.stores.len() / 2 + 1;
    report.detail(format!("lock.quorum={quorum} reachable={reachable}"));
}

fn check_import_command(cfg: &RelayConfig, report: &mut CommandReport) {
    let Some(template) = cfg.queue.import_command.as_deref() else {
        report.detail("queue.import_command=unset");
        return;
    };
    let Some(program) = template.split_whitespace().next() else {
        report.issue("queue.import_command is blank");
        return;
    };
    match which::which(program) {
        Ok(found) => report.detail(format!("queue.import_command={}", found.display())),
        Err(err) => report.issue(format!("queue.import_command={program} not found ({err})")),
    }
}

fn check_queue(paths: &RelayPaths, cfg: &RelayConfig, report: &mut CommandReport) {
    match SpoolQueue::open(&paths.queue_dir, &cfg.queue.tube).and_then(|q| q.counts()) {
        Ok((ready, reserved, buried)) => report.detail(format!(
            "queue.{}: ready={ready} reserved={reserved} buried={buried}",
            cfg.queue.tube
        )),
        Err(err) => report.issue(format!("queue unreadable ({err:#})")),
    }
    match QueuedLedger::load(&paths.queue_dir) {
        Ok(ledger) => report.detail(format!("queue.ledger={} files", ledger.recorded())),
        Err(err) => report.issue(format!("queue ledger unreadable ({err:#})")),
    }
}

pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("status");
    let paths = resolve_paths()?;
    check_paths(&paths, &mut report);

    let cfg = load_config(&paths.relay_home, &paths.store_dir)?;
    report.detail(format!(
        "config: extensions={} max_retry={} retry_expire_secs={} lock_ttl_ms={}",
        cfg.watch.supported_extensions.join(","),
        cfg.delivery.max_retry,
        cfg.delivery.retry_expire_secs,
        cfg.lock.ttl_ms
    ));
    report.detail(format!(
        "archive.timezone={}",
        cfg.archive.timezone.as_deref().unwrap_or("local")
    ));
    if cfg.api.receive_file_url.is_empty() {
        report.detail("api.receive_file_url=unset");
    } else {
        report.detail(format!("api.receive_file_url={}", cfg.api.receive_file_url));
    }

    check_stores(&cfg, &mut report);
    check_import_command(&cfg, &mut report);
    check_queue(&paths, &cfg, &mut report);

    for key in unknown_env_keys(env::vars().map(|(k, _)| k), GENERATED_RELAY_ENV_ALLOWLIST) {
        report.issue(format!("env.{key}=unknown (typo?)"));
    }
    Ok(report)
}
