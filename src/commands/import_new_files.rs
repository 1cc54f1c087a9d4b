use crate::api::RestClient;
use crate::commands::{CommandReport, audit};
use crate::relay::archive::ArchiveMover;
use crate::relay::config::{RelayConfig, load_config};
use crate::relay::dispatcher::{Dispatcher, UnitOutcome};
use crate::relay::pairing::{MetadataRefCounts, pair_units};
use crate::relay::paths::{RelayPaths, resolve_paths};
use crate::relay::retry::RetryTracker;
use crate::relay::routing::EmailTemplate;
use crate::relay::run_lock::RunLock;
use crate::relay::scanner::Scanner;
use crate::store::{SharedStore, open_stores};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("run");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths.relay_home, &paths.store_dir)?;
    paths.prepare()?;

    let stores = open_stores(
        &cfg.lock.stores,
        Duration::from_millis(cfg.lock.store_timeout_ms),
    )?;
    let retry_store = stores
        .first()
        .cloned()
        .context("no lock store configured")?;
    let run_lock = RunLock::new(
        stores,
        cfg.lock.retry_count,
        Duration::from_millis(cfg.lock.retry_delay_ms),
    );
    let pid = std::process::id().to_string();
    let Some(lock) = run_lock.acquire(
        &cfg.lock.resource,
        Duration::from_millis(cfg.lock.ttl_ms),
        &[("pid", pid.as_str())],
    ) else {
        info!(resource = %cfg.lock.resource, "another instance is running");
        report.detail("another instance is running");
        audit(&paths, "run", "lock_busy", None, &cfg.lock.resource);
        return Ok(report);
    };
    report.detail(format!("lock.resource={}", cfg.lock.resource));

    let started = Instant::now();
    let result = import_locked(&paths, &cfg, retry_store, &mut report);
    if started.elapsed() > lock.validity {
        warn!(
            resource = %cfg.lock.resource,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run outlived the lock validity window"
        );
    }
    run_lock.release(&lock);
    result?;
    Ok(report)
}

fn import_locked(
    paths: &RelayPaths,
    cfg: &RelayConfig,
    retry_store: SharedStore,
    report: &mut CommandReport,
) -> Result<()> {
    let scanner = Scanner::new(&paths.watch_root, &paths.zip_archive_dir, &cfg.watch);
    let scan = scanner.scan();
    let mut refs = MetadataRefCounts::new();
    let units = pair_units(&scan.files, &mut refs);

    report.detail(format!("found {} new files", scan.stats.discovered));
    report.detail(format!(
        "scan: duplicates={} lock_skipped={} unsupported={} archives_expanded={} archives_failed={}",
        scan.stats.duplicates,
        scan.stats.lock_skipped,
        scan.stats.unsupported,
        scan.stats.archives_expanded,
        scan.stats.archives_failed
    ));
    if scan.stats.archives_failed > 0 {
        audit(
            paths,
            "scan",
            "archive_failed",
            None,
            &format!("{} archives could not be expanded", scan.stats.archives_failed),
        );
    }

    let api = RestClient::new(&cfg.api)?;
    let retry = RetryTracker::new(
        retry_store,
        &cfg.delivery.retry_key_prefix,
        cfg.delivery.max_retry,
        Duration::from_secs(cfg.delivery.retry_expire_secs),
    );
    let mover = ArchiveMover::new(
        paths.processed_dir.clone(),
        paths.invalid_dir.clone(),
        cfg.archive.timezone.as_deref(),
    )?;
    let dispatcher = Dispatcher::new(
        &api,
        &retry,
        &mover,
        &paths.watch_root,
        EmailTemplate::new(cfg.delivery.email_template.as_str()),
    )
    .metadata_extension(&cfg.watch.metadata_extension)
    .delete_unroutable_fetcher_files(cfg.delivery.delete_unroutable_fetcher_files);

    let mut tally: BTreeMap<&'static str, usize> = BTreeMap::new();
    for unit in &units {
        let outcome = dispatcher.dispatch(unit, &mut refs);
        let status = outcome.status();
        *tally.entry(status).or_default() += 1;
        audit(paths, "dispatch", status, outcome.path(), &outcome.describe());
        if let UnitOutcome::RetryScheduled { path, attempts, .. } = &outcome {
            report.detail(format!(
                "retry: {} (attempt {attempts}/{})",
                path.display(),
                retry.max_retry()
            ));
        }
    }

    report.detail(format!("units={}", units.len()));
    for (status, count) in tally {
        report.detail(format!("{status}={count}"));
    }
    Ok(())
}
