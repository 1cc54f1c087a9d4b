use crate::commands::{CommandReport, audit};
use crate::relay::config::load_config;
use crate::relay::legacy::parse_legacy_job;
use crate::relay::paths::resolve_paths;
use crate::relay::queue::{JobQueue, QueuedLedger, SpoolQueue};
use crate::relay::scanner::{FileClass, ScanStats, Scanner};
use crate::relay::util::file_hash;
use anyhow::Result;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("enqueue");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths.relay_home, &paths.store_dir)?;
    paths.prepare()?;

    let queue = SpoolQueue::open(&paths.queue_dir, &cfg.queue.tube)?;
    let mut ledger = QueuedLedger::load(&paths.queue_dir)?;
    let scanner = Scanner::new(&paths.watch_root, &paths.zip_archive_dir, &cfg.watch)
        .exclude(&paths.queue_dir);

    let mut stats = ScanStats::default();
    scanner.expand_archives(&mut stats);
    let files = scanner.walk_files();
    let locked = scanner.lock_marked_dirs(&files);

    let mut seen = HashSet::new();
    let mut queued = 0usize;
    let mut duplicates = 0usize;
    let mut rejected = 0usize;
    for path in files {
        if scanner.classify(&path) != FileClass::Report {
            continue;
        }
        if path.parent().is_some_and(|dir| locked.contains(dir)) {
            debug!(path = %path.display(), "lock-marked directory skipped");
            continue;
        }
        let hash = match file_hash(&path) {
            Ok(hash) => hash,
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "file unreadable, not queued");
                continue;
            }
        };
        if ledger.contains(&hash) || !seen.insert(hash.clone()) {
            duplicates += 1;
            continue;
        }

        let job = match parse_legacy_job(&paths.watch_root, &path) {
            Ok(job) => job,
            Err(err) => {
                rejected += 1;
                warn!(path = %path.display(), reason = %err, "file not queued");
                audit(&paths, "enqueue", "skipped", Some(path.as_path()), &err.to_string());
                continue;
            }
        };
        let payload = serde_json::to_string(&job)?;
        let id = queue.put(
            &payload,
            cfg.queue.priority,
            Duration::from_secs(cfg.queue.delay_secs),
            Duration::from_secs(cfg.queue.ttr_secs),
        )?;
        ledger.record(&hash, &path)?;
        queued += 1;
        info!(path = %path.display(), job = %id, publisher = job.publisher, partner = %job.partner_cname, "file queued");
        audit(&paths, "enqueue", "queued", Some(path.as_path()), &id);
    }

    report.detail(format!("found {queued} new files and {duplicates} duplications"));
    report.detail(format!("queue.tube={}", cfg.queue.tube));
    if rejected > 0 {
        report.detail(format!("rejected={rejected}"));
    }
    if stats.archives_expanded > 0 || stats.archives_failed > 0 {
        report.detail(format!(
            "archives_expanded={} archives_failed={}",
            stats.archives_expanded, stats.archives_failed
        ));
    }
    Ok(report)
}
