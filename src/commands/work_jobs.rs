use crate::commands::{CommandReport, audit};
use crate::relay::config::load_config;
use crate::relay::legacy::ImportJob;
use crate::relay::paths::resolve_paths;
use crate::relay::queue::{JobQueue, ReservedJob, SpoolQueue};
use crate::relay::util::run_command_with_optional_timeout;
use anyhow::{Result, bail};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Split the configured command on whitespace and fill the job placeholders
/// in every argument. No shell is involved.
fn import_argv(template: &str, job: &ImportJob) -> Result<Vec<String>> {
    let publisher = job.publisher.to_string();
    let argv = template
        .split_whitespace()
        .map(|arg| {
            arg.replace("{publisher}", &publisher)
                .replace("{partner}", &job.partner_cname)
                .replace("{file}", &job.file_path)
        })
        .collect::<Vec<_>>();
    if argv.is_empty() {
        bail!("import command is empty");
    }
    Ok(argv)
}

enum JobResult {
    Done,
    Buried(String),
}

fn process(template: &str, job: &ReservedJob) -> JobResult {
    let parsed: ImportJob = match serde_json::from_str(&job.payload) {
        Ok(parsed) => parsed,
        Err(err) => return JobResult::Buried(format!("invalid payload: {err}")),
    };
    if !Path::new(&parsed.file_path).is_file() {
        return JobResult::Buried(format!("file missing: {}", parsed.file_path));
    }
    let argv = match import_argv(template, &parsed) {
        Ok(argv) => argv,
        Err(err) => return JobResult::Buried(format!("{err:#}")),
    };

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    if let Some(date) = &parsed.date {
        cmd.env("RELAY_JOB_DATE", date);
    }
    match run_command_with_optional_timeout(&mut cmd, Some(job.ttr.as_secs().max(1))) {
        Ok(output) if output.status.success() => JobResult::Done,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            JobResult::Buried(format!(
                "import command exited with {}: {}",
                output.status,
                stderr.trim()
            ))
        }
        Err(err) => JobResult::Buried(format!("import command failed: {err:#}")),
    }
}

pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("work");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths.relay_home, &paths.store_dir)?;

    let Some(template) = cfg.queue.import_command.as_deref() else {
        report.issue("queue.import_command is not configured (set RELAY_IMPORT_COMMAND)");
        return Ok(report);
    };
    let queue = SpoolQueue::open(&paths.queue_dir, &cfg.queue.tube)?;
    let limit = Duration::from_secs(cfg.queue.worker_time_limit_secs);
    let started = Instant::now();

    let mut done = 0usize;
    let mut buried = 0usize;
    while started.elapsed() < limit {
        let Some(job) = queue.reserve()? else {
            break;
        };
        match process(template, &job) {
            JobResult::Done => {
                queue.delete(&job)?;
                done += 1;
                info!(job = %job.id, "job imported");
                audit(&paths, "work", "imported", None, &job.payload);
            }
            JobResult::Buried(reason) => {
                queue.bury(&job, &reason)?;
                buried += 1;
                warn!(job = %job.id, reason = %reason, "job buried");
                audit(&paths, "work", "buried", None, &reason);
            }
        }
    }

    report.detail(format!("imported={done}"));
    report.detail(format!("buried={buried}"));
    if started.elapsed() >= limit {
        report.detail("worker time limit reached");
    }
    Ok(report)
}
