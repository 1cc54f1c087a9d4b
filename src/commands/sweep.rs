use crate::commands::{CommandReport, audit};
use crate::relay::config::load_config;
use crate::relay::paths::resolve_paths;
use crate::relay::sweep::sweep_incompatible;
use anyhow::Result;

pub fn run(delete: bool) -> Result<CommandReport> {
    let mut report = CommandReport::new("sweep");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths.relay_home, &paths.store_dir)?;

    let outcome = sweep_incompatible(&paths.processed_dir, &cfg.watch, delete)?;
    report.detail(format!("root={}", paths.processed_dir.display()));
    report.detail(format!("incompatible={}", outcome.incompatible.len()));
    for path in &outcome.incompatible {
        report.detail(format!("file={}", path.display()));
    }
    if delete {
        report.detail(format!("deleted={}", outcome.deleted));
        report.detail(format!("pruned_dirs={}", outcome.pruned_dirs));
        for path in outcome.incompatible.iter().filter(|p| !p.exists()) {
            audit(&paths, "sweep", "deleted", Some(path.as_path()), "incompatible extension");
        }
        if outcome.deleted < outcome.incompatible.len() {
            report.issue(format!(
                "{} incompatible files could not be deleted",
                outcome.incompatible.len() - outcome.deleted
            ));
        }
    }
    Ok(report)
}
