use crate::api::{ReportApi, RestClient};
use crate::commands::CommandReport;
use crate::relay::config::load_config;
use crate::relay::paths::resolve_paths;
use anyhow::Result;

/// How to look destinations up.
#[derive(Debug, Clone)]
pub enum Lookup {
    Email(String),
    Integration(String),
}

pub fn run(publisher: u64, lookup: Lookup) -> Result<CommandReport> {
    let mut report = CommandReport::new("data-sources");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths.relay_home, &paths.store_dir)?;
    let api = RestClient::new(&cfg.api)?;

    let found = match &lookup {
        Lookup::Email(email) => {
            report.detail(format!("email={email}"));
            api.data_sources_by_email(publisher, email)
        }
        Lookup::Integration(cname) => {
            report.detail(format!("integration={cname}"));
            api.data_sources_by_integration(publisher, cname)
        }
    };
    report.detail(format!("publisher={publisher}"));

    match found {
        Ok(ids) if ids.is_empty() => report.detail("data_sources=none"),
        Ok(ids) => report.detail(format!(
            "data_sources={}",
            ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
        )),
        Err(err) => report.issue(format!("lookup failed: {err:#}")),
    }
    Ok(report)
}
