use crate::commands::{self, CommandReport};
use crate::commands::data_sources::Lookup;
use crate::logging;
use anyhow::{Result, anyhow};
use clap::{ArgGroup, Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "report-relay", version)]
#[command(about = "Deliver partner report drops to the unified reporting API", long_about = None)]
pub struct Cli {
    /// Print the command report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug-level logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan the watch root once and deliver every new report
    Run,
    /// Show paths, config, store reachability and queue depth
    Status,
    /// Queue files found in the legacy layout for the import worker
    Enqueue,
    /// Drain the import queue through the configured import command
    Work,
    /// List files in the processed area with unsupported extensions
    Sweep {
        /// Delete them and prune the folders left empty
        #[arg(long)]
        delete: bool,
    },
    /// Look up the data sources a publisher routes to
    DataSources(DataSourcesArgs),
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("lookup").required(true).args(["email", "integration"])))]
struct DataSourcesArgs {
    #[arg(long)]
    publisher: u64,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    integration: Option<String>,
}

impl DataSourcesArgs {
    fn lookup(self) -> Result<(u64, Lookup)> {
        match (self.email, self.integration) {
            (Some(email), None) => Ok((self.publisher, Lookup::Email(email))),
            (None, Some(cname)) => Ok((self.publisher, Lookup::Integration(cname))),
            _ => Err(anyhow!("pass exactly one of --email or --integration")),
        }
    }
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "{}: {}",
        report.command,
        if report.ok { "ok" } else { "failed" }
    );
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  issue: {issue}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let report = match cli.command {
        Command::Run => commands::import_new_files::run()?,
        Command::Status => commands::status::run()?,
        Command::Enqueue => commands::enqueue_jobs::run()?,
        Command::Work => commands::work_jobs::run()?,
        Command::Sweep { delete } => commands::sweep::run(delete)?,
        Command::DataSources(args) => {
            let (publisher, lookup) = args.lookup()?;
            commands::data_sources::run(publisher, lookup)?
        }
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        return Err(anyhow!(
            "{} finished with {} issue(s)",
            report.command,
            report.issues.len()
        ));
    }
    Ok(())
}
