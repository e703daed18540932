//! env-restore - Main entry point

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use env_restore::access::kubectl::Kubectl;
use env_restore::access::SharedAccess;
use env_restore::archive::TimeFilter;
use env_restore::config::Config;
use env_restore::orchestrator::picker::{self, LatestConsistent};
use env_restore::orchestrator::{Orchestrator, Selection};
use env_restore::service::rpc::HttpServiceClient;
use env_restore::transfer::progress::spawn_reporter;
use env_restore::utils;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "env-restore.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List snapshot candidates of an environment, newest first
    List {
        #[arg(long)]
        env: String,

        /// Maximum candidates shown
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[command(flatten)]
        select: SelectArgs,
    },

    /// Ask every service of an environment to take a backup
    Snap {
        #[arg(long)]
        env: String,
    },

    /// Copy a snapshot from one environment's archives to another's
    Copy {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,

        #[command(flatten)]
        select: SelectArgs,
    },

    /// Restore a snapshot into another environment's live services
    Restore {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,

        #[command(flatten)]
        select: SelectArgs,
    },
}

#[derive(Args, Debug)]
struct SelectArgs {
    /// Only consider backups strictly older than this RFC3339 instant
    #[arg(long, value_name = "RFC3339")]
    before: Option<DateTime<Utc>>,

    /// Calendar filter, e.g. `weekday=sun,hour=3`
    #[arg(long)]
    filter: Option<TimeFilter>,

    /// Accept incomplete or time-skewed snapshots
    #[arg(long)]
    allow_inconsistent: bool,
}

impl SelectArgs {
    fn selection(&self) -> Selection {
        Selection {
            before: self.before,
            filter: self.filter.clone(),
        }
    }

    fn picker(&self) -> LatestConsistent {
        LatestConsistent {
            allow_inconsistent: self.allow_inconsistent,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting env-restore v{}", env!("CARGO_PKG_VERSION"));

    let remote: SharedAccess = Some(Arc::new(Kubectl::new(
        config.kube.kubectl.clone(),
        config.kube.context.clone(),
        config.kube.ssh.clone(),
    )));
    let rpc = Arc::new(HttpServiceClient::new(config.rpc.timeout())?);
    let orchestrator = Orchestrator::new(
        remote,
        rpc,
        config.transfer.options(),
        config.fetch.options(),
    )
    .with_max_parallel_files(config.transfer.max_parallel_files);

    let cancel = CancellationToken::new();
    let reporter = spawn_reporter(
        orchestrator.progress().clone(),
        config.transfer.report_interval(),
        cancel.clone(),
    );

    let result = run(&cli.command, &config, &orchestrator).await;

    cancel.cancel();
    let _ = reporter.await;

    result
}

async fn run(command: &Command, config: &Config, orchestrator: &Orchestrator) -> Result<()> {
    match command {
        Command::List { env, limit, select } => {
            let environment = config.environment(env)?;
            let candidates = orchestrator
                .list(&environment.archives, &select.selection(), *limit)
                .await?;

            if candidates.is_empty() {
                println!("No snapshot candidates in {env}");
            }
            for (index, candidate) in candidates.iter().enumerate() {
                println!(
                    "#{index} {} [{}]",
                    candidate
                        .newest()
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default(),
                    picker::problems(candidate)
                );
                for file in candidate.files() {
                    println!("    {:<24} {}", file.archive, file.location);
                }
            }
        }
        Command::Snap { env } => {
            let services = config.environment(env)?.service_set()?;
            let count = orchestrator.env_snap(&services).await?;
            tracing::info!("Backups triggered on {} endpoints", count);
        }
        Command::Copy { from, to, select } => {
            let source = config.environment(from)?;
            let destination = config.environment(to)?;
            orchestrator
                .env_copy(
                    &source.archives,
                    &destination.archives,
                    &select.picker(),
                    &select.selection(),
                )
                .await?;
        }
        Command::Restore { from, to, select } => {
            let source = config.environment(from)?;
            let services = config.environment(to)?.service_set()?;
            orchestrator
                .env_restore(
                    &source.archives,
                    &services,
                    &select.picker(),
                    &select.selection(),
                )
                .await?;
        }
    }
    Ok(())
}
