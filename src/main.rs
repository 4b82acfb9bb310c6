//! Stash - Kubernetes-native backup orchestrator

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stash::commands::backup::{self, BackupArgs};
use stash::commands::check::{self, CheckArgs};
use stash::commands::create_vs::{self, CreateVsArgs};
use stash::commands::restore::{self, RestoreArgs};
use stash::commands::run::{self, RunArgs};
use stash::commands::run_backup::{self, RunBackupArgs};
use stash::crd::all_crds;

/// Stash - restic backups for Kubernetes workloads
#[derive(Parser, Debug)]
#[command(name = "stash", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    ///
    /// Watches workloads and BackupConfigurations and keeps the backup
    /// sidecar injected exactly where a configuration selects it.
    Run(RunArgs),

    /// Sidecar: run the configuration's cron schedule, or one backup with --offline
    Backup(BackupArgs),

    /// Sidecar: execute BackupSessions of one configuration for this host
    RunBackup(RunBackupArgs),

    /// Job: snapshot the target workload's PVCs for a BackupSession
    CreateVs(CreateVsArgs),

    /// Job: verify a Repository and refresh its status
    Check(CheckArgs),

    /// Init container: restore this host's data from a RestoreSession
    Restore(RestoreArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let manifests = all_crds()
            .iter()
            .map(serde_yaml::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{}", manifests.join("---\n"));
        return Ok(());
    }

    let result = match cli.command {
        Some(Commands::Run(args)) => run::run(args).await,
        Some(Commands::Backup(args)) => backup::run(args).await,
        Some(Commands::RunBackup(args)) => run_backup::run(args).await,
        Some(Commands::CreateVs(args)) => create_vs::run(args).await,
        Some(Commands::Check(args)) => check::run(args).await,
        Some(Commands::Restore(args)) => restore::run(args).await,
        None => anyhow::bail!("no subcommand given, see --help"),
    };
    result.map_err(anyhow::Error::from)
}
