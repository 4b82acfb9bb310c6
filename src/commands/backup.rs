//! `stash backup`: the sidecar's scheduled backup driver
//!
//! Watches the sidecar's own BackupConfiguration and keeps the in-process
//! cron table in line with its schedule. With `--offline` it runs a single
//! backup and exits instead.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::Api;
use tracing::{info, warn};

use super::CommonArgs;
use crate::context::AppContext;
use crate::crd::BackupConfiguration;
use crate::scheduler::{BackupRunner, CronScheduler};
use crate::watch::handle_configuration_event;
use crate::workload::WorkloadKind;
use crate::Result;

/// Sidecar backup arguments
#[derive(clap::Args, Debug, Clone)]
pub struct BackupArgs {
    /// BackupConfiguration this sidecar serves
    #[arg(long = "backup-configuration")]
    pub backup_configuration: String,

    /// Kind of the workload the sidecar runs in
    #[arg(long)]
    pub workload_kind: WorkloadKind,

    /// Name of the workload the sidecar runs in
    #[arg(long)]
    pub workload_name: String,

    /// Namespace of the workload
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    /// Run one backup now and exit
    #[arg(long)]
    pub offline: bool,

    /// Shared flags
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Re-read the configuration and reconcile the cron table with it
pub async fn resync_schedule(
    app: &AppContext,
    scheduler: &CronScheduler,
    namespace: &str,
    name: &str,
) -> Result<()> {
    match app.store.get_backup_configuration(namespace, name).await? {
        Some(config) => handle_configuration_event(scheduler, watcher::Event::Apply(config)).await,
        None => {
            scheduler.unschedule(&format!("{namespace}/{name}"));
            Ok(())
        }
    }
}

/// Run the scheduled backup driver, or one backup with `--offline`
pub async fn run(args: BackupArgs) -> Result<()> {
    let (client, app) = args.common.sidecar_context().await?;
    let host = app.host_identity(args.workload_kind, &args.workload_name)?;
    let (namespace, name) = (args.namespace.as_str(), args.backup_configuration.as_str());
    info!(
        namespace,
        config = name,
        hostname = %host.hostname,
        offline = args.offline,
        "Starting backup driver"
    );
    let executor = Arc::new(app.backup_executor(host));

    if args.offline {
        return executor.run_once(namespace, name, Utc::now()).await;
    }

    let scheduler = CronScheduler::new(executor, app.reporter());
    let api: Api<BackupConfiguration> = Api::namespaced(client, namespace);
    let watch_config = WatcherConfig::default()
        .fields(&format!("metadata.name={name}"))
        .timeout(25);
    let mut events = watcher::watcher(api, watch_config).default_backoff().boxed();
    let mut resync = tokio::time::interval(app.options.resync_period);
    resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    if let Err(e) = handle_configuration_event(&scheduler, event).await {
                        warn!(error = %e, "Failed to apply configuration change");
                    }
                }
                Some(Err(e)) => warn!(error = %e, "BackupConfiguration watch error, will retry"),
                None => break,
            },
            _ = resync.tick() => {
                if let Err(e) = resync_schedule(&app, &scheduler, namespace, name).await {
                    warn!(error = %e, "Periodic schedule resync failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping cron driver");
                break;
            }
        }
    }

    scheduler.shutdown();
    Ok(())
}
