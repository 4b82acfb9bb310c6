//! `stash run-backup`: the sidecar's BackupSession driver
//!
//! Watches BackupSessions in the workload's namespace and runs every session
//! of its configuration once for this host.

use futures::StreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, warn};

use super::CommonArgs;
use crate::crd::BackupSession;
use crate::executor::BackupExecutor;
use crate::workload::WorkloadKind;
use crate::Result;

/// Session driver arguments
#[derive(clap::Args, Debug, Clone)]
pub struct RunBackupArgs {
    /// BackupConfiguration whose sessions this sidecar executes
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

    /// Shared flags
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Whether `session` is an unfinished session of `configuration`
pub fn wants(session: &BackupSession, configuration: &str) -> bool {
    session.spec.backup_configuration == configuration
        && session.metadata.deletion_timestamp.is_none()
        && !session
            .status
            .as_ref()
            .is_some_and(|s| s.phase.is_terminal())
}

/// Run `event`'s session if it belongs to `configuration`
pub async fn handle_session_event(
    executor: &BackupExecutor,
    configuration: &str,
    event: watcher::Event<BackupSession>,
) {
    let session = match event {
        watcher::Event::Apply(s) | watcher::Event::InitApply(s) => s,
        _ => return,
    };
    if !wants(&session, configuration) {
        return;
    }
    let namespace = session.namespace().unwrap_or_default();
    let name = session.name_any();
    debug!(session = %name, "BackupSession observed");
    if let Err(e) = executor.run_session(&namespace, &name).await {
        error!(session = %name, error = %e, "BackupSession failed for this host");
    }
}

/// Execute sessions until shutdown
pub async fn run(args: RunBackupArgs) -> Result<()> {
    let (client, app) = args.common.sidecar_context().await?;
    let host = app.host_identity(args.workload_kind, &args.workload_name)?;
    info!(
        namespace = %args.namespace,
        config = %args.backup_configuration,
        hostname = %host.hostname,
        "Starting BackupSession driver"
    );
    let executor = app.backup_executor(host);

    let api: Api<BackupSession> = Api::namespaced(client, &args.namespace);
    let mut events = watcher::watcher(api, WatcherConfig::default().timeout(25))
        .default_backoff()
        .boxed();

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    handle_session_event(&executor, &args.backup_configuration, event).await
                }
                Some(Err(e)) => warn!(error = %e, "BackupSession watch error, will retry"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}
