//! `stash restore`: run this host's share of a RestoreSession

use tracing::info;

use super::CommonArgs;
use crate::workload::WorkloadKind;
use crate::Result;

/// Restore arguments
#[derive(clap::Args, Debug, Clone)]
pub struct RestoreArgs {
    /// Namespace of the RestoreSession
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    /// RestoreSession to execute
    #[arg(long)]
    pub restore_session: String,

    /// Kind of the workload being restored
    #[arg(long)]
    pub workload_kind: WorkloadKind,

    /// Name of the workload being restored
    #[arg(long)]
    pub workload_name: String,

    /// Shared flags
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Restore once and exit
pub async fn run(args: RestoreArgs) -> Result<()> {
    let (_, app) = args.common.sidecar_context().await?;
    let host = app.host_identity(args.workload_kind, &args.workload_name)?;
    info!(
        namespace = %args.namespace,
        session = %args.restore_session,
        hostname = %host.hostname,
        "Starting restore"
    );
    app.restore_executor(host)
        .run(&args.namespace, &args.restore_session)
        .await
}
