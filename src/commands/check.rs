//! `stash check`: verify a Repository and refresh its status

use kube::Resource;
use tracing::{info, warn};

use super::{CommonArgs, SIDECAR_RESYNC_PERIOD};
use crate::context::AppContext;
use crate::events::{actions, reasons};
use crate::executor::repository_restic;
use crate::restic::parse_total_size;
use crate::{Error, Result};

/// Repository check arguments
#[derive(clap::Args, Debug, Clone)]
pub struct CheckArgs {
    /// Namespace of the Repository
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    /// Repository to check
    #[arg(long)]
    pub repository: String,

    /// Shared flags
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Run `restic check` against a Repository and record the outcome.
///
/// Snapshot count and size are refreshed on a best-effort basis. A failed
/// integrity check is recorded and then returned as the error.
pub async fn check_repository(app: &AppContext, namespace: &str, name: &str) -> Result<()> {
    let restic =
        repository_restic(app.store.as_ref(), app.commands.clone(), &app.options, namespace, name)
            .await?;

    let integrity = restic.check().await;
    let snapshot_count = match restic.snapshots(&[]).await {
        Ok(snapshots) => Some(snapshots.len() as i64),
        Err(e) => {
            warn!(repository = name, error = %e, "Could not count snapshots");
            None
        }
    };
    let size = match restic.stats().await {
        Ok(out) => parse_total_size(&out),
        Err(e) => {
            warn!(repository = name, error = %e, "Could not read repository size");
            None
        }
    };

    let reporter = app.reporter();
    let repo = reporter
        .record_repository_check(namespace, name, integrity.is_ok(), snapshot_count, size)
        .await?
        .ok_or_else(|| Error::not_found("Repository", namespace, name))?;
    let obj = repo.object_ref(&());

    match integrity {
        Ok(_) => {
            info!(repository = name, snapshots = ?snapshot_count, "Repository check passed");
            reporter
                .normal(
                    &obj,
                    reasons::REPOSITORY_CHECK_SUCCEEDED,
                    actions::CHECK,
                    "restic check passed".to_string(),
                )
                .await;
            Ok(())
        }
        Err(e) => {
            reporter
                .warning(
                    &obj,
                    reasons::REPOSITORY_CHECK_FAILED,
                    actions::CHECK,
                    e.to_string(),
                )
                .await;
            Err(e)
        }
    }
}

/// Check one Repository and exit
pub async fn run(args: CheckArgs) -> Result<()> {
    let client = args.common.client().await?;
    let app = AppContext::builder(client)
        .options(args.common.options(SIDECAR_RESYNC_PERIOD))
        .component(super::SIDECAR_COMPONENT)
        .build();
    check_repository(&app, &args.namespace, &args.repository).await
}
