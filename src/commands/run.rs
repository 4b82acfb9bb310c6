//! `stash run`: the operator
//!
//! Installs the CRDs, discovers which workload kinds the cluster serves and
//! runs one controller per kind until a shutdown signal.

use tracing::info;

use super::{CommonArgs, OPERATOR_RESYNC_PERIOD};
use crate::context::AppContext;
use crate::kube_utils::{ensure_crds_installed, served_workload_kinds};
use crate::watch::build_workload_controllers;
use crate::Result;

/// Operator arguments
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Shared flags
    #[command(flatten)]
    pub common: CommonArgs,

    /// Sidecar image, without tag
    #[arg(long, env = "STASH_IMAGE", default_value = crate::DEFAULT_IMAGE)]
    pub image: String,

    /// Sidecar image tag
    #[arg(long, env = "STASH_IMAGE_TAG", default_value = crate::DEFAULT_IMAGE_TAG)]
    pub image_tag: String,
}

/// Run the controllers until shutdown
pub async fn run(args: RunArgs) -> Result<()> {
    let client = args.common.client().await?;
    ensure_crds_installed(&client).await?;

    let mut options = args.common.options(OPERATOR_RESYNC_PERIOD);
    options.image = args.image;
    options.image_tag = args.image_tag;
    info!(
        image = %options.sidecar_image(),
        resync = ?options.resync_period,
        threads = options.num_threads,
        "Starting Stash operator"
    );

    let app = AppContext::builder(client.clone())
        .options(options)
        .component(crate::FIELD_MANAGER)
        .build();
    let served = served_workload_kinds(&client).await?;
    let controllers = build_workload_controllers(client, &app, &served);

    info!(count = controllers.len(), "Controllers started");
    futures::future::join_all(controllers).await;
    info!("Controllers stopped");
    Ok(())
}
