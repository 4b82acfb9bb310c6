//! CLI subcommands
//!
//! Each subcommand has an `Args` struct parsed by clap and an async `run`.
//! Flags are folded into [`Options`] once, right here.

pub mod backup;
pub mod check;
pub mod create_vs;
pub mod restore;
pub mod run;
pub mod run_backup;

use std::path::PathBuf;
use std::time::Duration;

use clap::ArgAction;
use kube::Client;

use crate::context::AppContext;
use crate::kube_utils::create_client;
use crate::options::{parse_duration, Options};
use crate::Result;

/// Resync period of the operator's watches
pub const OPERATOR_RESYNC_PERIOD: Duration = Duration::from_secs(600);
/// Resync period of the sidecar commands
pub const SIDECAR_RESYNC_PERIOD: Duration = Duration::from_secs(300);

/// Reporting component of Events published by sidecar commands
pub const SIDECAR_COMPONENT: &str = "stash-sidecar";

fn duration_arg(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

/// Flags shared by every subcommand
#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    /// Kubernetes API server address, overrides the kubeconfig
    #[arg(long)]
    pub master: Option<String>,

    /// Path to a kubeconfig; in-cluster config when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Directory for restic temp files, cache and credentials
    #[arg(long, default_value = crate::DEFAULT_SCRATCH_DIR)]
    pub scratch_dir: PathBuf,

    /// Prometheus pushgateway URL
    #[arg(long, default_value = crate::DEFAULT_PUSHGATEWAY_URL)]
    pub pushgateway_url: String,

    /// Re-list period of the watches, e.g. `10m`
    #[arg(long, value_parser = duration_arg)]
    pub resync_period: Option<Duration>,

    /// Consecutive failures after which a key is dropped from the queue
    #[arg(long, default_value_t = 5)]
    pub max_num_requeues: u32,

    /// Concurrent reconciliations per controller
    #[arg(long, default_value_t = 2)]
    pub num_threads: u16,

    /// Use a restic cache under the scratch directory
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub enable_cache: bool,

    /// Backend connection limit for GCS, Azure and B2 (0 = restic default)
    #[arg(long, default_value_t = 0)]
    pub max_connections: u32,

    /// Push run metrics to the pushgateway
    #[arg(long, default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub metrics_enabled: bool,

    /// Node this process runs on
    #[arg(long, env = "NODE_NAME", hide_env_values = true)]
    pub node_name: Option<String>,

    /// Pod this process runs in
    #[arg(long, env = "POD_NAME", hide_env_values = true)]
    pub pod_name: Option<String>,
}

impl CommonArgs {
    /// Fold the flags into [`Options`]
    pub fn options(&self, default_resync: Duration) -> Options {
        Options {
            scratch_dir: self.scratch_dir.clone(),
            pushgateway_url: self.pushgateway_url.clone(),
            metrics_enabled: self.metrics_enabled,
            enable_cache: self.enable_cache,
            max_connections: self.max_connections,
            resync_period: self.resync_period.unwrap_or(default_resync),
            max_num_requeues: self.max_num_requeues,
            num_threads: self.num_threads,
            node_name: self.node_name.clone(),
            pod_name: self.pod_name.clone(),
            ..Options::default()
        }
    }

    /// Cluster client from `--master` and `--kubeconfig`
    pub async fn client(&self) -> Result<Client> {
        create_client(self.master.as_deref(), self.kubeconfig.as_deref()).await
    }

    /// Client plus an [`AppContext`] for a sidecar command
    pub async fn sidecar_context(&self) -> Result<(Client, AppContext)> {
        let client = self.client().await?;
        let ctx = AppContext::builder(client.clone())
            .options(self.options(SIDECAR_RESYNC_PERIOD))
            .component(SIDECAR_COMPONENT)
            .build();
        Ok((client, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn defaults_fold_into_options() {
        let cli = Cli::try_parse_from(["stash"]).unwrap();
        let opts = cli.common.options(OPERATOR_RESYNC_PERIOD);
        assert_eq!(opts.resync_period, Duration::from_secs(600));
        assert_eq!(opts.scratch_dir, PathBuf::from("/tmp"));
        assert!(opts.enable_cache);
        assert!(!opts.metrics_enabled);
        assert_eq!(opts.num_threads, 2);
    }

    /// Story: the flags the operator writes into the sidecar parse back
    #[test]
    fn story_sidecar_flags_round_trip() {
        let cli = Cli::try_parse_from([
            "stash",
            "--scratch-dir=/tmp",
            "--enable-cache=false",
            "--max-connections=8",
            "--metrics-enabled=true",
            "--pushgateway-url=http://gw:9091",
            "--resync-period=300s",
        ])
        .unwrap();
        let opts = cli.common.options(OPERATOR_RESYNC_PERIOD);
        assert!(!opts.enable_cache);
        assert!(opts.metrics_enabled);
        assert_eq!(opts.max_connections, 8);
        assert_eq!(opts.pushgateway_url, "http://gw:9091");
        assert_eq!(opts.resync_period, SIDECAR_RESYNC_PERIOD);
    }

    #[test]
    fn bare_bool_flag_means_true() {
        let cli = Cli::try_parse_from(["stash", "--metrics-enabled"]).unwrap();
        assert!(cli.common.metrics_enabled);
    }

    #[test]
    fn malformed_resync_is_rejected() {
        assert!(Cli::try_parse_from(["stash", "--resync-period=soon"]).is_err());
    }
}
