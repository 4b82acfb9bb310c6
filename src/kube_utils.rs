//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, bounded polling, API discovery of workload kinds and
//! CRD installation.

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::Discovery;
use kube::{Client, Config};
use tracing::{info, trace};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::workload::WorkloadKind;
use crate::{Error, Result};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients; watches time out before this
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client.
///
/// Uses the kubeconfig at `kubeconfig` when given, otherwise the in-cluster
/// or default config. `master` overrides the API server address.
pub async fn create_client(master: Option<&str>, kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::client(format!("failed to read kubeconfig: {e}")))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::client(format!("failed to load kubeconfig: {e}")))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::client(format!("failed to infer config: {e}")))?,
    };

    if let Some(master) = master.filter(|m| !m.is_empty()) {
        config.cluster_url = master
            .parse()
            .map_err(|e| Error::client(format!("invalid master URL {master:?}: {e}")))?;
    }
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| Error::client(format!("failed to create client: {e}")))
}

/// Poll until a condition is met or timeout is reached
///
/// Repeatedly calls `check_fn` until it returns `Ok(true)`. Errors from the
/// check are treated as "not yet" since the object may be mid-update.
/// Uses the tokio clock so paused-time tests advance it deterministically.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) => trace!(error = %e, "Polling check returned error (retrying)"),
        }

        if tokio::time::Instant::now() + poll_interval > deadline {
            return Err(Error::timeout(timeout_msg));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Workload kinds the API server serves.
///
/// Kinds missing from discovery are skipped by the watch layer instead of
/// failing startup.
pub async fn served_workload_kinds(client: &Client) -> Result<HashSet<WorkloadKind>> {
    let config = RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_secs(1),
        ..RetryConfig::default()
    };
    let discovery = retry_with_backoff(&config, "api-discovery", || {
        let client = client.clone();
        async move { Discovery::new(client).run().await.map_err(Error::from) }
    })
    .await?;

    Ok(WorkloadKind::ALL
        .into_iter()
        .filter(|kind| {
            let (group, version) = match kind.api_version().split_once('/') {
                Some((g, v)) => (g, v),
                None => ("", kind.api_version()),
            };
            let gvk = GroupVersionKind::gvk(group, version, &kind.to_string());
            discovery.resolve_gvk(&gvk).is_some()
        })
        .collect())
}

/// Install or update the Stash CRDs with server-side apply
pub async fn ensure_crds_installed(client: &Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(crate::FIELD_MANAGER).force();

    for crd in crate::crd::all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
    }
    Ok(())
}
