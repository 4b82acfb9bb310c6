//! Sidecar reconciler
//!
//! Submits sidecar edits to the API server. Each edit is a compare-and-swap
//! `replace`; a conflict re-reads the workload and re-applies the edit. After
//! a successful write the reconciler waits, bounded, until the workload has
//! rolled out and its live pods reflect the change.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, ReplicationController};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::{apply_sidecar, has_sidecar, remove_sidecar, sidecar_container, sidecar_image_tag};
use crate::crd::BackupConfiguration;
use crate::events::{actions, reasons};
use crate::kube_utils::poll_until;
use crate::options::Options;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::selector::to_selector_string;
use crate::status::StatusReporter;
use crate::store::ResourceStore;
use crate::workload::{Workload, WorkloadKind};
use crate::{Error, Result};

/// How long to wait for a workload to roll out after an edit
pub const DEFAULT_ROLLOUT_TIMEOUT: Duration = Duration::from_secs(300);
/// Interval between rollout checks
pub const DEFAULT_ROLLOUT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Trait abstracting workload and pod operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Fetch a workload of the given kind
    async fn get(&self, kind: WorkloadKind, namespace: &str, name: &str)
        -> Result<Option<Workload>>;

    /// Replace a workload; stale resourceVersions fail with a conflict
    async fn replace(&self, workload: &Workload) -> Result<Workload>;

    /// List pods matching a label selector string
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Delete pods matching a label selector string
    async fn delete_pods(&self, namespace: &str, selector: &str) -> Result<()>;
}

/// Real workload client backed by the API server
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn replace_typed<K>(api: Api<K>, obj: &K) -> Result<K>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + serde::Serialize + std::fmt::Debug,
{
    api.replace(&obj.name_any(), &PostParams::default(), obj)
        .await
        .map_err(Error::from_write)
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>> {
        let c = self.client.clone();
        Ok(match kind {
            WorkloadKind::Deployment => Api::<Deployment>::namespaced(c, namespace)
                .get_opt(name)
                .await?
                .map(Workload::from),
            WorkloadKind::ReplicaSet => Api::<ReplicaSet>::namespaced(c, namespace)
                .get_opt(name)
                .await?
                .map(Workload::from),
            WorkloadKind::ReplicationController => {
                Api::<ReplicationController>::namespaced(c, namespace)
                    .get_opt(name)
                    .await?
                    .map(Workload::from)
            }
            WorkloadKind::StatefulSet => Api::<StatefulSet>::namespaced(c, namespace)
                .get_opt(name)
                .await?
                .map(Workload::from),
            WorkloadKind::DaemonSet => Api::<DaemonSet>::namespaced(c, namespace)
                .get_opt(name)
                .await?
                .map(Workload::from),
        })
    }

    async fn replace(&self, workload: &Workload) -> Result<Workload> {
        let c = self.client.clone();
        let ns = workload.namespace();
        Ok(match workload {
            Workload::Deployment(o) => replace_typed(Api::namespaced(c, &ns), o).await?.into(),
            Workload::ReplicaSet(o) => replace_typed(Api::namespaced(c, &ns), o).await?.into(),
            Workload::ReplicationController(o) => {
                replace_typed(Api::namespaced(c, &ns), o).await?.into()
            }
            Workload::StatefulSet(o) => replace_typed(Api::namespaced(c, &ns), o).await?.into(),
            Workload::DaemonSet(o) => replace_typed(Api::namespaced(c, &ns), o).await?.into(),
        })
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn delete_pods(&self, namespace: &str, selector: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.delete_collection(&DeleteParams::default(), &ListParams::default().labels(selector))
            .await?;
        Ok(())
    }
}

fn is_live(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|p| p == "Running")
}

/// Adds and removes the backup sidecar on workloads
pub struct SidecarReconciler {
    workloads: Arc<dyn WorkloadClient>,
    store: Arc<dyn ResourceStore>,
    reporter: StatusReporter,
    options: Arc<Options>,
    retry: RetryConfig,
    rollout_timeout: Duration,
    poll_interval: Duration,
}

impl SidecarReconciler {
    /// Create a reconciler with the default rollout wait
    pub fn new(
        workloads: Arc<dyn WorkloadClient>,
        store: Arc<dyn ResourceStore>,
        reporter: StatusReporter,
        options: Arc<Options>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            workloads,
            store,
            reporter,
            options,
            retry,
            rollout_timeout: DEFAULT_ROLLOUT_TIMEOUT,
            poll_interval: DEFAULT_ROLLOUT_POLL_INTERVAL,
        }
    }

    /// Override the rollout wait
    pub fn with_rollout_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.rollout_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Make sure `workload` carries the sidecar for `config`.
    ///
    /// A no-op when the workload is already annotated with this
    /// configuration. Emits a Normal event on success and a Warning event on
    /// failure.
    #[instrument(skip(self, workload, config), fields(workload = %workload.describe(), config = %config.name_any()))]
    pub async fn ensure_sidecar(&self, workload: &Workload, config: &BackupConfiguration) -> Result<()> {
        let config_name = config.name_any();
        if workload.annotation(crate::ANNOTATION_CONFIG_NAME) == Some(config_name.as_str()) {
            debug!("sidecar already present");
            return Ok(());
        }

        let obj_ref = workload.object_ref();
        match self.add(workload, config).await {
            Ok(()) => {
                info!("sidecar added");
                self.reporter
                    .normal(
                        &obj_ref,
                        reasons::SIDECAR_INJECTED,
                        actions::INJECT_SIDECAR,
                        format!("Added backup sidecar for BackupConfiguration {config_name}"),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to add sidecar");
                self.reporter
                    .warning(
                        &obj_ref,
                        reasons::SIDECAR_INJECTION_FAILED,
                        actions::INJECT_SIDECAR,
                        format!("Failed to add backup sidecar: {e}"),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Make sure `workload` carries no sidecar.
    ///
    /// A no-op when the workload has no owning annotation.
    #[instrument(skip(self, workload), fields(workload = %workload.describe()))]
    pub async fn ensure_sidecar_removed(&self, workload: &Workload) -> Result<()> {
        let Some(owner) = workload.annotation(crate::ANNOTATION_CONFIG_NAME).map(str::to_string)
        else {
            debug!("sidecar already removed");
            return Ok(());
        };

        let obj_ref = workload.object_ref();
        match self.remove(workload).await {
            Ok(()) => {
                info!(%owner, "sidecar removed");
                self.reporter
                    .normal(
                        &obj_ref,
                        reasons::SIDECAR_REMOVED,
                        actions::REMOVE_SIDECAR,
                        format!("Removed backup sidecar of BackupConfiguration {owner}"),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to remove sidecar");
                self.reporter
                    .warning(
                        &obj_ref,
                        reasons::SIDECAR_REMOVAL_FAILED,
                        actions::REMOVE_SIDECAR,
                        format!("Failed to remove backup sidecar: {e}"),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn add(&self, workload: &Workload, config: &BackupConfiguration) -> Result<()> {
        let namespace = workload.namespace();
        let secret_name = &config.spec.backend.storage_secret_name;
        if secret_name.is_empty() || self.store.get_secret(&namespace, secret_name).await?.is_none() {
            return Err(Error::missing_secret(&namespace, secret_name));
        }

        let container =
            sidecar_container(config, workload.kind(), &workload.name(), &self.options);
        let tag = sidecar_image_tag(config, &self.options);
        let updated = self
            .patch("add sidecar", workload, |obj| {
                apply_sidecar(obj, config, container.clone(), &tag)
            })
            .await?;

        self.restart_pods_if_needed(&updated).await?;
        self.wait_for_rollout(&updated, true).await
    }

    async fn remove(&self, workload: &Workload) -> Result<()> {
        let updated = self.patch("remove sidecar", workload, remove_sidecar).await?;
        self.restart_pods_if_needed(&updated).await?;
        self.wait_for_rollout(&updated, false).await
    }

    /// Apply `edit` and replace, re-reading the workload after a conflict
    async fn patch<F>(&self, operation: &str, workload: &Workload, edit: F) -> Result<Workload>
    where
        F: Fn(&mut Workload) -> Result<()>,
    {
        let workloads = &self.workloads;
        let edit = &edit;
        let (kind, namespace, name) = (workload.kind(), workload.namespace(), workload.name());
        let (namespace, name) = (namespace.as_str(), name.as_str());

        retry_on_conflict(&self.retry, operation, move |attempt| async move {
            let mut obj = if attempt == 1 {
                workload.clone()
            } else {
                workloads
                    .get(kind, namespace, name)
                    .await?
                    .ok_or_else(|| Error::not_found(kind.to_string(), namespace, name))?
            };
            edit(&mut obj)?;
            workloads.replace(&obj).await
        })
        .await
    }

    /// ReplicaSets and ReplicationControllers keep running pods on a
    /// template change, so their pods are deleted and recreated.
    async fn restart_pods_if_needed(&self, workload: &Workload) -> Result<()> {
        if workload.kind().rolls_on_template_change() {
            return Ok(());
        }
        let Some(selector) = workload.selector() else {
            return Ok(());
        };
        let selector = to_selector_string(&selector)?;
        info!(workload = %workload.describe(), %selector, "restarting pods");
        self.workloads
            .delete_pods(&workload.namespace(), &selector)
            .await
    }

    async fn wait_for_rollout(&self, workload: &Workload, want_sidecar: bool) -> Result<()> {
        let (kind, namespace, name) = (workload.kind(), workload.namespace(), workload.name());
        let selector = workload
            .selector()
            .map(|s| to_selector_string(&s))
            .transpose()?
            .unwrap_or_default();
        let workloads = &self.workloads;
        let (namespace, name, selector) = (namespace.as_str(), name.as_str(), selector.as_str());

        poll_until(
            self.rollout_timeout,
            self.poll_interval,
            format!(
                "{} did not roll out within {:?}",
                workload.describe(),
                self.rollout_timeout
            ),
            move || async move {
                let Some(current) = workloads.get(kind, namespace, name).await? else {
                    return Err(Error::not_found(kind.to_string(), namespace, name));
                };
                if !current.is_rolled_out() {
                    return Ok(false);
                }
                let pods = workloads.list_pods(namespace, selector).await?;
                let with_sidecar = pods
                    .iter()
                    .filter(|p| is_live(p))
                    .filter(|p| p.spec.as_ref().is_some_and(has_sidecar))
                    .count();
                Ok(if want_sidecar {
                    with_sidecar > 0
                } else {
                    with_sidecar == 0
                })
            },
        )
        .await
    }
}
