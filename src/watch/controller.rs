//! kube-runtime controllers for the workload kinds
//!
//! One controller per served workload kind, plus a reflector caching every
//! BackupConfiguration. A configuration change re-queues all workloads so
//! their [`Trigger`] is re-evaluated against the fresh cache.

use std::collections::HashSet;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::ReplicationController;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::reflector::Store;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{reflector, Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use super::{classify_workload, ConfigLookup, RequeueTracker, Trigger};
use crate::context::AppContext;
use crate::crd::BackupConfiguration;
use crate::sidecar::SidecarReconciler;
use crate::workload::{Workload, WorkloadKind};
use crate::{Error, Result};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// State shared by the workload controllers
pub struct WatchContext {
    /// Applies and removes sidecars
    pub sidecars: SidecarReconciler,
    /// Cached BackupConfigurations
    pub configs: Arc<dyn ConfigLookup>,
    /// Consecutive failures per workload
    pub requeues: RequeueTracker,
    /// Re-evaluation period of a healthy workload
    pub resync_period: Duration,
}

impl WatchContext {
    /// Context reconciling through `app` against `configs`
    pub fn new(app: &AppContext, configs: Arc<dyn ConfigLookup>) -> Self {
        Self {
            sidecars: app.sidecar_reconciler(),
            configs,
            requeues: RequeueTracker::new(app.options.max_num_requeues),
            resync_period: app.options.resync_period,
        }
    }
}

/// Reconcile one workload against the cached configurations
#[instrument(skip(obj, ctx), fields(workload = %obj.name_any()))]
pub async fn reconcile_workload<K>(obj: Arc<K>, ctx: Arc<WatchContext>) -> Result<Action>
where
    K: Resource + Clone + Into<Workload> + Send + Sync,
{
    let workload: Workload = obj.as_ref().clone().into();
    let key = workload.describe();

    if workload.meta().deletion_timestamp.is_some() {
        debug!(%key, "Workload is being deleted");
        ctx.requeues.reset(&key);
        return Ok(Action::await_change());
    }

    let configs = ctx.configs.in_namespace(&workload.namespace());
    match classify_workload(&workload, &configs) {
        Trigger::SidecarNeedsAdd(config) => {
            info!(%key, config = %config.name_any(), "Workload selected for backup");
            ctx.sidecars.ensure_sidecar(&workload, &config).await?;
        }
        Trigger::SidecarNeedsRemove { owner } => {
            info!(%key, %owner, "No BackupConfiguration selects workload anymore");
            ctx.sidecars.ensure_sidecar_removed(&workload).await?;
        }
        _ => debug!(%key, "Sidecar unchanged"),
    }

    ctx.requeues.reset(&key);
    Ok(Action::requeue(ctx.resync_period))
}

/// Requeue a failed workload with backoff until it runs out of requeues
pub fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<WatchContext>) -> Action
where
    K: Clone + Into<Workload>,
{
    let workload: Workload = obj.as_ref().clone().into();
    let key = workload.describe();
    match ctx.requeues.record_failure(&key) {
        Some(delay) => {
            warn!(%key, error = %error, retry_in = ?delay, "reconciliation failed");
            Action::requeue(delay)
        }
        None => {
            error!(
                %key,
                error = %error,
                "reconciliation failed too many times, dropping until the workload changes"
            );
            Action::await_change()
        }
    }
}

fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

fn workload_controller<K>(
    client: Client,
    ctx: Arc<WatchContext>,
    configs: Store<BackupConfiguration>,
    trigger: mpsc::UnboundedReceiver<()>,
    concurrency: u16,
    name: &'static str,
) -> ControllerFuture
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Into<Workload>
        + Send
        + Sync
        + 'static,
{
    Box::pin(async move {
        // Reconciling against an unsynced cache would strip every sidecar
        if configs.wait_until_ready().await.is_err() {
            error!("{} controller not started: configuration cache closed", name);
            return;
        }
        Controller::new(
            Api::<K>::all(client),
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .reconcile_all_on(trigger)
        .shutdown_on_signal()
        .run(reconcile_workload::<K>, error_policy::<K>, ctx)
        .for_each(log_reconcile_result(name))
        .await;
    })
}

/// Build the workload controllers and the configuration reflector.
///
/// Kinds missing from `served` are skipped with a warning.
pub fn build_workload_controllers(
    client: Client,
    app: &AppContext,
    served: &HashSet<WorkloadKind>,
) -> Vec<ControllerFuture> {
    let (reader, writer) = reflector::store::<BackupConfiguration>();
    let ctx = Arc::new(WatchContext::new(app, Arc::new(reader.clone())));
    let concurrency = app.options.num_threads.max(1);

    let mut senders = Vec::new();
    let mut futures: Vec<ControllerFuture> = Vec::new();
    for kind in WorkloadKind::ALL {
        if !served.contains(&kind) {
            warn!(%kind, "Workload kind is not served by this cluster, skipping its watch");
            continue;
        }
        let (tx, rx) = mpsc::unbounded();
        senders.push(tx);
        let (c, ctx, store) = (client.clone(), ctx.clone(), reader.clone());
        futures.push(match kind {
            WorkloadKind::Deployment => {
                workload_controller::<Deployment>(c, ctx, store, rx, concurrency, "Deployment")
            }
            WorkloadKind::ReplicaSet => {
                workload_controller::<ReplicaSet>(c, ctx, store, rx, concurrency, "ReplicaSet")
            }
            WorkloadKind::ReplicationController => workload_controller::<ReplicationController>(
                c,
                ctx,
                store,
                rx,
                concurrency,
                "ReplicationController",
            ),
            WorkloadKind::StatefulSet => {
                workload_controller::<StatefulSet>(c, ctx, store, rx, concurrency, "StatefulSet")
            }
            WorkloadKind::DaemonSet => {
                workload_controller::<DaemonSet>(c, ctx, store, rx, concurrency, "DaemonSet")
            }
        });
        info!("- {kind} controller");
    }

    let configs: Api<BackupConfiguration> = Api::all(client);
    let config_watch = reflector(
        writer,
        watcher::watcher(configs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)),
    )
    .default_backoff()
    .touched_objects()
    .for_each(move |result| {
        match result {
            Ok(config) => {
                debug!(config = %config.key(), "BackupConfiguration changed, re-evaluating workloads");
                for tx in &senders {
                    // A closed receiver means its controller has shut down
                    let _ = tx.unbounded_send(());
                }
            }
            Err(e) => warn!(error = %e, "BackupConfiguration watch error, will retry"),
        }
        std::future::ready(())
    });
    info!("- BackupConfiguration reflector");
    futures.push(Box::pin(config_watch));
    futures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Backend, BackupConfigurationSpec, S3Spec};
    use crate::events::reasons;
    use crate::events::testing::RecordingPublisher;
    use crate::options::Options;
    use crate::restic::testing::RecordingRunner;
    use crate::sidecar::reconciler::MockWorkloadClient;
    use crate::store::testing::InMemoryStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
    use std::collections::BTreeMap;

    fn config() -> BackupConfiguration {
        let mut c = BackupConfiguration::new(
            "nightly",
            BackupConfigurationSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".to_string(), "api".to_string())])),
                    ..Default::default()
                }),
                backend: Backend {
                    s3: Some(S3Spec {
                        endpoint: "s3.amazonaws.com".to_string(),
                        bucket: "backups".to_string(),
                        ..Default::default()
                    }),
                    storage_secret_name: "s3-secret".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        c.metadata.namespace = Some("default".to_string());
        c
    }

    fn deployment(app: &str, owner: Option<&str>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("api".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                annotations: owner.map(|o| {
                    BTreeMap::from([(crate::ANNOTATION_CONFIG_NAME.to_string(), o.to_string())])
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Fixture {
        events: Arc<RecordingPublisher>,
        ctx: Arc<WatchContext>,
    }

    fn fixture(configs: Vec<BackupConfiguration>, max_num_requeues: u32) -> Fixture {
        let events = Arc::new(RecordingPublisher::default());
        let app = AppContext::for_testing(
            Arc::new(InMemoryStore::default()),
            events.clone(),
            Arc::new(MockWorkloadClient::new()),
            Arc::new(RecordingRunner::default()),
            Options {
                max_num_requeues,
                resync_period: Duration::from_secs(300),
                ..Default::default()
            },
        );
        Fixture {
            events,
            ctx: Arc::new(WatchContext::new(&app, Arc::new(configs))),
        }
    }

    #[tokio::test]
    async fn unchanged_workload_is_resynced_later() {
        let f = fixture(vec![config()], 5);
        let action = reconcile_workload(Arc::new(deployment("api", Some("nightly"))), f.ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn deleting_workload_is_left_alone() {
        let f = fixture(vec![], 5);
        let mut obj = deployment("api", Some("nightly"));
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let action = reconcile_workload(Arc::new(obj), f.ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    /// Story: a workload selected by a configuration whose secret is missing
    /// fails injection, is requeued with backoff and finally dropped
    #[tokio::test]
    async fn story_failing_injection_is_requeued_then_dropped() {
        let f = fixture(vec![config()], 2);
        let obj = Arc::new(deployment("api", None));

        let err = reconcile_workload(obj.clone(), f.ctx.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingSecret { .. }));
        assert_eq!(
            f.events.reasons(),
            vec![reasons::SIDECAR_INJECTION_FAILED.to_string()]
        );

        assert_eq!(
            error_policy(obj.clone(), &err, f.ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            error_policy(obj.clone(), &err, f.ctx.clone()),
            Action::requeue(Duration::from_secs(10))
        );
        assert_eq!(error_policy(obj, &err, f.ctx), Action::await_change());
    }
}
