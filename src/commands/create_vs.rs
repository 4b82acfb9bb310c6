//! `stash create-vs`: CSI VolumeSnapshots for a BackupSession
//!
//! Instead of running restic, this driver snapshots every PVC of the target
//! workload and records one session host entry per PVC.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::Resource;
use tracing::{info, warn};

use super::{CommonArgs, SIDECAR_RESYNC_PERIOD};
use crate::context::AppContext;
use crate::crd::{
    snapshot_name, HostStatus, SessionPhase, VolumeSnapshot, VolumeSnapshotSource,
    VolumeSnapshotSpec,
};
use crate::events::{actions, reasons};
use crate::kube_utils::poll_until;
use crate::status::format_duration;
use crate::store::ResourceStore;
use crate::workload::WorkloadKind;
use crate::{Error, Result};

/// Time allowed for one snapshot to become ready
pub const SNAPSHOT_READY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Interval between readiness polls
pub const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Volume snapshot arguments
#[derive(clap::Args, Debug, Clone)]
pub struct CreateVsArgs {
    /// Namespace of the BackupSession
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    /// BackupSession to fulfil
    #[arg(long)]
    pub backup_session: String,

    /// Shared flags
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Snapshot every PVC of the session's target workload.
///
/// All snapshots are created first, then awaited in turn. Each PVC gets a
/// host entry; the call fails if any snapshot failed.
pub async fn create_volume_snapshots(
    app: &AppContext,
    namespace: &str,
    session_name: &str,
    now: DateTime<Utc>,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let session = app
        .store
        .get_backup_session(namespace, session_name)
        .await?
        .ok_or_else(|| Error::not_found("BackupSession", namespace, session_name))?;
    let config_name = &session.spec.backup_configuration;
    let config = app
        .store
        .get_backup_configuration(namespace, config_name)
        .await?
        .ok_or_else(|| Error::not_found("BackupConfiguration", namespace, config_name.as_str()))?;
    let target = config.spec.target.as_ref().ok_or_else(|| {
        Error::validation(format!(
            "BackupConfiguration {namespace}/{config_name} has no target to snapshot"
        ))
    })?;
    let kind: WorkloadKind = target.kind.parse()?;
    let workload = app
        .workloads
        .get(kind, namespace, &target.name)
        .await?
        .ok_or_else(|| Error::not_found(kind.to_string(), namespace, target.name.as_str()))?;

    let pvcs = workload.pvc_names();
    if pvcs.is_empty() {
        return Err(Error::validation(format!(
            "{} has no PersistentVolumeClaims to snapshot",
            workload.describe()
        )));
    }
    let total = Some(pvcs.len() as i32);
    let reporter = app.reporter();
    let obj = session.object_ref(&());
    info!(session = session_name, pvcs = pvcs.len(), "Creating VolumeSnapshots");

    let mut pending = Vec::with_capacity(pvcs.len());
    for pvc in &pvcs {
        let snapshot = VolumeSnapshot {
            metadata: ObjectMeta {
                name: Some(snapshot_name(pvc, now)),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    crate::LABEL_BACKUP_CONFIGURATION.to_string(),
                    config_name.clone(),
                )])),
                ..Default::default()
            },
            spec: VolumeSnapshotSpec {
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some(pvc.clone()),
                },
                volume_snapshot_class_name: target.volume_snapshot_class_name.clone(),
            },
            status: None,
        };
        match app.store.create_volume_snapshot(&snapshot).await {
            Ok(_) => {
                reporter
                    .update_backup_session_host(
                        namespace,
                        session_name,
                        HostStatus::new(pvc.as_str(), SessionPhase::Running),
                        total,
                    )
                    .await?;
                pending.push((pvc.clone(), snapshot_name(pvc, now)));
            }
            Err(e) => {
                warn!(pvc = %pvc, error = %e, "VolumeSnapshot creation failed");
                record_failure(app, namespace, session_name, pvc, e.to_string(), total).await?;
                reporter
                    .warning(&obj, reasons::VOLUME_SNAPSHOT_FAILED, actions::SNAPSHOT, e.to_string())
                    .await;
            }
        }
    }

    let mut failed = pvcs.len() - pending.len();
    for (pvc, name) in pending {
        let started = tokio::time::Instant::now();
        let outcome = wait_until_ready(&app.store, namespace, &name, timeout, poll).await;
        match outcome {
            Ok(()) => {
                let entry = HostStatus {
                    duration: Some(format_duration(started.elapsed())),
                    ..HostStatus::new(pvc.as_str(), SessionPhase::Succeeded)
                };
                reporter
                    .update_backup_session_host(namespace, session_name, entry, total)
                    .await?;
                reporter
                    .normal(
                        &obj,
                        reasons::VOLUME_SNAPSHOT_CREATED,
                        actions::SNAPSHOT,
                        format!("VolumeSnapshot {name} of PVC {pvc} is ready"),
                    )
                    .await;
            }
            Err(message) => {
                failed += 1;
                warn!(snapshot = %name, error = %message, "VolumeSnapshot failed");
                record_failure(app, namespace, session_name, &pvc, message.clone(), total).await?;
                reporter
                    .warning(&obj, reasons::VOLUME_SNAPSHOT_FAILED, actions::SNAPSHOT, message)
                    .await;
            }
        }
    }

    if failed > 0 {
        return Err(Error::validation(format!(
            "{failed} of {} VolumeSnapshots failed for BackupSession {namespace}/{session_name}",
            pvcs.len()
        )));
    }
    info!(session = session_name, "All VolumeSnapshots ready");
    Ok(())
}

/// Wait until the CSI driver marks `name` ready or reports an error
async fn wait_until_ready(
    store: &Arc<dyn ResourceStore>,
    namespace: &str,
    name: &str,
    timeout: Duration,
    poll: Duration,
) -> std::result::Result<(), String> {
    let driver_error = Mutex::new(None::<String>);
    let slot = &driver_error;
    let waited = poll_until(
        timeout,
        poll,
        format!("VolumeSnapshot {namespace}/{name} not ready"),
        move || {
            let store = store.clone();
            async move {
                let snapshot = store
                    .get_volume_snapshot(namespace, name)
                    .await?
                    .ok_or_else(|| Error::not_found("VolumeSnapshot", namespace, name))?;
                if let Some(msg) = snapshot.error_message() {
                    if let Ok(mut s) = slot.lock() {
                        *s = Some(msg.to_string());
                    }
                    return Ok(true);
                }
                Ok(snapshot.is_ready())
            }
        },
    )
    .await;
    let reported = driver_error.lock().ok().and_then(|mut s| s.take());
    match (waited, reported) {
        (_, Some(msg)) => Err(msg),
        (Err(e), None) => Err(e.to_string()),
        (Ok(()), None) => Ok(()),
    }
}

async fn record_failure(
    app: &AppContext,
    namespace: &str,
    session_name: &str,
    pvc: &str,
    message: String,
    total: Option<i32>,
) -> Result<()> {
    let entry = HostStatus {
        error: Some(message),
        ..HostStatus::new(pvc, SessionPhase::Failed)
    };
    app.reporter()
        .update_backup_session_host(namespace, session_name, entry, total)
        .await?;
    Ok(())
}

/// Snapshot the session's volumes and exit
pub async fn run(args: CreateVsArgs) -> Result<()> {
    let client = args.common.client().await?;
    let app = AppContext::builder(client)
        .options(args.common.options(SIDECAR_RESYNC_PERIOD))
        .component(super::SIDECAR_COMPONENT)
        .build();
    create_volume_snapshots(
        &app,
        &args.namespace,
        &args.backup_session,
        Utc::now(),
        SNAPSHOT_READY_TIMEOUT,
        SNAPSHOT_POLL_INTERVAL,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        BackupConfiguration, BackupConfigurationSpec, BackupSession, BackupSessionSpec,
        TargetRef, VolumeSnapshotError, VolumeSnapshotStatus,
    };
    use crate::events::testing::RecordingPublisher;
    use crate::options::Options;
    use crate::restic::testing::RecordingRunner;
    use crate::sidecar::reconciler::MockWorkloadClient;
    use crate::store::testing::InMemoryStore;
    use crate::workload::Workload;
    use chrono::TimeZone;
    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;

    fn statefulset() -> StatefulSet {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some("data".to_string());
        let mut sts = StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(2),
                volume_claim_templates: Some(vec![claim]),
                ..Default::default()
            }),
            ..Default::default()
        };
        sts.metadata.name = Some("db".to_string());
        sts.metadata.namespace = Some("default".to_string());
        sts
    }

    fn fixture(workload: Option<Workload>) -> (Arc<InMemoryStore>, Arc<RecordingPublisher>, Arc<AppContext>) {
        let store = Arc::new(InMemoryStore::default());
        let mut config = BackupConfiguration::new(
            "db-snap",
            BackupConfigurationSpec {
                target: Some(TargetRef {
                    kind: "StatefulSet".to_string(),
                    name: "db".to_string(),
                    volume_snapshot_class_name: Some("csi-snapclass".to_string()),
                }),
                schedule: "@every 1h".to_string(),
                ..Default::default()
            },
        );
        config.metadata.namespace = Some("default".to_string());
        store.put_config(config);
        let mut session = BackupSession::new(
            "db-snap-1",
            BackupSessionSpec {
                backup_configuration: "db-snap".to_string(),
            },
        );
        session.metadata.namespace = Some("default".to_string());
        store.put_backup_session(session);

        let mut workloads = MockWorkloadClient::new();
        workloads
            .expect_get()
            .returning(move |_, _, _| Ok(workload.clone()));
        let events = Arc::new(RecordingPublisher::default());
        let app = AppContext::for_testing(
            store.clone(),
            events.clone(),
            Arc::new(workloads),
            Arc::new(RecordingRunner::default()),
            Options::default(),
        );
        (store, events, Arc::new(app))
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap()
    }

    fn mark(store: &InMemoryStore, ready: bool, error: Option<&str>) {
        for mut snapshot in store.volume_snapshots() {
            snapshot.status = Some(VolumeSnapshotStatus {
                ready_to_use: Some(ready),
                error: error.map(|m| VolumeSnapshotError {
                    message: Some(m.to_string()),
                }),
                ..Default::default()
            });
            store.put_volume_snapshot(snapshot);
        }
    }

    /// Story: each StatefulSet replica's claim is snapshotted and the session
    /// succeeds once the CSI driver reports every snapshot ready
    #[tokio::test(start_paused = true)]
    async fn story_statefulset_claims_are_snapshotted() {
        let (store, events, app) = fixture(Some(Workload::from(statefulset())));
        let task = tokio::spawn({
            let app = app.clone();
            async move {
                create_volume_snapshots(
                    &app,
                    "default",
                    "db-snap-1",
                    at(),
                    Duration::from_secs(60),
                    Duration::from_secs(5),
                )
                .await
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut names: Vec<String> = store
            .volume_snapshots()
            .iter()
            .filter_map(|s| s.metadata.name.clone())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "data-db-0-2024-03-07t09-05-01-stash",
                "data-db-1-2024-03-07t09-05-01-stash"
            ]
        );
        assert!(store
            .volume_snapshots()
            .iter()
            .all(|s| s.spec.volume_snapshot_class_name.as_deref() == Some("csi-snapclass")));
        mark(&store, true, None);

        task.await.unwrap().unwrap();
        let status = store.backup_session("default", "db-snap-1").unwrap().status.unwrap();
        assert_eq!(status.phase, SessionPhase::Succeeded);
        assert_eq!(status.total_hosts, Some(2));
        assert_eq!(
            events.reasons(),
            vec![reasons::VOLUME_SNAPSHOT_CREATED.to_string(); 2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn driver_error_fails_the_session() {
        let (store, events, app) = fixture(Some(Workload::from(statefulset())));
        let task = tokio::spawn({
            let app = app.clone();
            async move {
                create_volume_snapshots(
                    &app,
                    "default",
                    "db-snap-1",
                    at(),
                    Duration::from_secs(60),
                    Duration::from_secs(5),
                )
                .await
            }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        mark(&store, false, Some("quota exceeded"));

        assert!(task.await.unwrap().is_err());
        let status = store.backup_session("default", "db-snap-1").unwrap().status.unwrap();
        assert_eq!(status.phase, SessionPhase::Failed);
        assert_eq!(status.hosts[0].error.as_deref(), Some("quota exceeded"));
        assert_eq!(events.warnings(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_that_never_readies_times_out() {
        let (store, _, app) = fixture(Some(Workload::from(statefulset())));
        let err = create_volume_snapshots(
            &app,
            "default",
            "db-snap-1",
            at(),
            Duration::from_secs(20),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("2 of 2"), "{err}");
        let status = store.backup_session("default", "db-snap-1").unwrap().status.unwrap();
        assert!(status.hosts.iter().all(|h| h.phase == SessionPhase::Failed));
    }

    #[tokio::test]
    async fn missing_workload_is_not_found() {
        let (store, _, app) = fixture(None);
        let err = create_volume_snapshots(
            &app,
            "default",
            "db-snap-1",
            at(),
            Duration::from_secs(20),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }), "{err}");
        assert!(store.volume_snapshots().is_empty());
    }
}
