//! Status persistence and event emission
//!
//! Every status write is a read-modify-write: fetch the current object, apply
//! a pure transform, replace it. A conflict means another writer got there
//! first, so the loop re-reads and re-applies the transform. Events go
//! through the same reporter and are best-effort.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use crate::crd::{
    overall_phase, upsert_host, BackupConfiguration, BackupSession, HostStatus, Repository,
    RestoreSession, SessionPhase,
};
use crate::events::EventPublisher;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::ResourceStore;
use crate::Result;

/// Fetch, transform and write back an object, retrying on conflicts.
///
/// `transform` returns false when it made no change, in which case nothing
/// is written. Returns `Ok(None)` when the object no longer exists.
pub async fn read_modify_write<K, R, RF, W, WF, T>(
    retry: &RetryConfig,
    operation: &str,
    read: R,
    write: W,
    transform: T,
) -> Result<Option<K>>
where
    R: Fn() -> RF,
    RF: Future<Output = Result<Option<K>>>,
    W: Fn(K) -> WF,
    WF: Future<Output = Result<K>>,
    T: Fn(&mut K) -> bool,
{
    let read = &read;
    let write = &write;
    let transform = &transform;
    retry_on_conflict(retry, operation, move |attempt| async move {
        let Some(mut obj) = read().await? else {
            debug!(operation, "object gone, skipping status write");
            return Ok(None);
        };
        if !transform(&mut obj) {
            return Ok(Some(obj));
        }
        if attempt > 1 {
            debug!(operation, attempt, "re-applying status transform");
        }
        write(obj).await.map(Some)
    })
    .await
}

/// Format a duration the way Go's `time.Duration` prints, e.g. `1m3.5s`
pub fn format_duration(d: Duration) -> String {
    fn trim(value: f64, precision: usize) -> String {
        let s = format!("{value:.precision$}");
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    }

    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_micros(1) {
        return format!("{}ns", d.as_nanos());
    }
    if d < Duration::from_millis(1) {
        return format!("{}µs", trim(d.as_nanos() as f64 / 1e3, 3));
    }
    if d < Duration::from_secs(1) {
        return format!("{}ms", trim(d.as_nanos() as f64 / 1e6, 6));
    }

    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = (total % 60) as f64 + f64::from(d.subsec_nanos()) / 1e9;
    let seconds = format!("{}s", trim(seconds, 9));
    match (hours, minutes) {
        (0, 0) => seconds,
        (0, m) => format!("{m}m{seconds}"),
        (h, m) => format!("{h}h{m}m{seconds}"),
    }
}

/// Writes status blocks and emits events for the rest of the system
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn EventPublisher>,
    retry: RetryConfig,
}

impl StatusReporter {
    /// Create a reporter
    pub fn new(
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventPublisher>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            events,
            retry,
        }
    }

    /// Publish a Normal event
    pub async fn normal(&self, obj: &ObjectReference, reason: &str, action: &str, note: String) {
        self.events
            .publish(obj, EventType::Normal, reason, action, Some(note))
            .await;
    }

    /// Publish a Warning event
    pub async fn warning(&self, obj: &ObjectReference, reason: &str, action: &str, note: String) {
        self.events
            .publish(obj, EventType::Warning, reason, action, Some(note))
            .await;
    }

    /// Record a successful run on a BackupConfiguration.
    ///
    /// Bumps the backup count, sets the last backup time to the run start
    /// and the first backup time when unset.
    pub async fn record_backup_success(
        &self,
        namespace: &str,
        name: &str,
        started: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Option<BackupConfiguration>> {
        let store = &self.store;
        let took = format_duration(duration);
        let updated = read_modify_write(
            &self.retry,
            "update backup configuration status",
            || store.get_backup_configuration(namespace, name),
            |obj| async move { store.replace_backup_configuration_status(&obj).await },
            |config: &mut BackupConfiguration| {
                let status = config.status.get_or_insert_with(Default::default);
                status.backup_count += 1;
                status.last_backup_time = Some(started);
                status.last_successful_backup_time = Some(started);
                status.first_backup_time.get_or_insert(started);
                status.last_backup_duration = Some(took.clone());
                true
            },
        )
        .await?;

        if let Some(config) = &updated {
            info!(
                namespace,
                name,
                backup_count = config.status_or_default().backup_count,
                duration = %took,
                "Recorded backup"
            );
        }
        Ok(updated)
    }

    /// Clear `spec.schedule` on a BackupConfiguration
    pub async fn reset_schedule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupConfiguration>> {
        let store = &self.store;
        read_modify_write(
            &self.retry,
            "reset schedule",
            || store.get_backup_configuration(namespace, name),
            |obj| async move { store.replace_backup_configuration(&obj).await },
            |config: &mut BackupConfiguration| {
                if config.spec.schedule.is_empty() {
                    return false;
                }
                config.spec.schedule.clear();
                true
            },
        )
        .await
    }

    /// Record a successful backup on a Repository.
    ///
    /// `snapshots_removed` is the number of snapshots the run's forget steps
    /// removed.
    pub async fn record_repository_backup(
        &self,
        namespace: &str,
        name: &str,
        started: DateTime<Utc>,
        duration: Duration,
        snapshots_removed: i64,
    ) -> Result<Option<Repository>> {
        let store = &self.store;
        let took = format_duration(duration);
        read_modify_write(
            &self.retry,
            "update repository status",
            || store.get_repository(namespace, name),
            |obj| async move { store.replace_repository_status(&obj).await },
            |repo: &mut Repository| {
                let status = repo.status.get_or_insert_with(Default::default);
                status.backup_count += 1;
                status.last_backup_time = Some(started);
                status.first_backup_time.get_or_insert(started);
                status.last_backup_duration = Some(took.clone());
                status.snapshots_removed_on_last_cleanup = Some(snapshots_removed);
                true
            },
        )
        .await
    }

    /// Record the outcome of a repository check
    pub async fn record_repository_check(
        &self,
        namespace: &str,
        name: &str,
        integrity: bool,
        snapshot_count: Option<i64>,
        size: Option<String>,
    ) -> Result<Option<Repository>> {
        let store = &self.store;
        read_modify_write(
            &self.retry,
            "update repository status",
            || store.get_repository(namespace, name),
            |obj| async move { store.replace_repository_status(&obj).await },
            |repo: &mut Repository| {
                let status = repo.status.get_or_insert_with(Default::default);
                status.integrity = Some(integrity);
                if snapshot_count.is_some() {
                    status.snapshot_count = snapshot_count;
                }
                if size.is_some() {
                    status.size = size.clone();
                }
                true
            },
        )
        .await
    }

    /// Upsert this host's entry on a BackupSession and recompute its phase.
    ///
    /// Returns false when the host already reached a terminal phase.
    pub async fn update_backup_session_host(
        &self,
        namespace: &str,
        name: &str,
        entry: HostStatus,
        total_hosts: Option<i32>,
    ) -> Result<bool> {
        let store = &self.store;
        let applied = AtomicBool::new(false);
        read_modify_write(
            &self.retry,
            "update backup session status",
            || store.get_backup_session(namespace, name),
            |obj| async move { store.replace_backup_session_status(&obj).await },
            |session: &mut BackupSession| {
                let status = session.status.get_or_insert_with(Default::default);
                if total_hosts.is_some() {
                    status.total_hosts = total_hosts;
                }
                let changed = upsert_host(&mut status.hosts, entry.clone());
                status.phase = overall_phase(&status.hosts, expected(status.total_hosts));
                applied.store(changed, Ordering::Relaxed);
                changed
            },
        )
        .await?;
        Ok(applied.load(Ordering::Relaxed))
    }

    /// Upsert this host's entry on a RestoreSession and recompute its phase.
    ///
    /// Returns false when the host already reached a terminal phase.
    pub async fn update_restore_session_host(
        &self,
        namespace: &str,
        name: &str,
        entry: HostStatus,
        total_hosts: Option<i32>,
    ) -> Result<bool> {
        let store = &self.store;
        let applied = AtomicBool::new(false);
        read_modify_write(
            &self.retry,
            "update restore session status",
            || store.get_restore_session(namespace, name),
            |obj| async move { store.replace_restore_session_status(&obj).await },
            |session: &mut RestoreSession| {
                let status = session.status.get_or_insert_with(Default::default);
                if total_hosts.is_some() {
                    status.total_hosts = total_hosts;
                }
                let changed = upsert_host(&mut status.hosts, entry.clone());
                status.phase = overall_phase(&status.hosts, expected(status.total_hosts));
                applied.store(changed, Ordering::Relaxed);
                changed
            },
        )
        .await?;
        Ok(applied.load(Ordering::Relaxed))
    }

    /// Phase currently recorded for `hostname` on a BackupSession
    pub async fn backup_session_host_phase(
        &self,
        namespace: &str,
        name: &str,
        hostname: &str,
    ) -> Result<Option<SessionPhase>> {
        Ok(self
            .store
            .get_backup_session(namespace, name)
            .await?
            .and_then(|s| s.status)
            .and_then(|s| s.hosts.into_iter().find(|h| h.hostname == hostname))
            .map(|h| h.phase))
    }
}

fn expected(total_hosts: Option<i32>) -> Option<usize> {
    total_hosts.and_then(|n| usize::try_from(n).ok())
}
