//! Kubernetes Event recording for Stash.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that the scheduler, executor and sidecar reconciler can emit standard
//! Kubernetes Events visible via `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never fail a backup.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "SuccessfulBackup")
    /// * `action` - What action was taken (e.g. "Backup")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given component name.
    ///
    /// The component name appears as the "reportingComponent" on Events
    /// (e.g. "stash-operator" or "stash-sidecar").
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for one-shot commands run without an event sink.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Backup runs
    /// Secret, backend or repository setup failed before any backup ran
    pub const FAILED_SETUP: &str = "FailedSetup";
    /// One file group was backed up
    pub const SUCCESSFUL_BACKUP: &str = "SuccessfulBackup";
    /// restic backup failed for a file group
    pub const FAILED_TO_BACKUP: &str = "FailedToBackup";
    /// restic forget failed for a file group
    pub const FAILED_TO_RETENTION: &str = "FailedToRetention";

    // Scheduling
    /// A scheduled fire returned an error
    pub const FAILED_CRON_JOB: &str = "FailedCronJob";
    /// spec.schedule does not parse
    pub const INVALID_CRON_EXPRESSION: &str = "InvalidCronExpression";
    /// An invalid spec.schedule was cleared
    pub const SUCCESSFUL_CRON_EXPRESSION_RESET: &str = "SuccessfulCronExpressionReset";

    // Sidecar lifecycle
    /// Sidecar added to a workload
    pub const SIDECAR_INJECTED: &str = "SidecarInjected";
    /// Adding the sidecar failed
    pub const SIDECAR_INJECTION_FAILED: &str = "SidecarInjectionFailed";
    /// Sidecar removed from a workload
    pub const SIDECAR_REMOVED: &str = "SidecarRemoved";
    /// Removing the sidecar failed
    pub const SIDECAR_REMOVAL_FAILED: &str = "SidecarRemovalFailed";

    // Sessions
    /// One host finished its share of a BackupSession
    pub const HOST_BACKUP_SUCCEEDED: &str = "HostBackupSucceeded";
    /// One host failed its share of a BackupSession
    pub const HOST_BACKUP_FAILED: &str = "HostBackupFailed";
    /// One host finished its share of a RestoreSession
    pub const HOST_RESTORE_SUCCEEDED: &str = "HostRestoreSucceeded";
    /// One host failed its share of a RestoreSession
    pub const HOST_RESTORE_FAILED: &str = "HostRestoreFailed";
    /// A VolumeSnapshot became ready
    pub const VOLUME_SNAPSHOT_CREATED: &str = "VolumeSnapshotCreated";
    /// A VolumeSnapshot could not be created or never became ready
    pub const VOLUME_SNAPSHOT_FAILED: &str = "VolumeSnapshotFailed";

    // Repository maintenance
    /// restic check passed
    pub const REPOSITORY_CHECK_SUCCEEDED: &str = "RepositoryCheckSucceeded";
    /// restic check failed
    pub const REPOSITORY_CHECK_FAILED: &str = "RepositoryCheckFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Preparing backend credentials and the repository
    pub const SETUP: &str = "Setup";
    /// Running restic backup
    pub const BACKUP: &str = "Backup";
    /// Running restic forget
    pub const RETENTION: &str = "Retention";
    /// Installing or firing a cron entry
    pub const SCHEDULE: &str = "Schedule";
    /// Adding the sidecar
    pub const INJECT_SIDECAR: &str = "InjectSidecar";
    /// Removing the sidecar
    pub const REMOVE_SIDECAR: &str = "RemoveSidecar";
    /// Running restic restore
    pub const RESTORE: &str = "Restore";
    /// Creating a VolumeSnapshot
    pub const SNAPSHOT: &str = "Snapshot";
    /// Running restic check
    pub const CHECK: &str = "Check";
}
