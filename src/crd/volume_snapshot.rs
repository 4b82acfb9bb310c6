//! Client-side definition of the CSI `VolumeSnapshot` resource
//!
//! The CRD itself is installed by the CSI snapshot controller; only the
//! fields `create-vs` reads and writes are modelled here.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a VolumeSnapshot
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    status = "VolumeSnapshotStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// What to snapshot
    pub source: VolumeSnapshotSource,

    /// Snapshot class; cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Snapshot source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    /// PVC to snapshot, same namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

/// Snapshot progress reported by the CSI controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// Snapshot can be used to provision a volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Restore size, e.g. `10Gi`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,

    /// Last error reported by the driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeSnapshotError>,
}

/// Driver error
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotError {
    /// Error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VolumeSnapshot {
    /// True once the CSI driver marked the snapshot ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Driver error message, if any
    pub fn error_message(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.error.as_ref())
            .and_then(|e| e.message.as_deref())
    }
}

/// Snapshot name for a PVC taken at `at`: `{pvc}-{yyyy}-{mm}-{dd}t{hh}-{mm}-{ss}-stash`
pub fn snapshot_name(pvc: &str, at: DateTime<Utc>) -> String {
    format!("{pvc}-{}-stash", at.format("%Y-%m-%dt%H-%M-%S"))
}
