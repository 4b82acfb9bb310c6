//! Custom Resource Definitions for Stash
//!
//! This module contains all CRD definitions used by the Stash operator, plus
//! the client-side VolumeSnapshot type owned by the CSI snapshot controller.

mod backup_configuration;
mod repository;
mod session;
mod types;
mod volume_snapshot;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use backup_configuration::{
    BackupConfiguration, BackupConfigurationSpec, BackupConfigurationStatus,
};
pub use repository::{Repository, RepositorySpec, RepositoryStatus};
pub use session::{
    BackupSession, BackupSessionSpec, BackupSessionStatus, RestoreRule, RestoreSession,
    RestoreSessionSpec, RestoreSessionStatus,
};
pub use types::{
    overall_phase, upsert_host, AzureSpec, B2Spec, Backend, BackendProvider, FileGroup, GcsSpec,
    HostStatus, LocalSpec, PrefixType, RestSpec, RetentionPolicy, S3Spec, SessionPhase,
    SwiftSpec, TargetRef,
};
pub use volume_snapshot::{
    snapshot_name, VolumeSnapshot, VolumeSnapshotError, VolumeSnapshotSource,
    VolumeSnapshotSpec, VolumeSnapshotStatus,
};

/// Every CRD this operator owns, in install order
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        BackupConfiguration::crd(),
        Repository::crd(),
        BackupSession::crd(),
        RestoreSession::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_crds_share_the_api_group() {
        let crds = all_crds();
        assert_eq!(crds.len(), 4);
        for crd in &crds {
            assert_eq!(crd.spec.group, "stash.dev");
            assert_eq!(crd.spec.scope, "Namespaced");
        }
        let names: Vec<_> = crds.iter().filter_map(|c| c.metadata.name.clone()).collect();
        assert!(names.contains(&"backupconfigurations.stash.dev".to_string()));
        assert!(names.contains(&"repositories.stash.dev".to_string()));
    }
}
