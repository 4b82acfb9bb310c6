//! Repository Custom Resource Definition
//!
//! A Repository tracks one restic repository: the backend it lives in and
//! aggregate statistics maintained by backup runs and the `check` command.

use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Backend;

/// Specification for a Repository
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stash.dev",
    version = "v1alpha1",
    kind = "Repository",
    plural = "repositories",
    shortname = "repo",
    status = "RepositoryStatus",
    namespaced,
    printcolumn = r#"{"name":"Integrity","type":"boolean","jsonPath":".status.integrity"}"#,
    printcolumn = r#"{"name":"Size","type":"string","jsonPath":".status.size"}"#,
    printcolumn = r#"{"name":"Snapshots","type":"integer","jsonPath":".status.snapshotCount"}"#,
    printcolumn = r#"{"name":"Last","type":"date","jsonPath":".status.lastBackupTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// Backend with the host prefix already applied
    pub backend: Backend,
}

/// Repository statistics
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatus {
    /// Result of the last `restic check`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<bool>,

    /// Raw data size, e.g. `1.2 GiB`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Number of snapshots in the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_count: Option<i64>,

    /// Snapshots removed by the last forget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots_removed_on_last_cleanup: Option<i64>,

    /// Time of the first successful backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_backup_time: Option<DateTime<Utc>>,

    /// Time of the last successful backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_time: Option<DateTime<Utc>>,

    /// Duration of the last successful backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_duration: Option<String>,

    /// Number of successful backups
    #[serde(default)]
    pub backup_count: i64,
}

impl Repository {
    /// Repository object for one host of a configuration
    pub fn for_host(
        namespace: &str,
        name: &str,
        configuration: &str,
        backend: Backend,
    ) -> Self {
        let mut repo = Repository::new(name, RepositorySpec { backend });
        repo.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(
                    crate::LABEL_BACKUP_CONFIGURATION.to_string(),
                    configuration.to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        };
        repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_host_labels_the_owning_configuration() {
        let repo = Repository::for_host("prod", "deployment.api", "api-backup", Backend::default());
        assert_eq!(repo.metadata.namespace.as_deref(), Some("prod"));
        assert_eq!(repo.metadata.name.as_deref(), Some("deployment.api"));
        assert_eq!(
            repo.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(crate::LABEL_BACKUP_CONFIGURATION))
                .map(String::as_str),
            Some("api-backup")
        );
        assert!(repo.status.is_none());
    }
}
