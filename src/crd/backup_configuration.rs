//! BackupConfiguration Custom Resource Definition
//!
//! A BackupConfiguration declares what to back up (file groups inside
//! workloads picked by a label selector, or a single target workload), where
//! to store it (one backend plus a secret) and when (a cron schedule).

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Backend, FileGroup, PrefixType, TargetRef};
use crate::Error;

/// Specification for a BackupConfiguration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stash.dev",
    version = "v1alpha1",
    kind = "BackupConfiguration",
    plural = "backupconfigurations",
    shortname = "bc",
    status = "BackupConfigurationStatus",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.paused"}"#,
    printcolumn = r#"{"name":"Backups","type":"integer","jsonPath":".status.backupCount"}"#,
    printcolumn = r#"{"name":"Last","type":"date","jsonPath":".status.lastBackupTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfigurationSpec {
    /// Single workload targeted by this configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetRef>,

    /// Workloads whose labels match get the sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Paths to back up, processed in order
    #[serde(default)]
    pub file_groups: Vec<FileGroup>,

    /// Where snapshots are stored
    pub backend: Backend,

    /// Cron expression; empty means never scheduled
    #[serde(default)]
    pub schedule: String,

    /// Workload volumes mounted into the sidecar
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Prefix appended to the backend path per host
    #[serde(default)]
    pub use_auto_prefix: PrefixType,

    /// Skip scheduled runs while true
    #[serde(default)]
    pub paused: bool,
}

/// Status written by the executor after each successful run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfigurationStatus {
    /// Time of the first successful run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_backup_time: Option<DateTime<Utc>>,

    /// Time of the most recent run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_time: Option<DateTime<Utc>>,

    /// Time of the most recent successful run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_backup_time: Option<DateTime<Utc>>,

    /// Duration of the most recent run, e.g. `1m3.5s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_duration: Option<String>,

    /// Number of successful runs
    #[serde(default)]
    pub backup_count: i64,
}

impl BackupConfigurationSpec {
    /// Validate the specification
    pub fn validate(&self) -> Result<(), Error> {
        self.backend.provider()?;

        if self.backend.storage_secret_name.is_empty() {
            return Err(Error::validation("backend.storageSecretName is required"));
        }

        if self.target.is_none() && self.selector.is_none() {
            return Err(Error::validation(
                "either target or selector must be specified",
            ));
        }

        if let Some(target) = &self.target {
            if target.kind.is_empty() || target.name.is_empty() {
                return Err(Error::validation("target requires kind and name"));
            }
        }

        for (i, fg) in self.file_groups.iter().enumerate() {
            if !fg.path.starts_with('/') {
                return Err(Error::validation(format!(
                    "fileGroups[{i}].path must be absolute, got {:?}",
                    fg.path
                )));
            }
        }

        Ok(())
    }
}

impl BackupConfiguration {
    /// `namespace/name` identity used as cron entry and queue key
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Current status or an empty one
    pub fn status_or_default(&self) -> BackupConfigurationStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{LocalSpec, RetentionPolicy};
    use std::collections::BTreeMap;

    fn sample_spec() -> BackupConfigurationSpec {
        BackupConfigurationSpec {
            selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([("app".to_string(), "db".to_string())])),
                ..Default::default()
            }),
            file_groups: vec![FileGroup {
                path: "/data".to_string(),
                tags: vec![],
                retention_policy: RetentionPolicy {
                    keep_last: Some(5),
                    ..Default::default()
                },
            }],
            backend: Backend {
                local: Some(LocalSpec {
                    mount_path: "/repo".to_string(),
                    ..Default::default()
                }),
                storage_secret_name: "local-secret".to_string(),
                ..Default::default()
            },
            schedule: "@every 1m".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn spec_without_secret_is_rejected() {
        let mut spec = sample_spec();
        spec.backend.storage_secret_name.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn spec_without_target_or_selector_is_rejected() {
        let mut spec = sample_spec();
        spec.selector = None;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn relative_paths_are_rejected() {
        let mut spec = sample_spec();
        spec.file_groups[0].path = "data".to_string();
        let err = spec.validate().unwrap_err().to_string();
        assert!(err.contains("fileGroups[0]"), "{err}");
    }

    #[test]
    fn spec_roundtrips_through_camel_case_yaml() {
        let yaml = r#"
selector:
  matchLabels:
    app: db
fileGroups:
  - path: /data
    retentionPolicy:
      keepLast: 5
      prune: true
backend:
  s3:
    endpoint: s3.amazonaws.com
    bucket: backups
  storageSecretName: s3-secret
schedule: "*/5 * * * *"
useAutoPrefix: NodeName
"#;
        let spec: BackupConfigurationSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.file_groups[0].retention_policy.keep_last, Some(5));
        assert!(spec.file_groups[0].retention_policy.prune);
        assert_eq!(spec.use_auto_prefix, PrefixType::NodeName);
        assert!(!spec.paused);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn key_is_namespace_slash_name() {
        let mut cfg = BackupConfiguration::new("db-backup", sample_spec());
        cfg.metadata.namespace = Some("prod".to_string());
        assert_eq!(cfg.key(), "prod/db-backup");
        assert_eq!(cfg.status_or_default().backup_count, 0);
    }
}
