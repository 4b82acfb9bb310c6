//! Supporting types shared by the Stash CRDs

use k8s_openapi::api::core::v1::Volume;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One unit of backup work: a path, its snapshot tags and retention
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileGroup {
    /// Absolute path inside the sidecar to back up
    pub path: String,

    /// Tags attached to every snapshot of this path
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Which snapshots of this path to keep
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
}

/// Snapshot retention for one file group
///
/// All-zero is legal and means no forget runs for the group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    /// Keep the last N snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<u32>,
    /// Keep the last N hourly snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_hourly: Option<u32>,
    /// Keep the last N daily snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_daily: Option<u32>,
    /// Keep the last N weekly snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<u32>,
    /// Keep the last N monthly snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<u32>,
    /// Keep the last N yearly snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_yearly: Option<u32>,
    /// Keep snapshots carrying any of these tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keep_tags: Vec<String>,
    /// Remove unreferenced data after forgetting
    #[serde(default)]
    pub prune: bool,
    /// Only report what would be removed
    #[serde(default)]
    pub dry_run: bool,
}

impl RetentionPolicy {
    /// Keep counts in restic flag order, skipping zero and unset entries
    pub fn keep_flags(&self) -> Vec<(&'static str, u32)> {
        [
            ("--keep-last", self.keep_last),
            ("--keep-hourly", self.keep_hourly),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ]
        .into_iter()
        .filter_map(|(flag, n)| n.filter(|n| *n > 0).map(|n| (flag, n)))
        .collect()
    }

    /// True when forgetting with this policy would not select anything
    pub fn is_empty(&self) -> bool {
        self.keep_flags().is_empty() && self.keep_tags.is_empty()
    }
}

/// Local backend: a volume mounted into the sidecar
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalSpec {
    /// Volume holding the repository; renamed on injection
    pub volume: Volume,
    /// Where the volume is mounted in the sidecar
    pub mount_path: String,
}

/// S3 or S3-compatible backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Spec {
    /// Endpoint host, e.g. `s3.amazonaws.com`
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Path prefix inside the bucket
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
}

/// Google Cloud Storage backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsSpec {
    /// Bucket name
    pub bucket: String,
    /// Path prefix inside the bucket
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
}

/// Azure Blob Storage backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureSpec {
    /// Container name
    pub container: String,
    /// Path prefix inside the container
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
}

/// OpenStack Swift backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwiftSpec {
    /// Container name
    pub container: String,
    /// Path prefix inside the container
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
}

/// Backblaze B2 backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct B2Spec {
    /// Bucket name
    pub bucket: String,
    /// Path prefix inside the bucket
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
}

/// restic REST server backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestSpec {
    /// Server URL; credentials from the secret are added as user-info
    pub url: String,
}

/// Storage backend descriptor
///
/// Exactly one variant must be populated, see [`Backend::provider`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// Local volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSpec>,
    /// S3
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Spec>,
    /// GCS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsSpec>,
    /// Azure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureSpec>,
    /// Swift
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift: Option<SwiftSpec>,
    /// B2
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b2: Option<B2Spec>,
    /// REST server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<RestSpec>,

    /// Secret holding `RESTIC_PASSWORD` and backend credentials
    #[serde(default)]
    pub storage_secret_name: String,
}

/// The single populated backend variant
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BackendProvider<'a> {
    /// Local volume
    Local(&'a LocalSpec),
    /// S3
    S3(&'a S3Spec),
    /// GCS
    Gcs(&'a GcsSpec),
    /// Azure
    Azure(&'a AzureSpec),
    /// Swift
    Swift(&'a SwiftSpec),
    /// B2
    B2(&'a B2Spec),
    /// REST server
    Rest(&'a RestSpec),
}

impl BackendProvider<'_> {
    /// Short provider name, as used in logs and `-o <name>.connections`
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::S3(_) => "s3",
            Self::Gcs(_) => "gs",
            Self::Azure(_) => "azure",
            Self::Swift(_) => "swift",
            Self::B2(_) => "b2",
            Self::Rest(_) => "rest",
        }
    }

    /// Whether restic honours `-o <name>.connections` for this provider
    pub fn supports_connection_limit(&self) -> bool {
        matches!(self, Self::Gcs(_) | Self::Azure(_) | Self::B2(_))
    }
}

impl Backend {
    /// Return the single populated variant.
    ///
    /// Fails when no variant or more than one variant is set.
    pub fn provider(&self) -> Result<BackendProvider<'_>> {
        let mut found: Vec<BackendProvider<'_>> = Vec::with_capacity(1);
        if let Some(spec) = &self.local {
            found.push(BackendProvider::Local(spec));
        }
        if let Some(spec) = &self.s3 {
            found.push(BackendProvider::S3(spec));
        }
        if let Some(spec) = &self.gcs {
            found.push(BackendProvider::Gcs(spec));
        }
        if let Some(spec) = &self.azure {
            found.push(BackendProvider::Azure(spec));
        }
        if let Some(spec) = &self.swift {
            found.push(BackendProvider::Swift(spec));
        }
        if let Some(spec) = &self.b2 {
            found.push(BackendProvider::B2(spec));
        }
        if let Some(spec) = &self.rest {
            found.push(BackendProvider::Rest(spec));
        }

        match found.as_slice() {
            [one] => Ok(*one),
            [] => Err(Error::validation("backend must set exactly one provider, found none")),
            many => Err(Error::validation(format!(
                "backend must set exactly one provider, found {}: {}",
                many.len(),
                many.iter().map(|p| p.name()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// True when the local variant is populated
    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }
}

/// Reference to the workload a configuration targets
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// Workload kind (Deployment, StatefulSet, ...)
    pub kind: String,
    /// Workload name, in the configuration's namespace
    pub name: String,
    /// VolumeSnapshotClass used by `create-vs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Which prefix is appended to the backend path for a host
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PrefixType {
    /// Derived from the workload kind (see [`crate::workload::HostIdentity`])
    #[default]
    Smart,
    /// The node name
    NodeName,
    /// The pod name
    PodName,
    /// No prefix
    #[serde(rename = "None")]
    Disabled,
}

/// Phase of a session or of one host within it
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SessionPhase {
    /// Not started
    #[default]
    Pending,
    /// In progress
    Running,
    /// Completed successfully
    Succeeded,
    /// Completed with an error
    Failed,
    /// Observation lost
    Unknown,
}

impl SessionPhase {
    /// Terminal phases accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Per-host outcome within a session
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    /// Snapshot hostname (or PVC name for volume snapshots)
    pub hostname: String,
    /// Host phase
    pub phase: SessionPhase,
    /// Human-readable duration, e.g. `1m3.5s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostStatus {
    /// Entry in the given phase with no duration or error
    pub fn new(hostname: impl Into<String>, phase: SessionPhase) -> Self {
        Self {
            hostname: hostname.into(),
            phase,
            duration: None,
            error: None,
        }
    }
}

/// Insert or replace the entry for `entry.hostname`.
///
/// Returns false and leaves the list unchanged when the existing entry is
/// already terminal.
pub fn upsert_host(hosts: &mut Vec<HostStatus>, entry: HostStatus) -> bool {
    match hosts.iter_mut().find(|h| h.hostname == entry.hostname) {
        Some(existing) if existing.phase.is_terminal() => false,
        Some(existing) => {
            *existing = entry;
            true
        }
        None => {
            hosts.push(entry);
            true
        }
    }
}

/// Overall phase of a session from its host entries.
///
/// `expected` is the number of hosts the session waits for, when known.
pub fn overall_phase(hosts: &[HostStatus], expected: Option<usize>) -> SessionPhase {
    if hosts.is_empty() {
        return SessionPhase::Pending;
    }
    if hosts.iter().any(|h| h.phase == SessionPhase::Unknown) {
        return SessionPhase::Unknown;
    }
    let all_reported = expected.map_or(true, |n| hosts.len() >= n);
    if all_reported && hosts.iter().all(|h| h.phase.is_terminal()) {
        if hosts.iter().any(|h| h.phase == SessionPhase::Failed) {
            SessionPhase::Failed
        } else {
            SessionPhase::Succeeded
        }
    } else {
        SessionPhase::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_flags_skip_zero_counts() {
        let policy = RetentionPolicy {
            keep_last: Some(5),
            keep_daily: Some(0),
            keep_weekly: Some(2),
            ..Default::default()
        };
        assert_eq!(
            policy.keep_flags(),
            vec![("--keep-last", 5), ("--keep-weekly", 2)]
        );
        assert!(!policy.is_empty());
        assert!(RetentionPolicy::default().is_empty());

        let tags_only = RetentionPolicy {
            keep_tags: vec!["weekly".to_string()],
            ..Default::default()
        };
        assert!(!tags_only.is_empty());
    }

    /// Story: a backend naming no provider or two providers is rejected
    #[test]
    fn story_backend_requires_exactly_one_provider() {
        let empty = Backend::default();
        assert!(matches!(empty.provider(), Err(Error::Validation(_))));

        let s3 = Backend {
            s3: Some(S3Spec {
                endpoint: "s3.amazonaws.com".to_string(),
                bucket: "backups".to_string(),
                prefix: String::new(),
            }),
            storage_secret_name: "s3-secret".to_string(),
            ..Default::default()
        };
        assert_eq!(s3.provider().unwrap().name(), "s3");

        let both = Backend {
            gcs: Some(GcsSpec::default()),
            ..s3.clone()
        };
        let err = both.provider().unwrap_err().to_string();
        assert!(err.contains("found 2"), "{err}");
        assert!(err.contains("s3") && err.contains("gs"), "{err}");
    }

    #[test]
    fn connection_limit_applies_to_gcs_azure_b2() {
        let gcs = GcsSpec::default();
        let s3 = S3Spec::default();
        assert!(BackendProvider::Gcs(&gcs).supports_connection_limit());
        assert!(!BackendProvider::S3(&s3).supports_connection_limit());
    }

    /// Story: once a host reached a terminal phase, late updates are ignored
    #[test]
    fn story_terminal_host_phase_is_sticky() {
        let mut hosts = vec![];
        assert!(upsert_host(
            &mut hosts,
            HostStatus::new("db-0", SessionPhase::Running)
        ));
        assert!(upsert_host(
            &mut hosts,
            HostStatus::new("db-0", SessionPhase::Succeeded)
        ));
        assert!(!upsert_host(
            &mut hosts,
            HostStatus::new("db-0", SessionPhase::Running)
        ));
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].phase, SessionPhase::Succeeded);
    }

    #[test]
    fn overall_phase_follows_hosts() {
        assert_eq!(overall_phase(&[], None), SessionPhase::Pending);

        let running = [
            HostStatus::new("a", SessionPhase::Succeeded),
            HostStatus::new("b", SessionPhase::Running),
        ];
        assert_eq!(overall_phase(&running, None), SessionPhase::Running);

        let done = [
            HostStatus::new("a", SessionPhase::Succeeded),
            HostStatus::new("b", SessionPhase::Failed),
        ];
        assert_eq!(overall_phase(&done, None), SessionPhase::Failed);
        assert_eq!(overall_phase(&done, Some(3)), SessionPhase::Running);

        let ok = [HostStatus::new("a", SessionPhase::Succeeded)];
        assert_eq!(overall_phase(&ok, Some(1)), SessionPhase::Succeeded);
    }

    #[test]
    fn prefix_type_none_serializes_as_none() {
        assert_eq!(
            serde_json::to_string(&PrefixType::Disabled).unwrap(),
            "\"None\""
        );
        let parsed: PrefixType = serde_json::from_str("\"PodName\"").unwrap();
        assert_eq!(parsed, PrefixType::PodName);
    }
}
