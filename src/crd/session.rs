//! BackupSession and RestoreSession Custom Resource Definitions
//!
//! A session records one invocation. Every participating host reports its
//! own entry; the session phase is derived from those entries.

use std::collections::HashMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{HostStatus, SessionPhase};
use crate::Error;

/// Specification for a BackupSession
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stash.dev",
    version = "v1alpha1",
    kind = "BackupSession",
    plural = "backupsessions",
    shortname = "bs",
    status = "BackupSessionStatus",
    namespaced,
    printcolumn = r#"{"name":"Configuration","type":"string","jsonPath":".spec.backupConfiguration"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSessionSpec {
    /// Name of the BackupConfiguration to run, same namespace
    pub backup_configuration: String,
}

/// BackupSession progress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSessionStatus {
    /// Overall phase derived from the host entries
    #[serde(default)]
    pub phase: SessionPhase,

    /// Number of hosts expected to report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_hosts: Option<i32>,

    /// One entry per host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<HostStatus>,
}

/// Specification for a RestoreSession
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "stash.dev",
    version = "v1alpha1",
    kind = "RestoreSession",
    plural = "restoresessions",
    shortname = "rs",
    status = "RestoreSessionStatus",
    namespaced,
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".spec.repository"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSessionSpec {
    /// Name of the Repository to restore from, same namespace
    pub repository: String,

    /// Which hosts restore what
    #[serde(default)]
    pub rules: Vec<RestoreRule>,
}

/// One restore rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRule {
    /// Hosts this rule applies to; empty means every host without its own rule
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_hosts: Vec<String>,

    /// Host whose snapshots are restored; defaults to the restoring host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_host: Option<String>,

    /// Paths to restore from their latest snapshot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,

    /// Snapshot IDs to restore
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<String>,
}

/// RestoreSession progress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSessionStatus {
    /// Overall phase derived from the host entries
    #[serde(default)]
    pub phase: SessionPhase,

    /// Number of hosts expected to report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_hosts: Option<i32>,

    /// One entry per host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<HostStatus>,
}

impl RestoreSessionSpec {
    /// Validate the rule set.
    ///
    /// At most one rule may leave `targetHosts` empty, no host may be named
    /// by two rules, and a rule may not set both `snapshots` and `paths`.
    pub fn validate(&self) -> Result<(), Error> {
        let catch_all: Vec<String> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.target_hosts.is_empty())
            .map(|(i, _)| format!("rule[{i}]"))
            .collect();
        if catch_all.len() > 1 {
            return Err(Error::validation(format!(
                "{} rules found with empty targetHosts ({}); at most one is allowed",
                catch_all.len(),
                catch_all.join(", ")
            )));
        }

        let mut owner: HashMap<&str, usize> = HashMap::new();
        for (i, rule) in self.rules.iter().enumerate() {
            for host in &rule.target_hosts {
                if let Some(prev) = owner.insert(host.as_str(), i) {
                    return Err(Error::validation(format!(
                        "rule[{prev}] and rule[{i}] both match host {host:?}"
                    )));
                }
            }
        }

        for (i, rule) in self.rules.iter().enumerate() {
            if !rule.snapshots.is_empty() && !rule.paths.is_empty() {
                return Err(Error::validation(format!(
                    "rule[{i}] sets both snapshots and paths; a snapshot holds a single path"
                )));
            }
        }

        Ok(())
    }

    /// Rule applying to `host`: the one naming it, else the catch-all rule
    pub fn rule_for_host(&self, host: &str) -> Option<&RestoreRule> {
        self.rules
            .iter()
            .find(|r| r.target_hosts.iter().any(|h| h == host))
            .or_else(|| self.rules.iter().find(|r| r.target_hosts.is_empty()))
    }
}
