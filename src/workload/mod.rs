//! Uniform view over the workload kinds that can carry a backup sidecar
//!
//! Deployment, ReplicaSet, ReplicationController, StatefulSet and DaemonSet
//! all embed a pod template; [`Workload`] exposes the parts the sidecar
//! reconciler and the executor need without matching on the kind at every
//! call site.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{ObjectReference, PodSpec, ReplicationController};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::PrefixType;
use crate::{Error, Result};

/// Supported workload kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 ReplicaSet
    ReplicaSet,
    /// core/v1 ReplicationController
    ReplicationController,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// apps/v1 DaemonSet
    DaemonSet,
}

impl WorkloadKind {
    /// Every kind, in watch start order
    pub const ALL: [WorkloadKind; 5] = [
        Self::Deployment,
        Self::ReplicaSet,
        Self::ReplicationController,
        Self::StatefulSet,
        Self::DaemonSet,
    ];

    /// API group/version serving this kind
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::ReplicationController => "v1",
            _ => "apps/v1",
        }
    }

    /// Lowercase kind, used in prefixes and repository names
    pub fn lower(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::ReplicaSet => "replicaset",
            Self::ReplicationController => "replicationcontroller",
            Self::StatefulSet => "statefulset",
            Self::DaemonSet => "daemonset",
        }
    }

    /// Whether the workload controller rolls pods on a template change.
    ///
    /// ReplicaSets and ReplicationControllers do not, so their pods are
    /// deleted to pick up the new template.
    pub fn rolls_on_template_change(&self) -> bool {
        !matches!(self, Self::ReplicaSet | Self::ReplicationController)
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deployment => "Deployment",
            Self::ReplicaSet => "ReplicaSet",
            Self::ReplicationController => "ReplicationController",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Ok(Self::Deployment),
            "replicaset" | "replicasets" | "rs" => Ok(Self::ReplicaSet),
            "replicationcontroller" | "replicationcontrollers" | "rc" => {
                Ok(Self::ReplicationController)
            }
            "statefulset" | "statefulsets" | "sts" => Ok(Self::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Ok(Self::DaemonSet),
            _ => Err(Error::validation(format!(
                "unsupported workload kind {s:?}, expected one of: Deployment, ReplicaSet, \
                 ReplicationController, StatefulSet, DaemonSet"
            ))),
        }
    }
}

/// A workload object of any supported kind
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    /// Deployment
    Deployment(Deployment),
    /// ReplicaSet
    ReplicaSet(ReplicaSet),
    /// ReplicationController
    ReplicationController(ReplicationController),
    /// StatefulSet
    StatefulSet(StatefulSet),
    /// DaemonSet
    DaemonSet(DaemonSet),
}

macro_rules! impl_from_workload {
    ($($ty:ident),*) => {
        $(
            impl From<$ty> for Workload {
                fn from(obj: $ty) -> Self {
                    Self::$ty(obj)
                }
            }
        )*
    };
}

impl_from_workload!(Deployment, ReplicaSet, ReplicationController, StatefulSet, DaemonSet);

impl Workload {
    /// Kind of this workload
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Self::Deployment(_) => WorkloadKind::Deployment,
            Self::ReplicaSet(_) => WorkloadKind::ReplicaSet,
            Self::ReplicationController(_) => WorkloadKind::ReplicationController,
            Self::StatefulSet(_) => WorkloadKind::StatefulSet,
            Self::DaemonSet(_) => WorkloadKind::DaemonSet,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(o) => &o.metadata,
            Self::ReplicaSet(o) => &o.metadata,
            Self::ReplicationController(o) => &o.metadata,
            Self::StatefulSet(o) => &o.metadata,
            Self::DaemonSet(o) => &o.metadata,
        }
    }

    /// Mutable object metadata
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Deployment(o) => &mut o.metadata,
            Self::ReplicaSet(o) => &mut o.metadata,
            Self::ReplicationController(o) => &mut o.metadata,
            Self::StatefulSet(o) => &mut o.metadata,
            Self::DaemonSet(o) => &mut o.metadata,
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::Deployment(o) => o.name_any(),
            Self::ReplicaSet(o) => o.name_any(),
            Self::ReplicationController(o) => o.name_any(),
            Self::StatefulSet(o) => o.name_any(),
            Self::DaemonSet(o) => o.name_any(),
        }
    }

    /// Object namespace
    pub fn namespace(&self) -> String {
        self.meta().namespace.clone().unwrap_or_default()
    }

    /// `Kind namespace/name`, for logs and errors
    pub fn describe(&self) -> String {
        format!("{} {}/{}", self.kind(), self.namespace(), self.name())
    }

    /// True for ReplicaSets whose controller is a Deployment.
    ///
    /// Those follow their Deployment's template and are never edited directly.
    pub fn is_deployment_managed(&self) -> bool {
        matches!(self, Self::ReplicaSet(_))
            && self
                .meta()
                .owner_references
                .iter()
                .flatten()
                .any(|o| o.controller == Some(true) && o.kind == "Deployment")
    }

    /// Workload labels
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.meta().labels.clone().unwrap_or_default()
    }

    /// Annotation value, if set
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Current resourceVersion
    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    /// Reference for attaching events to this workload
    pub fn object_ref(&self) -> ObjectReference {
        let meta = self.meta();
        ObjectReference {
            api_version: Some(self.kind().api_version().to_string()),
            kind: Some(self.kind().to_string()),
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
            ..Default::default()
        }
    }

    /// Pod spec of the template
    pub fn pod_spec(&self) -> Option<&PodSpec> {
        match self {
            Self::Deployment(o) => o.spec.as_ref().and_then(|s| s.template.spec.as_ref()),
            Self::ReplicaSet(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.template.as_ref())
                .and_then(|t| t.spec.as_ref()),
            Self::ReplicationController(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.template.as_ref())
                .and_then(|t| t.spec.as_ref()),
            Self::StatefulSet(o) => o.spec.as_ref().and_then(|s| s.template.spec.as_ref()),
            Self::DaemonSet(o) => o.spec.as_ref().and_then(|s| s.template.spec.as_ref()),
        }
    }

    /// Mutable pod spec of the template
    pub fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        match self {
            Self::Deployment(o) => o.spec.as_mut().and_then(|s| s.template.spec.as_mut()),
            Self::ReplicaSet(o) => o
                .spec
                .as_mut()
                .and_then(|s| s.template.as_mut())
                .and_then(|t| t.spec.as_mut()),
            Self::ReplicationController(o) => o
                .spec
                .as_mut()
                .and_then(|s| s.template.as_mut())
                .and_then(|t| t.spec.as_mut()),
            Self::StatefulSet(o) => o.spec.as_mut().and_then(|s| s.template.spec.as_mut()),
            Self::DaemonSet(o) => o.spec.as_mut().and_then(|s| s.template.spec.as_mut()),
        }
    }

    /// Pod selector of the workload
    pub fn selector(&self) -> Option<LabelSelector> {
        match self {
            Self::Deployment(o) => o.spec.as_ref().map(|s| s.selector.clone()),
            Self::ReplicaSet(o) => o.spec.as_ref().map(|s| s.selector.clone()),
            Self::ReplicationController(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.selector.clone())
                .map(|match_labels| LabelSelector {
                    match_labels: Some(match_labels),
                    match_expressions: None,
                }),
            Self::StatefulSet(o) => o.spec.as_ref().map(|s| s.selector.clone()),
            Self::DaemonSet(o) => o.spec.as_ref().map(|s| s.selector.clone()),
        }
    }

    /// True once the controller observed the latest generation and every
    /// desired replica runs the current template and is ready.
    pub fn is_rolled_out(&self) -> bool {
        let generation = self.meta().generation.unwrap_or(0);
        match self {
            Self::Deployment(o) => {
                let desired = o.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                o.status.as_ref().is_some_and(|s| {
                    s.observed_generation.unwrap_or(0) >= generation
                        && s.updated_replicas.unwrap_or(0) >= desired
                        && s.ready_replicas.unwrap_or(0) >= desired
                })
            }
            Self::ReplicaSet(o) => {
                let desired = o.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                o.status.as_ref().is_some_and(|s| {
                    s.observed_generation.unwrap_or(0) >= generation
                        && s.ready_replicas.unwrap_or(0) >= desired
                })
            }
            Self::ReplicationController(o) => {
                let desired = o.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                o.status.as_ref().is_some_and(|s| {
                    s.observed_generation.unwrap_or(0) >= generation
                        && s.ready_replicas.unwrap_or(0) >= desired
                })
            }
            Self::StatefulSet(o) => {
                let desired = o.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                o.status.as_ref().is_some_and(|s| {
                    s.observed_generation.unwrap_or(0) >= generation
                        && s.updated_replicas.unwrap_or(0) >= desired
                        && s.ready_replicas.unwrap_or(0) >= desired
                })
            }
            Self::DaemonSet(o) => o.status.as_ref().is_some_and(|s| {
                s.observed_generation.unwrap_or(0) >= generation
                    && s.updated_number_scheduled.unwrap_or(0) >= s.desired_number_scheduled
                    && s.number_ready >= s.desired_number_scheduled
            }),
        }
    }

    /// PVC names whose volumes the workload's pods mount.
    ///
    /// StatefulSet claim templates expand to `{template}-{sts}-{ordinal}` for
    /// every replica.
    pub fn pvc_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pod_spec()
            .and_then(|p| p.volumes.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|v| v.persistent_volume_claim.as_ref())
            .map(|pvc| pvc.claim_name.clone())
            .collect();

        if let Self::StatefulSet(sts) = self {
            let name = sts.name_any();
            if let Some(spec) = &sts.spec {
                let replicas = spec.replicas.unwrap_or(1).max(0);
                for template in spec.volume_claim_templates.iter().flatten() {
                    let claim = template.metadata.name.clone().unwrap_or_default();
                    for ordinal in 0..replicas {
                        names.push(format!("{claim}-{name}-{ordinal}"));
                    }
                }
            }
        }
        names
    }
}

/// Snapshot hostname and repository prefix for one sidecar
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostIdentity {
    /// `--host` passed to restic
    pub hostname: String,
    /// Prefix derived from the workload kind
    pub smart_prefix: String,
    /// Node the sidecar runs on
    pub node_name: String,
    /// Pod the sidecar runs in
    pub pod_name: String,
}

impl HostIdentity {
    /// Derive the identity for a sidecar of `kind`/`name`.
    ///
    /// Deployments, ReplicaSets and ReplicationControllers share one host
    /// named after the workload. StatefulSet pods are hosts of their own.
    /// DaemonSet pods are keyed by node and get their own prefix.
    pub fn derive(kind: WorkloadKind, name: &str, pod_name: &str, node_name: &str) -> Self {
        let base = format!("{}/{}", kind.lower(), name);
        let (hostname, smart_prefix) = match kind {
            WorkloadKind::Deployment
            | WorkloadKind::ReplicaSet
            | WorkloadKind::ReplicationController => (name.to_string(), base),
            WorkloadKind::StatefulSet => (pod_name.to_string(), base),
            WorkloadKind::DaemonSet => (node_name.to_string(), format!("{base}/{node_name}")),
        };
        Self {
            hostname,
            smart_prefix,
            node_name: node_name.to_string(),
            pod_name: pod_name.to_string(),
        }
    }

    /// Prefix appended to the backend path under `prefix_type`
    pub fn prefix(&self, prefix_type: PrefixType) -> &str {
        match prefix_type {
            PrefixType::Smart => &self.smart_prefix,
            PrefixType::NodeName => &self.node_name,
            PrefixType::PodName => &self.pod_name,
            PrefixType::Disabled => "",
        }
    }

    /// Repository object name for `prefix_type`
    pub fn repository_name(&self, prefix_type: PrefixType) -> String {
        match self.prefix(prefix_type) {
            "" => "default".to_string(),
            prefix => prefix.replace('/', "."),
        }
    }
}
