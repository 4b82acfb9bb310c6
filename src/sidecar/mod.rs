//! Sidecar injection and removal
//!
//! The pure half lives here: building the sidecar container and applying or
//! stripping it, its volumes and the owning annotations on a pod template.
//! [`reconciler`] submits those edits to the API server.

pub mod reconciler;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ObjectFieldSelector, PodSpec, Volume, VolumeMount,
};
use kube::ResourceExt;

use crate::crd::BackupConfiguration;
use crate::options::Options;
use crate::workload::{Workload, WorkloadKind};
use crate::{Error, Result};

pub use reconciler::{KubeWorkloadClient, SidecarReconciler, WorkloadClient};

/// Image tag for the sidecar of `config`.
///
/// The configuration's own tag annotation wins over the process default.
pub fn sidecar_image_tag(config: &BackupConfiguration, options: &Options) -> String {
    config
        .annotations()
        .get(crate::ANNOTATION_VERSION_TAG)
        .filter(|t| !t.is_empty())
        .cloned()
        .unwrap_or_else(|| options.image_tag.clone())
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

/// The sidecar container for a workload backed up by `config`
pub fn sidecar_container(
    config: &BackupConfiguration,
    kind: WorkloadKind,
    workload_name: &str,
    options: &Options,
) -> Container {
    let mut args = vec![
        "backup".to_string(),
        format!("--backup-configuration={}", config.name_any()),
        format!("--workload-kind={kind}"),
        format!("--workload-name={workload_name}"),
        format!("--scratch-dir={}", crate::SCRATCH_MOUNT_PATH),
        format!("--enable-cache={}", options.enable_cache),
        format!("--max-connections={}", options.max_connections),
        format!("--metrics-enabled={}", options.metrics_enabled),
        format!("--pushgateway-url={}", options.pushgateway_url),
    ];
    if !options.resync_period.is_zero() {
        args.push(format!("--resync-period={}s", options.resync_period.as_secs()));
    }

    let mut volume_mounts = config.spec.volume_mounts.clone();
    volume_mounts.push(VolumeMount {
        name: crate::SCRATCH_VOLUME.to_string(),
        mount_path: crate::SCRATCH_MOUNT_PATH.to_string(),
        ..Default::default()
    });
    volume_mounts.push(VolumeMount {
        name: crate::PODINFO_VOLUME.to_string(),
        mount_path: crate::PODINFO_MOUNT_PATH.to_string(),
        ..Default::default()
    });
    if let Some(local) = &config.spec.backend.local {
        volume_mounts.push(VolumeMount {
            name: crate::LOCAL_VOLUME.to_string(),
            mount_path: local.mount_path.clone(),
            ..Default::default()
        });
    }

    Container {
        name: crate::SIDECAR_CONTAINER.to_string(),
        image: Some(format!(
            "{}:{}",
            options.image,
            sidecar_image_tag(config, options)
        )),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(args),
        env: Some(vec![
            field_env("NODE_NAME", "spec.nodeName"),
            field_env("POD_NAME", "metadata.name"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
        ]),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

fn upsert_by_name<T>(items: &mut Option<Vec<T>>, item: T, name: impl Fn(&T) -> &str) {
    let list = items.get_or_insert_with(Vec::new);
    let key = name(&item).to_string();
    match list.iter_mut().find(|i| name(i) == key) {
        Some(existing) => *existing = item,
        None => list.push(item),
    }
}

fn remove_by_name<T>(items: &mut Option<Vec<T>>, key: &str, name: impl Fn(&T) -> &str) {
    if let Some(list) = items {
        list.retain(|i| name(i) != key);
        if list.is_empty() {
            *items = None;
        }
    }
}

fn scratch_volume() -> Volume {
    Volume {
        name: crate::SCRATCH_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn podinfo_volume() -> Volume {
    Volume {
        name: crate::PODINFO_VOLUME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(vec![DownwardAPIVolumeFile {
                path: "labels".to_string(),
                field_ref: Some(ObjectFieldSelector {
                    api_version: None,
                    field_path: "metadata.labels".to_string(),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_spec_mut(workload: &mut Workload) -> Result<&mut PodSpec> {
    let describe = workload.describe();
    workload
        .pod_spec_mut()
        .ok_or_else(|| Error::validation(format!("{describe} has no pod template")))
}

/// Add the sidecar, its volumes and the owning annotations to `workload`.
///
/// Every edit is an upsert keyed by name, so applying twice equals applying
/// once.
pub fn apply_sidecar(
    workload: &mut Workload,
    config: &BackupConfiguration,
    container: Container,
    image_tag: &str,
) -> Result<()> {
    let spec = pod_spec_mut(workload)?;
    let mut containers = Some(std::mem::take(&mut spec.containers));
    upsert_by_name(&mut containers, container, |c| c.name.as_str());
    spec.containers = containers.unwrap_or_default();

    upsert_by_name(&mut spec.volumes, scratch_volume(), |v| v.name.as_str());
    upsert_by_name(&mut spec.volumes, podinfo_volume(), |v| v.name.as_str());
    match &config.spec.backend.local {
        Some(local) => {
            let mut volume = local.volume.clone();
            volume.name = crate::LOCAL_VOLUME.to_string();
            upsert_by_name(&mut spec.volumes, volume, |v| v.name.as_str());
        }
        None => remove_by_name(&mut spec.volumes, crate::LOCAL_VOLUME, |v| v.name.as_str()),
    }

    let annotations = workload
        .meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new);
    annotations.insert(crate::ANNOTATION_CONFIG_NAME.to_string(), config.name_any());
    annotations.insert(crate::ANNOTATION_VERSION_TAG.to_string(), image_tag.to_string());
    Ok(())
}

/// Strip the sidecar, its volumes and the owning annotations from `workload`
pub fn remove_sidecar(workload: &mut Workload) -> Result<()> {
    let spec = pod_spec_mut(workload)?;
    spec.containers.retain(|c| c.name != crate::SIDECAR_CONTAINER);
    for name in [
        crate::SCRATCH_VOLUME,
        crate::PODINFO_VOLUME,
        crate::LOCAL_VOLUME,
    ] {
        remove_by_name(&mut spec.volumes, name, |v| v.name.as_str());
    }

    let meta = workload.meta_mut();
    if let Some(annotations) = &mut meta.annotations {
        annotations.remove(crate::ANNOTATION_CONFIG_NAME);
        annotations.remove(crate::ANNOTATION_VERSION_TAG);
        if annotations.is_empty() {
            meta.annotations = None;
        }
    }
    Ok(())
}

/// True when the pod template carries the sidecar container
pub fn has_sidecar(spec: &PodSpec) -> bool {
    spec.containers
        .iter()
        .any(|c| c.name == crate::SIDECAR_CONTAINER)
}
