//! Resource watch layer
//!
//! Turns workload and BackupConfiguration changes into typed [`Trigger`]s.
//! Classification is pure; [`controller`] feeds it from kube-runtime
//! controllers and hands the mutating work to the sidecar reconciler or the
//! cron scheduler.

pub mod controller;
mod requeue;

pub use controller::{build_workload_controllers, error_policy, reconcile_workload, WatchContext};
pub use requeue::RequeueTracker;

use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::crd::BackupConfiguration;
use crate::scheduler::CronScheduler;
use crate::selector::find_configuration;
use crate::workload::{Workload, WorkloadKind};
use crate::Result;

/// What a watched change asks the rest of the system to do
#[derive(Clone, Debug, PartialEq)]
pub enum Trigger {
    /// The workload matches a configuration whose sidecar it does not carry
    SidecarNeedsAdd(Box<BackupConfiguration>),
    /// The workload carries a sidecar no configuration wants anymore
    SidecarNeedsRemove {
        /// Configuration named by the workload's owning annotation
        owner: String,
    },
    /// The configuration's cron entry must be (re)installed
    ScheduleNeedsUpdate(Box<BackupConfiguration>),
    /// The configuration's cron entry must go
    ScheduleRemoved,
    /// Nothing to do
    Unchanged,
}

/// Source of BackupConfigurations for classification
pub trait ConfigLookup: Send + Sync {
    /// Every configuration in `namespace`
    fn in_namespace(&self, namespace: &str) -> Vec<BackupConfiguration>;
}

impl ConfigLookup for Store<BackupConfiguration> {
    fn in_namespace(&self, namespace: &str) -> Vec<BackupConfiguration> {
        self.state()
            .iter()
            .filter(|c| c.namespace().as_deref() == Some(namespace))
            .map(|c| c.as_ref().clone())
            .collect()
    }
}

impl ConfigLookup for Vec<BackupConfiguration> {
    fn in_namespace(&self, namespace: &str) -> Vec<BackupConfiguration> {
        self.iter()
            .filter(|c| c.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect()
    }
}

fn targets(config: &BackupConfiguration, kind: WorkloadKind, name: &str) -> bool {
    config.spec.target.as_ref().is_some_and(|t| {
        t.name == name && t.kind.parse::<WorkloadKind>().is_ok_and(|k| k == kind)
    })
}

/// The configuration that should own `workload`'s sidecar.
///
/// An explicit target wins over a selector match. Among several candidates
/// of the same sort, the smallest name wins.
pub fn desired_configuration<'a>(
    workload: &Workload,
    configs: &'a [BackupConfiguration],
) -> Option<&'a BackupConfiguration> {
    let namespace = workload.namespace();
    let (kind, name) = (workload.kind(), workload.name());

    let targeted = configs
        .iter()
        .filter(|c| c.namespace().as_deref() == Some(namespace.as_str()))
        .filter(|c| targets(c, kind, &name))
        .min_by_key(|c| c.name_any());
    if targeted.is_some() {
        return targeted;
    }

    let same_namespace: Vec<BackupConfiguration> = configs
        .iter()
        .filter(|c| c.namespace().as_deref() == Some(namespace.as_str()))
        .filter(|c| c.spec.target.is_none())
        .cloned()
        .collect();
    let chosen = find_configuration(&same_namespace, &workload.labels())?.name_any();
    configs
        .iter()
        .find(|c| c.namespace().as_deref() == Some(namespace.as_str()) && c.name_any() == chosen)
}

/// Compare the configuration `workload` should carry with the one its
/// annotation says it carries
pub fn classify_workload(workload: &Workload, configs: &[BackupConfiguration]) -> Trigger {
    if workload.is_deployment_managed() {
        return Trigger::Unchanged;
    }
    let current = workload.annotation(crate::ANNOTATION_CONFIG_NAME);
    match (desired_configuration(workload, configs), current) {
        (Some(config), Some(owner)) if owner == config.name_any() => Trigger::Unchanged,
        (Some(config), _) => Trigger::SidecarNeedsAdd(Box::new(config.clone())),
        (None, Some(owner)) => Trigger::SidecarNeedsRemove {
            owner: owner.to_string(),
        },
        (None, None) => Trigger::Unchanged,
    }
}

/// Compare the installed cron expression with the configuration's.
///
/// `config` is `None` once the configuration is gone.
pub fn classify_configuration(
    installed: Option<&str>,
    config: Option<&BackupConfiguration>,
) -> Trigger {
    let Some(config) = config else {
        return match installed {
            Some(_) => Trigger::ScheduleRemoved,
            None => Trigger::Unchanged,
        };
    };
    let wanted = config.spec.schedule.trim();
    match (installed, wanted.is_empty()) {
        (Some(current), _) if current == wanted => Trigger::Unchanged,
        (None, true) => Trigger::Unchanged,
        (Some(_), true) => Trigger::ScheduleRemoved,
        (_, false) => Trigger::ScheduleNeedsUpdate(Box::new(config.clone())),
    }
}

/// Apply one watch event of the sidecar's own configuration to `scheduler`
pub async fn handle_configuration_event(
    scheduler: &CronScheduler,
    event: watcher::Event<BackupConfiguration>,
) -> Result<()> {
    let (config, deleted) = match event {
        watcher::Event::Apply(c) | watcher::Event::InitApply(c) => (c, false),
        watcher::Event::Delete(c) => (c, true),
        watcher::Event::Init | watcher::Event::InitDone => return Ok(()),
    };
    let key = config.key();
    let installed = scheduler.scheduled_expression(&key);
    let current = (!deleted).then_some(&config);

    match classify_configuration(installed.as_deref(), current) {
        Trigger::ScheduleNeedsUpdate(config) => {
            info!(%key, schedule = %config.spec.schedule, "Schedule changed");
            scheduler.configure(&config).await
        }
        Trigger::ScheduleRemoved => {
            if deleted {
                warn!(%key, "BackupConfiguration deleted, stopping schedule");
            }
            scheduler.unschedule(&key);
            Ok(())
        }
        _ => {
            debug!(%key, "Schedule unchanged");
            Ok(())
        }
    }
}
