//! In-process cron table
//!
//! One entry per BackupConfiguration, keyed by `namespace/name`. Each entry
//! is a task that sleeps until the next fire time and then hands the run to
//! a [`BackupRunner`] behind the shared [`BackupGate`]. A fire that finds the
//! gate held is skipped; the next tick is the next chance.

mod gate;
mod schedule;

pub use gate::{BackupGate, GateGuard};
pub use schedule::Schedule;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::crd::BackupConfiguration;
use crate::events::{actions, reasons};
use crate::status::StatusReporter;
use crate::{Error, Result};

/// Executes one backup run for a configuration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupRunner: Send + Sync {
    /// Run a backup of `namespace/name` that was triggered at `fired_at`
    async fn run_once(&self, namespace: &str, name: &str, fired_at: DateTime<Utc>) -> Result<()>;
}

/// Result of a single fire
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FireOutcome {
    /// The runner was invoked
    Ran,
    /// Another run held the gate
    Skipped {
        /// Key of the run holding the gate
        holder: String,
    },
}

struct Entry {
    expression: String,
    handle: JoinHandle<()>,
}

struct Inner {
    runner: Arc<dyn BackupRunner>,
    reporter: StatusReporter,
    gate: BackupGate,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let entries = self
            .entries
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
    }
}

/// Cron table plus backup gate
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<Inner>,
}

impl CronScheduler {
    /// Create an empty scheduler
    pub fn new(runner: Arc<dyn BackupRunner>, reporter: StatusReporter) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                reporter,
                gate: BackupGate::new(),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Expression currently installed for `key`
    pub fn scheduled_expression(&self, key: &str) -> Option<String> {
        self.entries().get(key).map(|e| e.expression.clone())
    }

    /// (Re)install the cron entry for a configuration.
    ///
    /// An unchanged expression keeps the running entry. An empty one leaves
    /// the configuration unscheduled. An unparseable one is reported with a
    /// Warning event and cleared from the object; that is not an error.
    pub async fn configure(&self, config: &BackupConfiguration) -> Result<()> {
        let key = config.key();
        let namespace = config.namespace().unwrap_or_default();
        let name = config.name_any();
        let expression = config.spec.schedule.trim().to_string();

        if self.scheduled_expression(&key).as_deref() == Some(expression.as_str()) {
            return Ok(());
        }
        self.unschedule(&key);

        if expression.is_empty() {
            debug!(%key, "No schedule, nothing to install");
            return Ok(());
        }

        let schedule = match Schedule::parse(&expression) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(%key, schedule = %expression, error = %e, "Invalid schedule, resetting");
                let obj = config.object_ref(&());
                let reporter = &self.inner.reporter;
                reporter
                    .warning(
                        &obj,
                        reasons::INVALID_CRON_EXPRESSION,
                        actions::SCHEDULE,
                        e.to_string(),
                    )
                    .await;
                reporter.reset_schedule(&namespace, &name).await?;
                reporter
                    .normal(
                        &obj,
                        reasons::SUCCESSFUL_CRON_EXPRESSION_RESET,
                        actions::SCHEDULE,
                        format!("Cleared invalid schedule {expression:?}"),
                    )
                    .await;
                return Ok(());
            }
        };

        let handle = tokio::spawn(drive(
            Arc::downgrade(&self.inner),
            schedule,
            namespace,
            name,
        ));
        info!(%key, schedule = %expression, "Installed cron entry");
        self.entries().insert(key, Entry { expression, handle });
        Ok(())
    }

    /// Remove the entry for `key`, if any
    pub fn unschedule(&self, key: &str) -> bool {
        match self.entries().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                info!(%key, "Removed cron entry");
                true
            }
            None => false,
        }
    }

    /// Stop every entry; in-flight runs finish on their own
    pub fn shutdown(&self) {
        for (_, entry) in self.entries().drain() {
            entry.handle.abort();
        }
    }

    /// Run one fire for `namespace/name` behind the gate
    pub async fn fire(
        &self,
        namespace: &str,
        name: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<FireOutcome> {
        let key = format!("{namespace}/{name}");
        let _guard = match self.inner.gate.try_acquire(&key) {
            Ok(guard) => guard,
            Err(Error::Busy { holder }) => {
                warn!(%key, %holder, "Previous backup still running, skipping this fire");
                return Ok(FireOutcome::Skipped { holder });
            }
            Err(e) => return Err(e),
        };

        debug!(%key, %fired_at, "Cron fired");
        match self.inner.runner.run_once(namespace, name, fired_at).await {
            Ok(()) => Ok(FireOutcome::Ran),
            Err(e) => {
                error!(%key, error = %e, "Scheduled backup failed");
                self.inner
                    .reporter
                    .warning(
                        &configuration_ref(namespace, name),
                        reasons::FAILED_CRON_JOB,
                        actions::BACKUP,
                        e.to_string(),
                    )
                    .await;
                Err(e)
            }
        }
    }
}

fn configuration_ref(namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(BackupConfiguration::api_version(&()).to_string()),
        kind: Some(BackupConfiguration::kind(&()).to_string()),
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

async fn drive(inner: Weak<Inner>, schedule: Schedule, namespace: String, name: String) {
    let mut after = Utc::now();
    while let Some(next) = schedule.next_after(after) {
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let scheduler = CronScheduler { inner };
        let (namespace, name) = (namespace.clone(), name.clone());
        tokio::spawn(async move {
            // Failures are already logged and reported by fire()
            let _ = scheduler.fire(&namespace, &name, next).await;
        });
        after = next;
    }
    warn!(namespace = %namespace, name = %name, "Schedule has no further fire times");
}
