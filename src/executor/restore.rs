//! RestoreSession execution for one host

use std::sync::Arc;

use kube::Resource;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::crd::{HostStatus, RestoreRule, RestoreSession, SessionPhase};
use crate::events::{actions, reasons};
use crate::options::Options;
use crate::restic::{CommandRunner, ResticWrapper};
use crate::status::{format_duration, StatusReporter};
use crate::store::ResourceStore;
use crate::workload::HostIdentity;
use crate::{Error, Result};

use super::repository_restic;

/// Restores data for the host this process serves
#[derive(Clone)]
pub struct RestoreExecutor {
    store: Arc<dyn ResourceStore>,
    reporter: StatusReporter,
    commands: Arc<dyn CommandRunner>,
    options: Arc<Options>,
    host: HostIdentity,
}

impl RestoreExecutor {
    /// Create an executor restoring as `host`
    pub fn new(
        store: Arc<dyn ResourceStore>,
        reporter: StatusReporter,
        commands: Arc<dyn CommandRunner>,
        options: Arc<Options>,
        host: HostIdentity,
    ) -> Self {
        Self {
            store,
            reporter,
            commands,
            options,
            host,
        }
    }

    async fn restic_for(&self, session: &RestoreSession, namespace: &str) -> Result<ResticWrapper> {
        repository_restic(
            self.store.as_ref(),
            self.commands.clone(),
            &self.options,
            namespace,
            &session.spec.repository,
        )
        .await
    }

    async fn apply_rule(&self, restic: &ResticWrapper, rule: &RestoreRule) -> Result<()> {
        let source = rule
            .source_host
            .as_deref()
            .unwrap_or(self.host.hostname.as_str());

        if !rule.snapshots.is_empty() {
            for snapshot in restic.snapshots(&rule.snapshots).await? {
                let path = snapshot.paths.first().ok_or_else(|| {
                    Error::validation(format!("snapshot {} records no path", snapshot.id))
                })?;
                info!(snapshot = %snapshot.id, %path, "Restoring snapshot");
                restic
                    .restore(path, source, Some(snapshot.id.as_str()))
                    .await?;
            }
            return Ok(());
        }

        for path in &rule.paths {
            info!(%path, %source, "Restoring latest snapshot");
            restic.restore(path, source, None).await?;
        }
        Ok(())
    }

    /// Run the rule of `namespace/session_name` that applies to this host.
    ///
    /// Hosts without a matching rule have nothing to do. The outcome is
    /// recorded as this host's entry on the session.
    #[instrument(skip(self), fields(host = %self.host.hostname))]
    pub async fn run(&self, namespace: &str, session_name: &str) -> Result<()> {
        let session = self
            .store
            .get_restore_session(namespace, session_name)
            .await?
            .ok_or_else(|| Error::not_found("RestoreSession", namespace, session_name))?;
        let hostname = self.host.hostname.clone();
        let obj = session.object_ref(&());
        let clock = Instant::now();

        let result = match session.spec.validate() {
            Err(e) => Err(e),
            Ok(()) => match session.spec.rule_for_host(&hostname) {
                None => {
                    info!("No restore rule for this host");
                    return Ok(());
                }
                Some(rule) => {
                    let running = HostStatus::new(hostname.clone(), SessionPhase::Running);
                    if !self
                        .reporter
                        .update_restore_session_host(namespace, session_name, running, None)
                        .await?
                    {
                        info!("Host already finished this restore");
                        return Ok(());
                    }
                    match self.restic_for(&session, namespace).await {
                        Ok(restic) => self.apply_rule(&restic, rule).await,
                        Err(e) => Err(e),
                    }
                }
            },
        };

        let took = format_duration(clock.elapsed());
        let mut entry = HostStatus::new(hostname.clone(), SessionPhase::Succeeded);
        entry.duration = Some(took.clone());
        match &result {
            Ok(()) => {
                self.reporter
                    .normal(
                        &obj,
                        reasons::HOST_RESTORE_SUCCEEDED,
                        actions::RESTORE,
                        format!("Restore completed for host {hostname} in {took}"),
                    )
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Restore failed");
                entry.phase = SessionPhase::Failed;
                entry.error = Some(e.to_string());
                self.reporter
                    .warning(
                        &obj,
                        reasons::HOST_RESTORE_FAILED,
                        actions::RESTORE,
                        format!("Restore failed for host {hostname}: {e}"),
                    )
                    .await;
            }
        }
        self.reporter
            .update_restore_session_host(namespace, session_name, entry, None)
            .await?;
        result
    }
}
