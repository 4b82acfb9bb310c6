//! Backup session executor
//!
//! A run re-reads its BackupConfiguration, resolves the backend secret,
//! prepares the restic environment, makes sure the repository exists and
//! then backs up each file group in order, applying that group's retention
//! right after. The first failing group ends the run. Only a clean run
//! touches the status counters; metrics are pushed either way.

pub mod metrics;
pub mod restore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::{Resource, ResourceExt};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{Backend, BackupConfiguration, HostStatus, Repository, SessionPhase};
use crate::events::{actions, reasons};
use crate::options::Options;
use crate::restic::{count_removed, setup_env, CommandRunner, ResticOptions, ResticWrapper};
use crate::scheduler::BackupRunner;
use crate::status::{format_duration, StatusReporter};
use crate::store::ResourceStore;
use crate::workload::HostIdentity;
use crate::{Error, Result};

use self::metrics::{MetricsPusher, SessionMetrics};
pub use self::restore::RestoreExecutor;

/// Copy of `backend` whose path ends in `prefix`
pub fn backend_with_prefix(backend: &Backend, prefix: &str) -> Backend {
    fn join(base: &str, prefix: &str) -> String {
        match (base.trim_end_matches('/'), prefix.trim_matches('/')) {
            (base, "") => base.to_string(),
            ("", prefix) => prefix.to_string(),
            (base, prefix) => format!("{base}/{prefix}"),
        }
    }

    let mut out = backend.clone();
    if let Some(local) = out.local.as_mut() {
        local.mount_path = join(&local.mount_path, prefix);
    }
    if let Some(s3) = out.s3.as_mut() {
        s3.prefix = join(&s3.prefix, prefix);
    }
    if let Some(gcs) = out.gcs.as_mut() {
        gcs.prefix = join(&gcs.prefix, prefix);
    }
    if let Some(azure) = out.azure.as_mut() {
        azure.prefix = join(&azure.prefix, prefix);
    }
    if let Some(swift) = out.swift.as_mut() {
        swift.prefix = join(&swift.prefix, prefix);
    }
    if let Some(b2) = out.b2.as_mut() {
        b2.prefix = join(&b2.prefix, prefix);
    }
    out
}

/// Tags attached to snapshots of one file group: its own tags followed by
/// the owning configuration's name
fn snapshot_tags(config: &BackupConfiguration, group_tags: &[String]) -> Vec<String> {
    let mut tags = group_tags.to_vec();
    let name = config.name_any();
    if !tags.contains(&name) {
        tags.push(name);
    }
    tags
}

/// restic wrapper for an existing Repository object.
///
/// The Repository backend already carries the host prefix.
pub async fn repository_restic(
    store: &dyn ResourceStore,
    commands: Arc<dyn CommandRunner>,
    options: &Options,
    namespace: &str,
    name: &str,
) -> Result<ResticWrapper> {
    let repo = store
        .get_repository(namespace, name)
        .await?
        .ok_or_else(|| Error::not_found("Repository", namespace, name))?;
    let secret_name = &repo.spec.backend.storage_secret_name;
    let secret = store
        .get_secret(namespace, secret_name)
        .await?
        .ok_or_else(|| Error::missing_secret(namespace, secret_name.as_str()))?;
    let env = setup_env(&repo.spec.backend, &secret, &options.scratch_dir, "")?;
    Ok(ResticWrapper::new(
        commands,
        env,
        ResticOptions::from(options),
    ))
}

/// Runs backups for the workload this process serves
#[derive(Clone)]
pub struct BackupExecutor {
    store: Arc<dyn ResourceStore>,
    reporter: StatusReporter,
    commands: Arc<dyn CommandRunner>,
    options: Arc<Options>,
    host: HostIdentity,
}

impl BackupExecutor {
    /// Create an executor acting as `host`
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

    /// Identity used for `--host` and the repository prefix
    pub fn host(&self) -> &HostIdentity {
        &self.host
    }

    async fn ensure_repository(
        &self,
        namespace: &str,
        config: &BackupConfiguration,
        prefix: &str,
    ) -> Result<String> {
        let name = self.host.repository_name(config.spec.use_auto_prefix);
        if self.store.get_repository(namespace, &name).await?.is_some() {
            return Ok(name);
        }

        let repo = Repository::for_host(
            namespace,
            &name,
            &config.name_any(),
            backend_with_prefix(&config.spec.backend, prefix),
        );
        match self.store.create_repository(&repo).await {
            Ok(_) => {
                info!(namespace, repository = %name, "Created Repository");
                Ok(name)
            }
            Err(e) if e.is_conflict() => Ok(name),
            Err(e) => Err(e),
        }
    }

    /// Environment, repository object and restic init
    async fn prepare(
        &self,
        namespace: &str,
        config: &BackupConfiguration,
        secret: &Secret,
    ) -> Result<(ResticWrapper, String)> {
        let prefix = self.host.prefix(config.spec.use_auto_prefix).to_string();
        let repository = self.ensure_repository(namespace, config, &prefix).await?;
        let env = setup_env(
            &config.spec.backend,
            secret,
            &self.options.scratch_dir,
            &prefix,
        )?;
        let restic = ResticWrapper::new(
            self.commands.clone(),
            env,
            ResticOptions::from(self.options.as_ref()),
        );
        restic.init_if_absent().await?;
        Ok((restic, repository))
    }

    /// Backup then forget per group; returns the number of snapshots removed
    async fn run_groups(
        &self,
        config: &BackupConfiguration,
        obj: &ObjectReference,
        restic: &ResticWrapper,
        metrics: &SessionMetrics,
    ) -> Result<i64> {
        let hostname = &self.host.hostname;
        let mut removed = 0;

        for group in &config.spec.file_groups {
            let tags = snapshot_tags(config, &group.tags);

            let clock = Instant::now();
            let backup = restic.backup(&group.path, hostname, &tags).await;
            metrics.observe(&group.path, "backup", clock.elapsed());
            match &backup {
                Ok(_) => {
                    info!(path = %group.path, %hostname, "Backed up file group");
                    self.reporter
                        .normal(
                            obj,
                            reasons::SUCCESSFUL_BACKUP,
                            actions::BACKUP,
                            format!("Backed up pod:{hostname} path:{}", group.path),
                        )
                        .await;
                }
                Err(e) => {
                    error!(path = %group.path, %hostname, error = %e, "Backup failed");
                    self.reporter
                        .warning(
                            obj,
                            reasons::FAILED_TO_BACKUP,
                            actions::BACKUP,
                            format!("Error taking backup of {}: {e}", group.path),
                        )
                        .await;
                }
            }

            // Retention runs regardless of the backup outcome
            let clock = Instant::now();
            let forget = restic
                .forget(&group.retention_policy, hostname, &group.path)
                .await;
            if !group.retention_policy.is_empty() {
                metrics.observe(&group.path, "forget", clock.elapsed());
            }
            if let Err(e) = &forget {
                error!(path = %group.path, error = %e, "Forget failed");
                self.reporter
                    .warning(
                        obj,
                        reasons::FAILED_TO_RETENTION,
                        actions::RETENTION,
                        format!("Error forgetting snapshots of {}: {e}", group.path),
                    )
                    .await;
            }

            backup?;
            if let Some(out) = forget? {
                removed += count_removed(&out);
            }
        }
        Ok(removed)
    }

    async fn push_metrics(&self, namespace: &str, name: &str, metrics: &SessionMetrics) {
        let pushed = match MetricsPusher::new(&self.options.pushgateway_url) {
            Ok(pusher) => {
                pusher
                    .push(&format!("{namespace}-{name}"), &self.host.hostname, metrics)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = pushed {
            warn!(namespace, name, error = %e, "Failed to push metrics");
        }
    }

    /// Execute a BackupSession for this host.
    ///
    /// The host entry moves Pending → Running → Succeeded or Failed. A host
    /// that already reported a terminal phase is skipped, so every session
    /// runs at most once per host.
    #[instrument(skip(self), fields(host = %self.host.hostname))]
    pub async fn run_session(&self, namespace: &str, session_name: &str) -> Result<()> {
        let Some(session) = self.store.get_backup_session(namespace, session_name).await? else {
            debug!("BackupSession is gone");
            return Ok(());
        };
        let hostname = self.host.hostname.clone();

        if let Some(phase) = self
            .reporter
            .backup_session_host_phase(namespace, session_name, &hostname)
            .await?
        {
            if phase.is_terminal() {
                debug!(%phase, "Session already handled by this host");
                return Ok(());
            }
        }

        let running = HostStatus::new(hostname.clone(), SessionPhase::Running);
        if !self
            .reporter
            .update_backup_session_host(namespace, session_name, running, None)
            .await?
        {
            return Ok(());
        }

        let clock = Instant::now();
        let result = self
            .run_once(namespace, &session.spec.backup_configuration, Utc::now())
            .await;
        let took = format_duration(clock.elapsed());

        let obj = session.object_ref(&());
        let mut entry = HostStatus::new(hostname.clone(), SessionPhase::Succeeded);
        entry.duration = Some(took.clone());
        match &result {
            Ok(()) => {
                self.reporter
                    .normal(
                        &obj,
                        reasons::HOST_BACKUP_SUCCEEDED,
                        actions::BACKUP,
                        format!("Backup completed for host {hostname} in {took}"),
                    )
                    .await;
            }
            Err(e) => {
                entry.phase = SessionPhase::Failed;
                entry.error = Some(e.to_string());
                self.reporter
                    .warning(
                        &obj,
                        reasons::HOST_BACKUP_FAILED,
                        actions::BACKUP,
                        format!("Backup failed for host {hostname}: {e}"),
                    )
                    .await;
            }
        }
        self.reporter
            .update_backup_session_host(namespace, session_name, entry, None)
            .await?;
        result
    }
}

#[async_trait]
impl BackupRunner for BackupExecutor {
    #[instrument(skip(self), fields(host = %self.host.hostname))]
    async fn run_once(&self, namespace: &str, name: &str, fired_at: DateTime<Utc>) -> Result<()> {
        let Some(config) = self.store.get_backup_configuration(namespace, name).await? else {
            debug!("BackupConfiguration was deleted, nothing to do");
            return Ok(());
        };
        if config.spec.paused {
            info!("BackupConfiguration is paused, skipping run");
            return Ok(());
        }
        let obj = config.object_ref(&());

        if let Err(e) = config.spec.validate() {
            self.reporter
                .warning(&obj, reasons::FAILED_SETUP, actions::SETUP, e.to_string())
                .await;
            return Err(e);
        }

        let secret_name = &config.spec.backend.storage_secret_name;
        let Some(secret) = self.store.get_secret(namespace, secret_name).await? else {
            let err = Error::missing_secret(namespace, secret_name.as_str());
            error!(error = %err, "Cannot run backup");
            self.reporter
                .warning(&obj, reasons::FAILED_SETUP, actions::SETUP, err.to_string())
                .await;
            return Err(err);
        };

        let clock = Instant::now();
        let metrics = SessionMetrics::new()?;

        let (restic, repository) = match self.prepare(namespace, &config, &secret).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, "Backup setup failed");
                self.reporter
                    .warning(&obj, reasons::FAILED_SETUP, actions::SETUP, e.to_string())
                    .await;
                metrics.finish(false, clock.elapsed());
                if self.options.metrics_enabled {
                    self.push_metrics(namespace, name, &metrics).await;
                }
                return Err(e);
            }
        };

        let result = self.run_groups(&config, &obj, &restic, &metrics).await;
        let took = clock.elapsed();
        metrics.finish(result.is_ok(), took);

        let outcome = match result {
            Ok(removed) => {
                info!(duration = %format_duration(took), "Backup run succeeded");
                self.reporter
                    .record_backup_success(namespace, name, fired_at, took)
                    .await?;
                self.reporter
                    .record_repository_backup(namespace, &repository, fired_at, took, removed)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        };

        if self.options.metrics_enabled {
            self.push_metrics(namespace, name, &metrics).await;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        BackupConfigurationSpec, BackupSession, BackupSessionSpec, FileGroup, LocalSpec,
        RetentionPolicy,
    };
    use crate::events::testing::RecordingPublisher;
    use crate::restic::testing::RecordingRunner;
    use crate::retry::RetryConfig;
    use crate::store::testing::InMemoryStore;
    use crate::workload::WorkloadKind;
    use chrono::TimeZone;
    use k8s_openapi::ByteString;
    use std::path::Path;

    struct Fixture {
        store: Arc<InMemoryStore>,
        events: Arc<RecordingPublisher>,
        restic: Arc<RecordingRunner>,
        executor: BackupExecutor,
        scratch: tempfile::TempDir,
        _mount: tempfile::TempDir,
    }

    fn group(path: &str, keep_last: Option<u32>) -> FileGroup {
        FileGroup {
            path: path.to_string(),
            tags: vec![],
            retention_policy: RetentionPolicy {
                keep_last,
                ..Default::default()
            },
        }
    }

    fn config(mount: &Path, groups: Vec<FileGroup>) -> BackupConfiguration {
        let mut c = BackupConfiguration::new(
            "db",
            BackupConfigurationSpec {
                selector: Some(Default::default()),
                file_groups: groups,
                schedule: "@every 1m".to_string(),
                backend: Backend {
                    local: Some(LocalSpec {
                        mount_path: mount.display().to_string(),
                        ..Default::default()
                    }),
                    storage_secret_name: "repo-secret".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        c.metadata.namespace = Some("default".to_string());
        c
    }

    fn secret() -> Secret {
        let mut s = Secret {
            data: Some(
                [(
                    "RESTIC_PASSWORD".to_string(),
                    ByteString(b"changeit".to_vec()),
                )]
                .into(),
            ),
            ..Default::default()
        };
        s.metadata.name = Some("repo-secret".to_string());
        s.metadata.namespace = Some("default".to_string());
        s
    }

    fn fixture(groups: Vec<FileGroup>) -> Fixture {
        let scratch = tempfile::tempdir().unwrap();
        let mount = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::default());
        store.put_config(config(mount.path(), groups));
        store.put_secret(secret());
        let events = Arc::new(RecordingPublisher::default());
        let restic = Arc::new(RecordingRunner::default());
        let options = Options {
            scratch_dir: scratch.path().to_path_buf(),
            ..Default::default()
        };
        let executor = BackupExecutor::new(
            store.clone(),
            StatusReporter::new(store.clone(), events.clone(), RetryConfig::conflict()),
            restic.clone(),
            Arc::new(options),
            HostIdentity::derive(WorkloadKind::Deployment, "db", "db-7d9f-x2", "node-1"),
        );
        Fixture {
            store,
            events,
            restic,
            executor,
            scratch,
            _mount: mount,
        }
    }

    fn fired_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap()
    }

    /// Story: one file group is backed up, tagged, then forgotten with its policy
    ///
    /// The configuration has `/data` with keepLast 5. After one run restic
    /// sees the probe, one backup of `/data` tagged with the configuration
    /// name and one forget with `--keep-last 5`.
    #[tokio::test]
    async fn story_single_group_backup_then_forget() {
        let f = fixture(vec![group("/data", Some(5))]);

        f.executor.run_once("default", "db", fired_at()).await.unwrap();

        assert_eq!(f.restic.subcommands(), vec!["snapshots", "backup", "forget"]);
        let calls = f.restic.calls();
        let backup = &calls[1].args;
        assert_eq!(&backup[..4], &["backup", "/data", "--host", "db"]);
        assert!(backup.windows(2).any(|w| w == ["--tag", "db"]));
        let forget = &calls[2].args;
        assert!(forget.windows(2).any(|w| w == ["--keep-last", "5"]));
        assert!(forget.windows(2).any(|w| w == ["--path", "/data"]));

        let status = f.store.config("default", "db").unwrap().status.unwrap();
        assert_eq!(status.backup_count, 1);
        assert_eq!(status.last_backup_time, Some(fired_at()));
        assert_eq!(f.events.reasons(), vec![reasons::SUCCESSFUL_BACKUP.to_string()]);
    }

    /// Story: a deleted secret fails the run before any subprocess starts
    #[tokio::test]
    async fn story_missing_secret_runs_nothing() {
        let f = fixture(vec![group("/data", Some(5))]);
        f.store.delete_secret("default", "repo-secret");

        let err = f
            .executor
            .run_once("default", "db", fired_at())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MissingSecret { .. }), "{err}");
        assert!(f.restic.calls().is_empty());
        assert_eq!(f.events.warnings(), 1);
        assert_eq!(f.events.reasons(), vec![reasons::FAILED_SETUP.to_string()]);
        assert!(f.store.config("default", "db").unwrap().status.is_none());
    }

    /// Story: the first group's backup fails and the second group never runs
    ///
    /// The failing group still gets its forget; the count stays untouched.
    #[tokio::test]
    async fn story_first_group_failure_stops_the_run() {
        let f = fixture(vec![group("/first", Some(3)), group("/second", Some(3))]);
        f.restic.fail("backup", "Fatal: unable to save snapshot");

        let err = f
            .executor
            .run_once("default", "db", fired_at())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Restic { .. }));
        assert_eq!(f.restic.subcommands(), vec!["snapshots", "backup", "forget"]);
        assert!(f
            .restic
            .calls()
            .iter()
            .all(|c| !c.args.contains(&"/second".to_string())));
        assert!(f.store.config("default", "db").unwrap().status.is_none());
        assert_eq!(f.events.reasons(), vec![reasons::FAILED_TO_BACKUP.to_string()]);
    }

    /// Story: retention fails for the first group after a good backup
    ///
    /// The second group is never backed up and the count stays untouched.
    #[tokio::test]
    async fn story_retention_failure_stops_the_run() {
        let f = fixture(vec![group("/first", Some(3)), group("/second", Some(3))]);
        f.restic.fail("forget", "Fatal: unable to create lock in backend");

        let err = f
            .executor
            .run_once("default", "db", fired_at())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Restic { ref command, .. } if command == "forget"), "{err}");
        assert_eq!(f.restic.subcommands(), vec!["snapshots", "backup", "forget"]);
        assert!(f
            .restic
            .calls()
            .iter()
            .all(|c| !c.args.contains(&"/second".to_string())));
        assert!(f.store.config("default", "db").unwrap().status.is_none());
        assert_eq!(
            f.events.reasons(),
            vec![
                reasons::SUCCESSFUL_BACKUP.to_string(),
                reasons::FAILED_TO_RETENTION.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn missing_repository_is_initialized_and_recorded() {
        let f = fixture(vec![group("/data", None)]);
        f.restic.fail("snapshots", "Is there a repository at the following location?");

        f.executor.run_once("default", "db", fired_at()).await.unwrap();

        // Empty retention policy: no forget
        assert_eq!(f.restic.subcommands(), vec!["snapshots", "init", "backup"]);
        let repo = f.store.repository("default", "deployment.db").unwrap();
        let status = repo.status.unwrap();
        assert_eq!(status.backup_count, 1);
        assert_eq!(status.last_backup_time, Some(fired_at()));
        assert!(repo
            .spec
            .backend
            .local
            .unwrap()
            .mount_path
            .ends_with("deployment/db"));
    }

    #[tokio::test]
    async fn deleted_configuration_is_a_quiet_success() {
        let f = fixture(vec![group("/data", None)]);
        f.executor.run_once("default", "gone", fired_at()).await.unwrap();
        assert!(f.restic.calls().is_empty());
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn paused_configuration_is_skipped() {
        let f = fixture(vec![group("/data", None)]);
        let mut cfg = f.store.config("default", "db").unwrap();
        cfg.spec.paused = true;
        f.store.put_config(cfg);

        f.executor.run_once("default", "db", fired_at()).await.unwrap();
        assert!(f.restic.calls().is_empty());
    }

    #[tokio::test]
    async fn unreachable_pushgateway_does_not_fail_the_run() {
        let mut f = fixture(vec![group("/data", None)]);
        let options = Options {
            scratch_dir: f.scratch.path().to_path_buf(),
            metrics_enabled: true,
            pushgateway_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        f.executor.options = Arc::new(options);

        f.executor.run_once("default", "db", fired_at()).await.unwrap();
        let status = f.store.config("default", "db").unwrap().status.unwrap();
        assert_eq!(status.backup_count, 1);
    }

    /// Story: a BackupSession runs once per host and ends Succeeded
    #[tokio::test]
    async fn story_session_runs_once_per_host() {
        let f = fixture(vec![group("/data", None)]);
        let mut session = BackupSession::new(
            "db-manual",
            BackupSessionSpec {
                backup_configuration: "db".to_string(),
            },
        );
        session.metadata.namespace = Some("default".to_string());
        f.store.put_backup_session(session);

        f.executor.run_session("default", "db-manual").await.unwrap();
        f.executor.run_session("default", "db-manual").await.unwrap();

        let status = f.store.backup_session("default", "db-manual").unwrap().status.unwrap();
        assert_eq!(status.phase, SessionPhase::Succeeded);
        assert_eq!(status.hosts.len(), 1);
        assert_eq!(status.hosts[0].hostname, "db");
        assert_eq!(
            f.restic.subcommands().iter().filter(|s| *s == "backup").count(),
            1
        );
        assert!(f
            .events
            .reasons()
            .contains(&reasons::HOST_BACKUP_SUCCEEDED.to_string()));
    }

    #[test]
    fn prefix_is_appended_to_the_backend_path() {
        let backend = Backend {
            s3: Some(crate::crd::S3Spec {
                endpoint: "s3.amazonaws.com".to_string(),
                bucket: "b".to_string(),
                prefix: "team/".to_string(),
            }),
            ..Default::default()
        };
        let out = backend_with_prefix(&backend, "statefulset/db");
        assert_eq!(out.s3.unwrap().prefix, "team/statefulset/db");
        assert_eq!(backend_with_prefix(&backend, "").s3.unwrap().prefix, "team");
    }
}
