//! restic subprocess wrapper
//!
//! Every repository operation is a `restic` invocation built by
//! [`ResticWrapper`] and executed by a [`CommandRunner`]. The runner is the
//! test seam: unit tests record invocations instead of spawning processes.

mod setup;

pub use setup::{setup_env, BackendEnv, CA_CERT_DATA, RESTIC_PASSWORD, RESTIC_REPOSITORY, TMPDIR};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::crd::RetentionPolicy;
use crate::options::Options;
use crate::{Error, Result};

/// restic binary inside the sidecar image
pub const RESTIC_BINARY: &str = "/bin/restic";

/// One process invocation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Executable path
    pub program: String,
    /// Arguments, subcommand first
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    /// restic subcommand, e.g. `backup`
    pub fn subcommand(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }
}

/// Runs a process to completion and returns its stdout
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `invocation`; non-zero exit is [`Error::Restic`]
    async fn run(&self, invocation: &Invocation) -> Result<String>;
}

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioCommandRunner;

fn last_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String> {
        debug!(program = %invocation.program, args = ?invocation.args, "Running command");
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(&invocation.env)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            program = %invocation.program,
            args = ?invocation.args,
            status = %output.status,
            output = %stderr,
            "Command failed"
        );
        let message = last_line(&stderr)
            .or_else(|| last_line(&stdout))
            .map(str::to_string)
            .unwrap_or_else(|| output.status.to_string());
        Err(Error::restic(invocation.subcommand(), message))
    }
}

/// Snapshot as printed by `restic snapshots --json`
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Snapshot {
    /// Snapshot id
    pub id: String,
    /// Creation time
    pub time: DateTime<Utc>,
    /// Backed-up paths
    #[serde(default)]
    pub paths: Vec<String>,
    /// Host recorded at backup time
    #[serde(default)]
    pub hostname: String,
    /// Snapshot tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// restic flags that do not depend on the repository
#[derive(Clone, Debug, PartialEq)]
pub struct ResticOptions {
    /// Root for the cache directory
    pub scratch_dir: PathBuf,
    /// `--cache-dir` instead of `--no-cache`
    pub enable_cache: bool,
    /// Backend connection limit, 0 for restic's default
    pub max_connections: u32,
}

impl From<&Options> for ResticOptions {
    fn from(options: &Options) -> Self {
        Self {
            scratch_dir: options.scratch_dir.clone(),
            enable_cache: options.enable_cache,
            max_connections: options.max_connections,
        }
    }
}

/// Builds and runs restic commands against one repository
#[derive(Clone)]
pub struct ResticWrapper {
    runner: Arc<dyn CommandRunner>,
    env: BackendEnv,
    options: ResticOptions,
}

impl ResticWrapper {
    /// Create a wrapper for the repository described by `env`
    pub fn new(runner: Arc<dyn CommandRunner>, env: BackendEnv, options: ResticOptions) -> Self {
        Self {
            runner,
            env,
            options,
        }
    }

    /// The backend environment this wrapper runs with
    pub fn env(&self) -> &BackendEnv {
        &self.env
    }

    fn invocation(&self, mut args: Vec<String>) -> Invocation {
        if self.options.enable_cache {
            let cache = self.options.scratch_dir.join("restic-cache");
            args.push("--cache-dir".to_string());
            args.push(cache.display().to_string());
        } else {
            args.push("--no-cache".to_string());
        }
        if let Some(ca) = &self.env.ca_cert_file {
            args.push("--cacert".to_string());
            args.push(ca.display().to_string());
        }
        if self.options.max_connections > 0 && self.env.connection_limit_supported {
            args.push("-o".to_string());
            args.push(format!(
                "{}.connections={}",
                self.env.provider, self.options.max_connections
            ));
        }
        Invocation {
            program: RESTIC_BINARY.to_string(),
            args,
            env: self.env.vars.clone(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        self.runner.run(&self.invocation(args)).await
    }

    /// Initialize the repository unless it already answers `snapshots`.
    ///
    /// Returns true when `init` ran.
    pub async fn init_if_absent(&self) -> Result<bool> {
        if self
            .run(vec!["snapshots".into(), "--json".into()])
            .await
            .is_ok()
        {
            return Ok(false);
        }
        info!(repository = ?self.env.repository(), "Initializing restic repository");
        self.run(vec!["init".into()]).await?;
        Ok(true)
    }

    /// Back up `path` as `host` with `tags`
    pub async fn backup(&self, path: &str, host: &str, tags: &[String]) -> Result<String> {
        let mut args = vec!["backup".to_string(), path.to_string()];
        if !host.is_empty() {
            args.extend(["--host".to_string(), host.to_string()]);
        }
        for tag in tags {
            args.extend(["--tag".to_string(), tag.clone()]);
        }
        self.run(args).await
    }

    /// Forget snapshots of `path` on `host` outside the retention policy.
    ///
    /// Returns `None` without running anything when the policy is empty.
    pub async fn forget(
        &self,
        policy: &RetentionPolicy,
        host: &str,
        path: &str,
    ) -> Result<Option<String>> {
        if policy.is_empty() {
            return Ok(None);
        }
        let mut args = vec!["forget".to_string()];
        for (flag, n) in policy.keep_flags() {
            args.extend([flag.to_string(), n.to_string()]);
        }
        for tag in &policy.keep_tags {
            args.extend(["--keep-tag".to_string(), tag.clone()]);
        }
        if policy.prune {
            args.push("--prune".to_string());
        }
        if policy.dry_run {
            args.push("--dry-run".to_string());
        }
        if !host.is_empty() {
            args.extend(["--host".to_string(), host.to_string()]);
        }
        args.extend(["--path".to_string(), path.to_string()]);
        self.run(args).await.map(Some)
    }

    /// Restore `path` from `snapshot` (or the latest one of `host`)
    /// into the parent directory of `path`
    pub async fn restore(&self, path: &str, host: &str, snapshot: Option<&str>) -> Result<String> {
        let target = Path::new(path)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        let args = vec![
            "restore".to_string(),
            snapshot.unwrap_or("latest").to_string(),
            "--path".to_string(),
            path.to_string(),
            "--host".to_string(),
            host.to_string(),
            "--target".to_string(),
            target,
        ];
        self.run(args).await
    }

    /// Verify repository integrity
    pub async fn check(&self) -> Result<String> {
        self.run(vec!["check".into()]).await
    }

    /// Raw data statistics, e.g. `Total Size: 1.234 GiB`
    pub async fn stats(&self) -> Result<String> {
        self.run(vec![
            "stats".into(),
            "--mode=raw-data".into(),
            "--quiet".into(),
        ])
        .await
    }

    /// List snapshots, optionally restricted to `ids`
    pub async fn snapshots(&self, ids: &[String]) -> Result<Vec<Snapshot>> {
        let mut args: Vec<String> = vec![
            "snapshots".into(),
            "--json".into(),
            "--quiet".into(),
            "--no-lock".into(),
        ];
        args.extend(ids.iter().cloned());
        let out = self.run(args).await?;
        serde_json::from_str(out.trim()).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Pull the `Total Size` value out of `restic stats` output
pub fn parse_total_size(stats: &str) -> Option<String> {
    stats.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Total Size:")
            .map(|v| v.trim().to_string())
    })
}

/// Sum of the `remove N snapshots:` lines printed by `restic forget`
pub fn count_removed(forget_output: &str) -> i64 {
    forget_output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("remove ")?;
            let (n, tail) = rest.split_once(' ')?;
            tail.starts_with("snapshot").then(|| n.parse::<i64>().ok())?
        })
        .sum()
}


#[cfg(test)]
mod tests {
    use super::*;
    use testing::RecordingRunner;

    fn env() -> BackendEnv {
        BackendEnv {
            vars: BTreeMap::from([(RESTIC_REPOSITORY.to_string(), "gs:b:/web".to_string())]),
            provider: "gs",
            connection_limit_supported: true,
            ca_cert_file: Some(PathBuf::from("/tmp/cacerts/ca.crt")),
        }
    }

    fn wrapper(runner: Arc<dyn CommandRunner>, enable_cache: bool) -> ResticWrapper {
        ResticWrapper::new(
            runner,
            env(),
            ResticOptions {
                scratch_dir: PathBuf::from("/tmp"),
                enable_cache,
                max_connections: 4,
            },
        )
    }

    #[tokio::test]
    async fn common_flags_follow_the_subcommand() {
        let runner = Arc::new(RecordingRunner::default());
        let restic = wrapper(runner.clone(), true);

        restic
            .backup("/data", "web", &["daily".to_string()])
            .await
            .unwrap();

        let call = &runner.calls()[0];
        assert_eq!(call.program, RESTIC_BINARY);
        assert_eq!(
            call.args,
            vec![
                "backup", "/data", "--host", "web", "--tag", "daily", "--cache-dir",
                "/tmp/restic-cache", "--cacert", "/tmp/cacerts/ca.crt", "-o", "gs.connections=4",
            ]
        );
        assert_eq!(call.env[RESTIC_REPOSITORY], "gs:b:/web");
    }

    #[tokio::test]
    async fn disabled_cache_passes_no_cache() {
        let runner = Arc::new(RecordingRunner::default());
        wrapper(runner.clone(), false).check().await.unwrap();
        assert!(runner.calls()[0].args.contains(&"--no-cache".to_string()));
    }

    #[tokio::test]
    async fn init_runs_only_when_snapshots_fails() {
        let runner = Arc::new(RecordingRunner::default());
        let restic = wrapper(runner.clone(), true);
        assert!(!restic.init_if_absent().await.unwrap());
        assert_eq!(runner.subcommands(), vec!["snapshots"]);

        let runner = Arc::new(RecordingRunner::default());
        runner.fail("snapshots", "Is there a repository at the following location?");
        let restic = wrapper(runner.clone(), true);
        assert!(restic.init_if_absent().await.unwrap());
        assert_eq!(runner.subcommands(), vec!["snapshots", "init"]);
    }

    #[tokio::test]
    async fn forget_renders_keep_flags_and_skips_empty_policy() {
        let runner = Arc::new(RecordingRunner::default());
        let restic = wrapper(runner.clone(), true);

        let ran = restic
            .forget(&RetentionPolicy::default(), "web", "/data")
            .await
            .unwrap();
        assert!(ran.is_none());
        assert!(runner.calls().is_empty());

        let policy = RetentionPolicy {
            keep_last: Some(5),
            keep_daily: Some(7),
            prune: true,
            ..Default::default()
        };
        restic.forget(&policy, "web", "/data").await.unwrap();
        let args = &runner.calls()[0].args;
        assert_eq!(
            &args[..10],
            &[
                "forget", "--keep-last", "5", "--keep-daily", "7", "--prune", "--host", "web",
                "--path", "/data",
            ]
        );
    }

    #[tokio::test]
    async fn restore_targets_parent_directory() {
        let runner = Arc::new(RecordingRunner::default());
        wrapper(runner.clone(), true)
            .restore("/var/lib/data", "db-0", None)
            .await
            .unwrap();
        assert_eq!(
            &runner.calls()[0].args[..8],
            &[
                "restore", "latest", "--path", "/var/lib/data", "--host", "db-0", "--target",
                "/var/lib",
            ]
        );
    }

    #[tokio::test]
    async fn snapshots_parse_json_listing() {
        let runner = Arc::new(RecordingRunner::default());
        runner.output(
            "snapshots",
            r#"[{"id":"abc","time":"2024-01-01T00:00:00Z","tree":"t","paths":["/data"],"hostname":"web","tags":["db"]}]"#,
        );
        let snaps = wrapper(runner, true).snapshots(&[]).await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].paths, vec!["/data"]);
        assert_eq!(snaps[0].hostname, "web");
    }

    #[tokio::test]
    async fn mock_runner_failure_surfaces_restic_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.subcommand() == "check")
            .times(1)
            .returning(|_| Err(Error::restic("check", "Fatal: repository contains errors")));
        let err = wrapper(Arc::new(runner), true).check().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "restic check failed: Fatal: repository contains errors"
        );
    }

    #[test]
    fn total_size_and_last_line_parsing() {
        let stats = "repository 1234 opened\nTotal Blob Count: 10\nTotal Size: 1.234 GiB\n";
        assert_eq!(parse_total_size(stats).as_deref(), Some("1.234 GiB"));
        assert_eq!(last_line("a\nFatal: wrong password\n\n"), Some("Fatal: wrong password"));
        assert_eq!(last_line("  \n"), None);
    }

    #[test]
    fn removed_snapshots_are_summed_per_group() {
        let out = "Applying Policy: keep 5 latest snapshots\nkeep 5 snapshots:\n...\nremove 2 snapshots:\n...\nremove 1 snapshot:\n";
        assert_eq!(count_removed(out), 3);
        assert_eq!(count_removed(""), 0);
    }
}
