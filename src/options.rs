//! Runtime options folded from CLI flags and environment
//!
//! Built once at startup by the command that runs, then stored in the
//! [`AppContext`](crate::context::AppContext). Nothing reads flags or env
//! after this point.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Immutable process options
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// Root for restic temp files, cache and credential files
    pub scratch_dir: PathBuf,
    /// Prometheus pushgateway base URL
    pub pushgateway_url: String,
    /// Push metrics after every run
    pub metrics_enabled: bool,
    /// Use `--cache-dir` instead of `--no-cache`
    pub enable_cache: bool,
    /// Backend connection limit for GCS, Azure and B2 (0 = restic default)
    pub max_connections: u32,
    /// Re-list period of the watches
    pub resync_period: Duration,
    /// Consecutive failures after which a key is dropped from the queue
    pub max_num_requeues: u32,
    /// Concurrent reconciliations per controller
    pub num_threads: u16,
    /// Sidecar image (without tag)
    pub image: String,
    /// Sidecar image tag
    pub image_tag: String,
    /// Node this process runs on (sidecar commands)
    pub node_name: Option<String>,
    /// Pod this process runs in (sidecar commands)
    pub pod_name: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from(crate::DEFAULT_SCRATCH_DIR),
            pushgateway_url: crate::DEFAULT_PUSHGATEWAY_URL.to_string(),
            metrics_enabled: false,
            enable_cache: true,
            max_connections: 0,
            resync_period: Duration::from_secs(600),
            max_num_requeues: 5,
            num_threads: 2,
            image: crate::DEFAULT_IMAGE.to_string(),
            image_tag: crate::DEFAULT_IMAGE_TAG.to_string(),
            node_name: None,
            pod_name: None,
        }
    }
}

impl Options {
    /// Full sidecar image reference
    pub fn sidecar_image(&self) -> String {
        format!("{}:{}", self.image, self.image_tag)
    }

    /// Node name, required by sidecar commands
    pub fn require_node_name(&self) -> Result<&str> {
        self.node_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::validation("missing env var NODE_NAME"))
    }

    /// Pod name, required by sidecar commands
    pub fn require_pod_name(&self) -> Result<&str> {
        self.pod_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::validation("missing env var POD_NAME"))
    }
}

/// Parse a Go-style duration such as `10m`, `1h30m`, `90s` or `250ms`.
///
/// A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::validation("empty duration"));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| Error::validation(format!("missing unit in duration {input:?}")))?;
        if digits == 0 {
            return Err(Error::validation(format!("invalid duration {input:?}")));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| Error::validation(format!("invalid number in duration {input:?}")))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => {
                return Err(Error::validation(format!(
                    "unknown unit {unit:?} in duration {input:?}"
                )))
            }
        };
        let part = Duration::try_from_secs_f64(value * scale)
            .map_err(|_| Error::validation(format!("duration {input:?} is out of range")))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| Error::validation(format!("duration {input:?} is out of range")))?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_flags() {
        let opts = Options::default();
        assert_eq!(opts.scratch_dir, PathBuf::from("/tmp"));
        assert_eq!(
            opts.pushgateway_url,
            "http://stash-operator.kube-system.svc:56789"
        );
        assert_eq!(opts.resync_period, Duration::from_secs(600));
        assert_eq!(opts.max_num_requeues, 5);
        assert_eq!(opts.num_threads, 2);
        assert!(opts.enable_cache);
        assert_eq!(opts.max_connections, 0);
    }

    #[test]
    fn parses_go_style_durations() {
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("10").is_ok());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("5m3").is_err());
    }

    #[test]
    fn out_of_range_durations_are_errors() {
        assert!(parse_duration("99999999999999999999h").is_err());
        assert!(parse_duration("18446744073709551615s1h").is_err());
    }

    /// Story: a sidecar started without its downward API env refuses to guess
    #[test]
    fn story_sidecar_identity_requires_env() {
        let opts = Options::default();
        assert!(opts.require_node_name().is_err());
        assert!(opts.require_pod_name().is_err());

        let opts = Options {
            node_name: Some("node-1".to_string()),
            pod_name: Some("db-0".to_string()),
            ..Default::default()
        };
        assert_eq!(opts.require_node_name().unwrap(), "node-1");
        assert_eq!(opts.require_pod_name().unwrap(), "db-0");
        assert_eq!(opts.sidecar_image(), "ghcr.io/stashed/stash:latest");
    }
}
