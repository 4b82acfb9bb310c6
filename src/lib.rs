//! Stash - Kubernetes-native backup orchestrator driving restic
//!
//! Stash backs up volume data of running workloads. A `BackupConfiguration`
//! selects workloads, names a storage backend and a cron schedule; the
//! controller injects a sidecar into matching workloads, and the sidecar runs
//! restic on schedule, reporting outcomes back into the custom resources.
//!
//! # Architecture
//!
//! - The watch layer turns workload and configuration changes into typed
//!   triggers ([`watch::Trigger`]).
//! - The sidecar reconciler applies or removes the sidecar with
//!   conflict-aware retries and waits for the rollout.
//! - The cron scheduler owns one in-process cron table and a single-slot
//!   gate so that at most one backup runs per process.
//! - The executor performs a backup run: backend env, repository init,
//!   backup and forget per file group, status, events, metrics.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (BackupConfiguration, Repository, sessions)
//! - [`watch`] - Controllers, trigger classification, work queue bounds
//! - [`selector`] - Label selector evaluation and configuration lookup
//! - [`workload`] - Uniform view over the supported workload kinds
//! - [`sidecar`] - Sidecar injection and removal
//! - [`scheduler`] - Cron table and backup gate
//! - [`executor`] - Backup and restore runs
//! - [`restic`] - restic subprocess wrapper
//! - [`status`] - Status read-modify-write helpers
//! - [`store`] - Typed access to custom resources and secrets
//! - [`events`] - Kubernetes Event publishing
//! - [`context`] - Application context shared by every component
//! - [`commands`] - CLI subcommands
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod commands;
pub mod context;
pub mod crd;
pub mod error;
pub mod events;
pub mod executor;
pub mod kube_utils;
pub mod options;
pub mod restic;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod sidecar;
pub mod status;
pub mod store;
pub mod watch;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared Constants
// =============================================================================

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "stash-operator";

/// Workload annotation naming the BackupConfiguration that owns the sidecar
pub const ANNOTATION_CONFIG_NAME: &str = "stash.dev/config";

/// Workload annotation recording the sidecar image tag
pub const ANNOTATION_VERSION_TAG: &str = "stash.dev/tag";

/// Label put on sessions and volume snapshots pointing at their configuration
pub const LABEL_BACKUP_CONFIGURATION: &str = "stash.dev/backup-configuration";

/// Name of the injected sidecar container
pub const SIDECAR_CONTAINER: &str = "stash";

/// Scratch emptyDir volume mounted into the sidecar
pub const SCRATCH_VOLUME: &str = "stash-scratchdir";

/// Downward API volume exposing pod labels to the sidecar
pub const PODINFO_VOLUME: &str = "stash-podinfo";

/// Volume carrying the local backend
pub const LOCAL_VOLUME: &str = "stash-local";

/// Mount path of the scratch volume inside the sidecar
pub const SCRATCH_MOUNT_PATH: &str = "/tmp";

/// Mount path of the downward API volume inside the sidecar
pub const PODINFO_MOUNT_PATH: &str = "/etc/stash";

/// Default scratch directory for restic temp files and cache
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp";

/// Default Prometheus pushgateway
pub const DEFAULT_PUSHGATEWAY_URL: &str = "http://stash-operator.kube-system.svc:56789";

/// Default sidecar image (without tag)
pub const DEFAULT_IMAGE: &str = "ghcr.io/stashed/stash";

/// Default sidecar image tag
pub const DEFAULT_IMAGE_TAG: &str = "latest";
