//! Application context shared by every component
//!
//! Built once at startup by the running command and passed by `Arc` to the
//! controllers, the scheduler and the executors. There is no process-wide
//! mutable state outside of it.

use std::sync::Arc;

use kube::Client;

use crate::events::{EventPublisher, KubeEventPublisher};
use crate::executor::{BackupExecutor, RestoreExecutor};
use crate::options::Options;
use crate::restic::{CommandRunner, TokioCommandRunner};
use crate::retry::RetryConfig;
use crate::sidecar::{KubeWorkloadClient, SidecarReconciler, WorkloadClient};
use crate::status::StatusReporter;
use crate::store::{KubeResourceStore, ResourceStore};
use crate::workload::{HostIdentity, WorkloadKind};
use crate::Result;

/// Shared clients, options and retry policy
///
/// Use [`AppContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = AppContext::builder(client)
///     .options(options)
///     .component("stash-sidecar")
///     .build();
/// ```
pub struct AppContext {
    /// Custom resources and secrets (trait object for testability)
    pub store: Arc<dyn ResourceStore>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Workload and pod operations
    pub workloads: Arc<dyn WorkloadClient>,
    /// restic process launcher
    pub commands: Arc<dyn CommandRunner>,
    /// Immutable process options
    pub options: Arc<Options>,
    /// Conflict retry policy for every read-modify-write
    pub retry: RetryConfig,
}

impl AppContext {
    /// Create a builder for constructing an AppContext
    pub fn builder(client: Client) -> AppContextBuilder {
        AppContextBuilder::new(client)
    }

    /// Status and event reporter over this context's store
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new(self.store.clone(), self.events.clone(), self.retry.clone())
    }

    /// Sidecar reconciler with the default rollout wait
    pub fn sidecar_reconciler(&self) -> SidecarReconciler {
        SidecarReconciler::new(
            self.workloads.clone(),
            self.store.clone(),
            self.reporter(),
            self.options.clone(),
            self.retry.clone(),
        )
    }

    /// Snapshot identity of the pod this process runs in
    pub fn host_identity(&self, kind: WorkloadKind, workload_name: &str) -> Result<HostIdentity> {
        Ok(HostIdentity::derive(
            kind,
            workload_name,
            self.options.require_pod_name()?,
            self.options.require_node_name()?,
        ))
    }

    /// Backup executor acting as `host`
    pub fn backup_executor(&self, host: HostIdentity) -> BackupExecutor {
        BackupExecutor::new(
            self.store.clone(),
            self.reporter(),
            self.commands.clone(),
            self.options.clone(),
            host,
        )
    }

    /// Restore executor acting as `host`
    pub fn restore_executor(&self, host: HostIdentity) -> RestoreExecutor {
        RestoreExecutor::new(
            self.store.clone(),
            self.reporter(),
            self.commands.clone(),
            self.options.clone(),
            host,
        )
    }

    /// Create a context for testing with in-memory collaborators
    ///
    /// For production code, use [`AppContext::builder`].
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventPublisher>,
        workloads: Arc<dyn WorkloadClient>,
        commands: Arc<dyn CommandRunner>,
        options: Options,
    ) -> Self {
        Self {
            store,
            events,
            workloads,
            commands,
            options: Arc::new(options),
            retry: RetryConfig::conflict(),
        }
    }
}

/// Builder for constructing [`AppContext`] instances
pub struct AppContextBuilder {
    client: Client,
    component: String,
    options: Options,
    retry: RetryConfig,
    store: Option<Arc<dyn ResourceStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    workloads: Option<Arc<dyn WorkloadClient>>,
    commands: Option<Arc<dyn CommandRunner>>,
}

impl AppContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            component: crate::FIELD_MANAGER.to_string(),
            options: Options::default(),
            retry: RetryConfig::conflict(),
            store: None,
            events: None,
            workloads: None,
            commands: None,
        }
    }

    /// Set the process options
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Reporting component name on published Events
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    /// Override the conflict retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the resource store
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the AppContext
    pub fn build(self) -> AppContext {
        let client = self.client;
        let component = self.component;
        AppContext {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeResourceStore::new(client.clone()))),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(client.clone(), &component))),
            workloads: self
                .workloads
                .unwrap_or_else(|| Arc::new(KubeWorkloadClient::new(client.clone()))),
            commands: self
                .commands
                .unwrap_or_else(|| Arc::new(TokioCommandRunner)),
            options: Arc::new(self.options),
            retry: self.retry,
        }
    }
}
