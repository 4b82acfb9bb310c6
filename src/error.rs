//! Error types for the backup orchestrator

use thiserror::Error;

/// Main error type for backup operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster client could not be configured
    #[error("client error: {0}")]
    Client(String),

    /// Optimistic-concurrency conflict: the object changed between read and write
    #[error("conflict: {0}")]
    Conflict(String),

    /// A referenced object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Namespace of the missing object
        namespace: String,
        /// Name of the missing object
        name: String,
    },

    /// Validation error for resource specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Schedule string is not a valid cron expression
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidSchedule {
        /// The rejected expression
        expression: String,
        /// Parser message
        reason: String,
    },

    /// Backend secret is not named or does not exist
    #[error("missing repository secret {namespace}/{name}")]
    MissingSecret {
        /// Namespace searched
        namespace: String,
        /// Secret name (empty when the configuration names none)
        name: String,
    },

    /// Conflict retries ran out
    #[error("{operation} failed after {attempts} attempts")]
    ReconcileExhausted {
        /// Operation that was retried
        operation: String,
        /// Attempts made
        attempts: u32,
    },

    /// The single-slot backup gate is already held
    #[error("backup gate busy: held by {holder}")]
    Busy {
        /// Identity of the run holding the gate
        holder: String,
    },

    /// The restic subprocess exited non-zero
    #[error("restic {command} failed: {message}")]
    Restic {
        /// Restic subcommand (backup, forget, init, ...)
        command: String,
        /// Last line of output
        message: String,
    },

    /// Bounded wait gave up
    #[error("timed out: {0}")]
    Timeout(String),

    /// Local filesystem error (scratch dir, credential files)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Metrics registration or push error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a client configuration error with the given message
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a not-found error for the given object
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a missing-secret error
    pub fn missing_secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::MissingSecret {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a restic failure error
    pub fn restic(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Restic {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a metrics error with the given message
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Map a kube error from a write call, turning HTTP 409 into [`Error::Conflict`]
    pub fn from_write(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 409 => Self::Conflict(resp.message.clone()),
            other => Self::Kube(other),
        }
    }

    /// True for optimistic-concurrency conflicts
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// True for HTTP 404 from the API server or an explicit [`Error::NotFound`]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Whether the work queue should retry the key that produced this error.
    ///
    /// Configuration errors need a spec change, so retrying them only burns
    /// the requeue budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_) | Self::InvalidSchedule { .. } | Self::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
