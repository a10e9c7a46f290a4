//! Operator error types

use std::fmt;
use thiserror::Error;

/// Failure talking to the object store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Contention, throttling, server or transport failure; safe to retry
    #[error("transient store error on {kind} {name}: {source}")]
    Transient {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// The store refused the write; retrying the same write will not help
    #[error("{kind} {name} rejected: {message}")]
    Rejected {
        kind: String,
        name: String,
        message: String,
    },

    #[error("failed to serialize {kind} {name}: {message}")]
    Serialization {
        kind: String,
        name: String,
        message: String,
    },
}

impl StoreError {
    /// Classify a kube client error by HTTP status.
    pub fn from_kube(kind: impl Into<String>, name: impl Into<String>, err: kube::Error) -> Self {
        let kind = kind.into();
        let name = name.into();
        match &err {
            kube::Error::Api(status) if matches!(status.code, 400 | 403 | 422) => {
                StoreError::Rejected {
                    kind,
                    name,
                    message: status.message.clone(),
                }
            }
            kube::Error::SerdeError(e) => StoreError::Serialization {
                kind,
                name,
                message: e.to_string(),
            },
            _ => StoreError::Transient {
                kind,
                name,
                source: err,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

/// Failure of a single subsystem step
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A construction rule was broken; never expected at runtime
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl StepError {
    pub fn invariant(message: impl Into<String>) -> Self {
        StepError::Invariant(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Store(e) if e.is_transient())
    }
}

/// The four subsystems, in the order they are reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Storage,
    ExperimentTracking,
    Workflows,
    Compute,
}

impl Subsystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Storage => "storage",
            Subsystem::ExperimentTracking => "experiment-tracking",
            Subsystem::Workflows => "workflows",
            Subsystem::Compute => "compute",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reconcile failure attributed to a workspace and, once the subsystem
/// sequence has started, to the failing subsystem
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The workspace object itself cannot be reconciled
    #[error("workspace {workspace}: {source}")]
    Workspace {
        /// `namespace/name`
        workspace: String,
        #[source]
        source: StepError,
    },

    #[error("workspace {workspace}: {subsystem} failed: {source}")]
    Subsystem {
        workspace: String,
        subsystem: Subsystem,
        #[source]
        source: StepError,
    },
}

impl ReconcileError {
    pub fn workspace(workspace: impl Into<String>, source: StepError) -> Self {
        ReconcileError::Workspace {
            workspace: workspace.into(),
            source,
        }
    }

    pub fn subsystem(workspace: impl Into<String>, subsystem: Subsystem, source: StepError) -> Self {
        ReconcileError::Subsystem {
            workspace: workspace.into(),
            subsystem,
            source,
        }
    }

    pub fn failed_subsystem(&self) -> Option<Subsystem> {
        match self {
            ReconcileError::Workspace { .. } => None,
            ReconcileError::Subsystem { subsystem, .. } => Some(*subsystem),
        }
    }

    fn step_error(&self) -> &StepError {
        match self {
            ReconcileError::Workspace { source, .. } | ReconcileError::Subsystem { source, .. } => source,
        }
    }

    /// Whether the host should retry soon
    pub fn is_retryable(&self) -> bool {
        self.step_error().is_transient()
    }
}
