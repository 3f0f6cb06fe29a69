//! Error types for the orchestration domain.
//!
//! [`Error`] covers failures of the engine itself (validation, state
//! transitions, storage). Per-node outcomes of an apply are not errors of the
//! engine: they are recorded on the node as a [`NodeFailure`] and surface in
//! the apply report.

use serde::{Deserialize, Serialize};

use keel_core::NodeId;

/// The result type used throughout keel-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cycle was detected in the dependency graph.
    #[error("cycle detected in dependency graph: {}", cycle.join(" -> "))]
    CycleDetected {
        /// The cycle path; the first node is repeated at the end.
        cycle: Vec<String>,
    },

    /// A node with the same ID was already added.
    #[error("duplicate node: {node_id}")]
    DuplicateNode {
        /// The duplicated node ID.
        node_id: NodeId,
    },

    /// A node was not found in the graph.
    #[error("node not found: {node_id}")]
    NodeNotFound {
        /// The node ID that was not found.
        node_id: NodeId,
    },

    /// A node references a dependency that is not part of the graph.
    #[error("node {node_id} depends on unknown node {dependency}")]
    DependencyNotFound {
        /// The dependent node.
        node_id: NodeId,
        /// The missing dependency.
        dependency: NodeId,
    },

    /// A DAG node was not found (internal graph operation error).
    #[error("DAG node not found: {node}")]
    DagNodeNotFound {
        /// The node identifier (index or value).
        node: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// Two routing rules share a priority and have overlapping host patterns.
    #[error(
        "routing rules {first} and {second} overlap at priority {priority} ({first_pattern} / {second_pattern})"
    )]
    RoutingOverlap {
        /// Shared priority.
        priority: u32,
        /// First rule ID.
        first: String,
        /// Second rule ID.
        second: String,
        /// Overlapping pattern of the first rule.
        first_pattern: String,
        /// Overlapping pattern of the second rule.
        second_pattern: String,
    },

    /// A routing rule is malformed.
    #[error("invalid routing rule {rule_id}: {message}")]
    InvalidRoutingRule {
        /// The offending rule ID.
        rule_id: String,
        /// Description of the problem.
        message: String,
    },

    /// More than one rule matched a host at the winning priority.
    #[error("ambiguous routing for host {host}: rules {rules:?} match at priority {priority}")]
    RoutingConflict {
        /// The normalized host.
        host: String,
        /// Matching priority.
        priority: u32,
        /// IDs of all matching rules.
        rules: Vec<String>,
    },

    /// A confirmation gate has unusable polling parameters.
    #[error("invalid gate for {owner}: {message}")]
    InvalidGate {
        /// The gated node, or `default` for an engine-wide gate.
        owner: String,
        /// Description of the problem.
        message: String,
    },

    /// The secret store adapter failed.
    #[error("secret store error: {message}")]
    Secret {
        /// Description of the failure.
        message: String,
    },

    /// A declaration manifest could not be loaded.
    #[error("manifest error: {message}")]
    Manifest {
        /// Description of the failure.
        message: String,
    },

    /// Engine configuration is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from keel-core.
    #[error("core error: {0}")]
    Core(#[from] keel_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new manifest error.
    #[must_use]
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true for errors raised while validating declarations,
    /// before any provider call is made.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. }
                | Self::DuplicateNode { .. }
                | Self::DependencyNotFound { .. }
                | Self::RoutingOverlap { .. }
                | Self::InvalidRoutingRule { .. }
                | Self::InvalidGate { .. }
                | Self::Manifest { .. }
        )
    }
}

impl From<keel_core::canonical_json::CanonicalJsonError> for Error {
    fn from(err: keel_core::canonical_json::CanonicalJsonError) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// Why a node ended an apply in the `Failed` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeFailure {
    /// The provider rejected the operation.
    Provider {
        /// Provider error message.
        message: String,
        /// Whether the last error was classified retryable.
        retryable: bool,
        /// Number of attempts made.
        attempts: u32,
        /// True when a retryable error persisted past the retry budget.
        retries_exhausted: bool,
    },
    /// A prerequisite failed; this node was never attempted.
    Dependency {
        /// The failed node that blocked this one.
        upstream: NodeId,
    },
    /// The confirmation gate did not confirm before its deadline.
    GateTimedOut {
        /// Number of confirmation polls made.
        polls: u32,
        /// Last poll error, if any.
        last_error: Option<String>,
    },
    /// The provider explicitly rejected the confirmation gate.
    GateRejected {
        /// Rejection reason.
        reason: String,
    },
    /// An input value could not be resolved.
    UnresolvedInput {
        /// Description of the failed input.
        message: String,
    },
    /// Secret material could not be stored.
    Secret {
        /// Description of the failure.
        message: String,
    },
    /// The applied record could not be written.
    State {
        /// Description of the failure.
        message: String,
    },
}

impl NodeFailure {
    /// Returns a short label suitable for metrics and tables.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Provider { .. } => "provider",
            Self::Dependency { .. } => "dependency",
            Self::GateTimedOut { .. } => "gate_timed_out",
            Self::GateRejected { .. } => "gate_rejected",
            Self::UnresolvedInput { .. } => "unresolved_input",
            Self::Secret { .. } => "secret",
            Self::State { .. } => "state",
        }
    }

    /// Returns true if this failure blocks the node because of another node.
    #[must_use]
    pub const fn is_dependency(&self) -> bool {
        matches!(self, Self::Dependency { .. })
    }
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider {
                message,
                attempts,
                retries_exhausted,
                ..
            } => {
                if *retries_exhausted {
                    write!(f, "provider error after {attempts} attempts: {message}")
                } else {
                    write!(f, "provider error: {message}")
                }
            }
            Self::Dependency { upstream } => write!(f, "dependency {upstream} failed"),
            Self::GateTimedOut { polls, last_error } => {
                write!(f, "confirmation timed out after {polls} polls")?;
                if let Some(err) = last_error {
                    write!(f, " (last error: {err})")?;
                }
                Ok(())
            }
            Self::GateRejected { reason } => write!(f, "confirmation rejected: {reason}"),
            Self::UnresolvedInput { message } => write!(f, "unresolved input: {message}"),
            Self::Secret { message } => write!(f, "secret error: {message}"),
            Self::State { message } => write!(f, "state store error: {message}"),
        }
    }
}
