//! Provider contract consumed by the scheduler.
//!
//! A [`Provider`] materializes resource nodes: it creates, reads, updates and
//! deletes physical resources, and reports external confirmation for gated
//! kinds. Concrete cloud APIs live outside this crate; they are reached
//! through the narrow collaborator traits in [`collaborators`] and routed by
//! kind through [`CompositeProvider`].
//!
//! [`memory::InMemoryProvider`] is a complete simulated provider used by the
//! tests and by the CLI.

pub mod collaborators;
pub mod composite;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use keel_core::{ApplyId, NodeId, PhysicalId};

use crate::node::{Outputs, ResourceKind};

pub use composite::CompositeProvider;
pub use memory::InMemoryProvider;

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient (throttling, network); safe to retry.
    Retryable,
    /// Invalid input or authorization failure; never retried.
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Error returned by a provider or collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{class} provider error: {message}")]
pub struct ProviderError {
    /// Whether the failure may be retried.
    pub class: ErrorClass,
    /// Description of the failure.
    pub message: String,
}

impl ProviderError {
    /// Creates a retryable error.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    /// Returns true if the error may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class, ErrorClass::Retryable)
    }
}

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Identifies the node a provider call is made for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderContext {
    /// Node being materialized.
    pub node_id: NodeId,
    /// Kind of the node.
    pub kind: ResourceKind,
    /// Apply or destroy invocation making the call.
    pub apply_id: ApplyId,
}

impl ProviderContext {
    /// Creates a context.
    #[must_use]
    pub const fn new(node_id: NodeId, kind: ResourceKind, apply_id: ApplyId) -> Self {
        Self {
            node_id,
            kind,
            apply_id,
        }
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialized {
    /// Provider-assigned identity.
    pub physical_id: PhysicalId,
    /// Values only known after creation (hostnames, ARNs, tokens).
    pub outputs: Outputs,
}

impl Materialized {
    /// Ensures `outputs` carries the identity attributes every node
    /// publishes: `id`, and `arn` when the provider reported none.
    #[must_use]
    pub fn with_identity(mut self) -> Self {
        let id = Value::String(self.physical_id.to_string());
        self.outputs.insert("id".into(), id.clone());
        self.outputs.entry("arn".into()).or_insert(id);
        self
    }
}

/// Answer to a confirmation poll for a gated resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Confirmation {
    /// The external confirmation arrived.
    Confirmed,
    /// Still waiting on external action.
    Pending,
    /// The provider rejected the resource.
    Rejected(String),
}

/// Contract a provider implements to materialize resource nodes.
///
/// `desired` is the fully resolved desired state: every output reference has
/// been substituted and secret references appear as `{"$secretRef": ...}`
/// objects for the provider to dereference.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates the resource.
    async fn create(&self, ctx: &ProviderContext, desired: &Value) -> ProviderResult<Materialized>;

    /// Reads the current state; `None` if the resource no longer exists.
    async fn read(
        &self,
        ctx: &ProviderContext,
        physical_id: &PhysicalId,
    ) -> ProviderResult<Option<Value>>;

    /// Updates the resource in place and returns its outputs.
    async fn update(
        &self,
        ctx: &ProviderContext,
        physical_id: &PhysicalId,
        desired: &Value,
    ) -> ProviderResult<Outputs>;

    /// Deletes the resource. Deleting a resource that no longer exists succeeds.
    async fn delete(&self, ctx: &ProviderContext, physical_id: &PhysicalId) -> ProviderResult<()>;

    /// Polls external confirmation for a gated resource.
    ///
    /// The default implementation confirms immediately.
    async fn poll_confirmation(
        &self,
        _ctx: &ProviderContext,
        _physical_id: &PhysicalId,
    ) -> ProviderResult<Confirmation> {
        Ok(Confirmation::Confirmed)
    }
}
