//! # keel-flow
//!
//! Declarative resource orchestration: typed resource nodes, a dependency
//! graph derived from their inputs, and a scheduler that materializes the
//! graph through a provider.
//!
//! This crate provides:
//!
//! - **Output futures**: [`output::Output`] values produced by one node and
//!   consumed by others, composable with `map`, `join` and `interpolate`
//! - **Resource graph**: explicit and implicit edges, cycle detection with
//!   the full cycle path, deterministic topological order
//! - **Scheduler**: bounded-concurrency apply with retry, cancellation,
//!   confirmation gates and an idempotent-upsert diff against applied state
//! - **Secrets**: typed secret references, resolved only at the provider
//!   boundary, with content-addressed versioning
//! - **Routing**: host routing rules with overlap validation
//!
//! ## Guarantees
//!
//! - **Ordered**: a node starts only after every dependency applied
//! - **Idempotent**: re-applying an unchanged declaration makes no mutating
//!   provider calls
//! - **Partial**: a failure stops its dependents, never unrelated branches,
//!   and the report says exactly what happened to every node
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use keel_core::NodeId;
//! use keel_flow::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! let mut stack = Stack::new(StackConfig::new("demo"));
//! let lb = stack.add_resource(
//!     ResourceNode::new(NodeId::new("app-lb")?, ResourceKind::LoadBalancer)
//!         .with_desired(DesiredState::new().with("name", "app")),
//! )?;
//! stack.add_resource(
//!     ResourceNode::new(NodeId::new("www")?, ResourceKind::DnsRecord)
//!         .with_desired(DesiredState::new().with("alias", lb.attr("dnsName"))),
//! )?;
//!
//! let scheduler = Scheduler::new(
//!     EngineConfig::default(),
//!     Arc::new(InMemoryProvider::new()),
//!     Arc::new(InMemoryStateStore::new()),
//!     Arc::new(SecretStore::new(Arc::new(InMemoryVault::new()))),
//! );
//! let report = scheduler.apply(&mut stack, &CancellationToken::new()).await?;
//! assert_eq!(report.exit_code(), 0);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod dag;
pub mod desired;
pub mod error;
pub mod gate;
pub mod graph;
pub mod manifest;
pub mod metrics;
pub mod node;
pub mod output;
pub mod plan;
pub mod provider;
pub mod report;
pub mod retry;
pub mod routing;
pub mod scheduler;
pub mod secrets;
pub mod stack;
pub mod state;

pub use error::{Error, NodeFailure, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::desired::{DesiredState, Property};
    pub use crate::error::{Error, NodeFailure, Result};
    pub use crate::gate::{GatePhase, GateSpec, GateState};
    pub use crate::graph::ResourceGraph;
    pub use crate::manifest::Manifest;
    pub use crate::metrics::FlowMetrics;
    pub use crate::node::{NodeAction, NodeStatus, ResourceKind, ResourceNode};
    pub use crate::output::{Output, OutputError, interpolate};
    pub use crate::plan::{Plan, PlanAction, UpdateReason};
    pub use crate::provider::memory::InMemoryVault;
    pub use crate::provider::{InMemoryProvider, Provider, ProviderError};
    pub use crate::report::{ApplyReport, DestroyReport, NodeReport};
    pub use crate::retry::RetryPolicy;
    pub use crate::routing::{RoutingRule, RoutingTable};
    pub use crate::scheduler::Scheduler;
    pub use crate::secrets::{SecretMaterial, SecretRef, SecretStore};
    pub use crate::stack::{Stack, StackConfig};
    pub use crate::state::{InMemoryStateStore, StateStore};
}
