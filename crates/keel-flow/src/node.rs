//! Resource nodes and their apply lifecycle.
//!
//! This module provides:
//! - `ResourceKind`: the closed set of resource kinds the engine orders
//! - `NodeStatus`: the per-node state machine driven by the scheduler
//! - `NodeAction`: what an apply did to a node
//! - `ResourceNode`: a typed unit of desired state plus its apply progress

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use keel_core::{NodeId, PhysicalId};

use crate::desired::DesiredState;
use crate::error::{Error, NodeFailure, Result};
use crate::gate::{GateSpec, GateState};
use crate::plan::UpdateReason;
use crate::secrets::SecretMaterial;

/// Values a node publishes once materialized, by attribute name.
///
/// Always contains `id` (the physical ID) after a successful apply.
pub type Outputs = BTreeMap<String, Value>;

macro_rules! resource_kinds {
    ($($variant:ident => $label:literal),+ $(,)?) => {
        /// Closed set of resource kinds.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum ResourceKind {
            $(
                #[doc = concat!("`", $label, "` resource.")]
                $variant,
            )+
        }

        impl ResourceKind {
            /// Every kind, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Returns the snake_case name of the kind.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }
    };
}

resource_kinds! {
    Certificate => "certificate",
    CertificateValidation => "certificate_validation",
    DnsZone => "dns_zone",
    DnsRecord => "dns_record",
    Secret => "secret",
    IamRole => "iam_role",
    IamPolicy => "iam_policy",
    IamRolePolicyAttachment => "iam_role_policy_attachment",
    ContainerRepository => "container_repository",
    ContainerImage => "container_image",
    Cluster => "cluster",
    TaskDefinition => "task_definition",
    ContainerService => "container_service",
    ScalingTarget => "scaling_target",
    ScalingPolicy => "scaling_policy",
    LoadBalancer => "load_balancer",
    TargetGroup => "target_group",
    Listener => "listener",
    ListenerRule => "listener_rule",
    SecurityGroup => "security_group",
    LogGroup => "log_group",
}

impl ResourceKind {
    /// Kinds whose creation always waits on external confirmation.
    #[must_use]
    pub const fn requires_gate(&self) -> bool {
        matches!(self, Self::CertificateValidation)
    }

    /// Kinds that accept a `tags` property.
    #[must_use]
    pub const fn supports_tags(&self) -> bool {
        !matches!(
            self,
            Self::DnsRecord
                | Self::CertificateValidation
                | Self::IamRolePolicyAttachment
                | Self::ContainerImage
                | Self::ScalingTarget
                | Self::ScalingPolicy
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| Error::manifest(format!("unknown resource type '{s}'")))
    }
}

/// Per-node apply state machine.
///
/// ```text
/// ┌─────────┐  deps applied  ┌──────────┐  provider ok  ┌─────────┐
/// │ PENDING │───────────────►│ APPLYING │──────────────►│ APPLIED │
/// └─────────┘                └──────────┘               └─────────┘
///      │                          │
///      │ upstream failed          │ provider / gate failure
///      ▼                          ▼
/// ┌──────────────────────────────────┐
/// │              FAILED              │
/// └──────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Not yet started.
    #[default]
    Pending,
    /// A provider operation is in flight.
    Applying,
    /// Materialized and (if gated) confirmed.
    Applied,
    /// Failed, either itself or because of a dependency.
    Failed,
}

impl NodeStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Applying | Self::Failed),
            Self::Applying => matches!(target, Self::Applied | Self::Failed),
            Self::Applied | Self::Failed => false,
        }
    }

    /// Returns all valid target statuses from the current status.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Pending => vec![Self::Applying, Self::Failed],
            Self::Applying => vec![Self::Applied, Self::Failed],
            Self::Applied | Self::Failed => vec![],
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Applying => write!(f, "APPLYING"),
            Self::Applied => write!(f, "APPLIED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// What an apply did to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    /// The resource was created.
    Created,
    /// The resource was updated in place.
    Updated {
        /// Why the update was needed.
        reason: UpdateReason,
    },
    /// The desired state matched the last apply; no provider call was made.
    Unchanged,
    /// Only the confirmation gate was re-run.
    GateResumed,
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated { reason } => write!(f, "updated ({reason})"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::GateResumed => write!(f, "gate_resumed"),
        }
    }
}

/// A typed unit of desired state tracked by the engine.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    id: NodeId,
    kind: ResourceKind,
    /// Desired state handed to the provider after resolution.
    pub desired: DesiredState,
    /// Declared ordering dependencies (in addition to inferred ones).
    pub depends_on: BTreeSet<NodeId>,
    /// Confirmation gate, if this node is gated.
    pub gate: Option<GateSpec>,
    /// Secret plaintext; only for [`ResourceKind::Secret`] nodes.
    pub material: Option<SecretMaterial>,
    physical_id: Option<PhysicalId>,
    status: NodeStatus,
    /// Provider attempts made during the current apply.
    pub attempts: u32,
    /// What the current apply did to the node.
    pub action: Option<NodeAction>,
    /// Why the node failed, if it did.
    pub failure: Option<NodeFailure>,
    /// Gate progress, if the gate ran.
    pub gate_state: Option<GateState>,
    /// Upstream gate that timed out; the node stays pending until it confirms.
    pub blocked_by: Option<NodeId>,
    /// When the node last changed status.
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl ResourceNode {
    /// Creates a pending node with an empty desired state.
    #[must_use]
    pub fn new(id: NodeId, kind: ResourceKind) -> Self {
        Self {
            id,
            kind,
            desired: DesiredState::new(),
            depends_on: BTreeSet::new(),
            gate: None,
            material: None,
            physical_id: None,
            status: NodeStatus::Pending,
            attempts: 0,
            action: None,
            failure: None,
            gate_state: None,
            blocked_by: None,
            last_transition_at: None,
        }
    }

    /// Sets the desired state.
    #[must_use]
    pub fn with_desired(mut self, desired: DesiredState) -> Self {
        self.desired = desired;
        self
    }

    /// Adds an explicit ordering dependency.
    #[must_use]
    pub fn depends_on(mut self, dependency: NodeId) -> Self {
        self.depends_on.insert(dependency);
        self
    }

    /// Attaches a confirmation gate.
    #[must_use]
    pub const fn with_gate(mut self, gate: GateSpec) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Attaches secret material.
    #[must_use]
    pub fn with_material(mut self, material: SecretMaterial) -> Self {
        self.material = Some(material);
        self
    }

    /// The node ID.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    /// The resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> NodeStatus {
        self.status
    }

    /// Physical ID, once materialized.
    #[must_use]
    pub const fn physical_id(&self) -> Option<&PhysicalId> {
        self.physical_id.as_ref()
    }

    /// Nodes referenced by the desired state (implicit dependencies).
    #[must_use]
    pub fn references(&self) -> BTreeSet<NodeId> {
        self.desired.references()
    }

    /// Sets the physical ID before the node is marked applied.
    pub fn set_physical_id(&mut self, physical_id: PhysicalId) {
        self.physical_id = Some(physical_id);
    }

    /// Transitions to a new status.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid, or if the target is
    /// `Applied` and no physical ID has been set.
    #[tracing::instrument(
        skip(self),
        fields(node_id = %self.id, kind = %self.kind, from = %self.status, to = %target)
    )]
    pub fn transition_to(&mut self, target: NodeStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: format!(
                    "valid transitions from {}: {:?}",
                    self.status,
                    self.status.valid_transitions()
                ),
            });
        }
        if target == NodeStatus::Applied && self.physical_id.is_none() {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: format!("node {} has no physical id", self.id),
            });
        }
        if target == NodeStatus::Applying {
            self.attempts = 0;
            self.failure = None;
        }
        self.status = target;
        self.last_transition_at = Some(Utc::now());
        Ok(())
    }

    /// Marks the node failed with `failure`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is already terminal.
    pub fn fail(&mut self, failure: NodeFailure) -> Result<()> {
        self.transition_to(NodeStatus::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }
}
