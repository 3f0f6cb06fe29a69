//! Dry-run planning and the idempotent-upsert diff.
//!
//! The same classification drives both `plan` and `apply`: a node's resolved
//! desired state is fingerprinted (canonical JSON, SHA-256) and compared to
//! its [`AppliedRecord`]. Equal fingerprints mean no provider call at all.
//! When only the fingerprint with symbolic secret versions matches, the
//! change came from a secret rotation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use keel_core::NodeId;
use keel_core::canonical_json::fingerprint;

use crate::desired::ResolvedState;
use crate::error::Result;
use crate::graph::DependencyEdge;
use crate::node::{Outputs, ResourceKind};
use crate::state::AppliedRecord;

/// Why a node needs an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    /// The node's own declaration changed.
    ConfigChanged,
    /// Only the version of a consumed secret changed.
    SecretRotated,
}

impl fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigChanged => write!(f, "config changed"),
            Self::SecretRotated => write!(f, "secret rotated"),
        }
    }
}

/// What an apply would do to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanAction {
    /// The node was never applied.
    Create,
    /// The node's resolved desired state differs from its record.
    Update {
        /// Why.
        reason: UpdateReason,
    },
    /// Nothing to do.
    NoChange,
    /// Inputs are only known after upstream nodes apply.
    Deferred {
        /// Upstream nodes the node is waiting on.
        waiting_on: BTreeSet<NodeId>,
    },
    /// The node is no longer declared; its resource will be deleted.
    Delete,
    /// The node was created but its confirmation gate never confirmed.
    ResumeGate,
}

impl PlanAction {
    /// Short label for tables and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update { .. } => "update",
            Self::NoChange => "no_change",
            Self::Deferred { .. } => "deferred",
            Self::Delete => "delete",
            Self::ResumeGate => "resume_gate",
        }
    }

    /// Returns true if applying would call the provider.
    #[must_use]
    pub const fn is_change(&self) -> bool {
        !matches!(self, Self::NoChange)
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update { reason } => write!(f, "update ({reason})"),
            Self::NoChange => write!(f, "no change"),
            Self::Deferred { waiting_on } => {
                let names: Vec<&str> = waiting_on.iter().map(NodeId::as_str).collect();
                write!(f, "known after apply of {}", names.join(", "))
            }
            Self::Delete => write!(f, "delete"),
            Self::ResumeGate => write!(f, "resume gate"),
        }
    }
}

/// Fingerprints used for the diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprints {
    /// Over the resolved desired state, with concrete secret versions.
    pub full: String,
    /// Over the desired state with `Latest` secret versions left symbolic.
    pub config: String,
}

impl Fingerprints {
    /// Fingerprints a node's resolved state.
    ///
    /// `content_digest` is the secret material digest for secret nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be canonicalized.
    pub fn compute(
        kind: ResourceKind,
        resolved: &ResolvedState,
        content_digest: Option<&str>,
    ) -> Result<Self> {
        let wrap = |desired: &serde_json::Value| match content_digest {
            Some(digest) => json!({"kind": kind, "desired": desired, "contentDigest": digest}),
            None => json!({"kind": kind, "desired": desired}),
        };
        Ok(Self {
            full: fingerprint(&wrap(&resolved.value))?,
            config: fingerprint(&wrap(&resolved.config))?,
        })
    }
}

/// Classifies a node against its last-applied record.
#[must_use]
pub fn classify(record: Option<&AppliedRecord>, fingerprints: &Fingerprints) -> PlanAction {
    match record {
        None => PlanAction::Create,
        Some(r) if r.fingerprint == fingerprints.full && r.gate_pending => PlanAction::ResumeGate,
        Some(r) if r.fingerprint == fingerprints.full => PlanAction::NoChange,
        Some(r) if r.config_fingerprint == fingerprints.config => PlanAction::Update {
            reason: UpdateReason::SecretRotated,
        },
        Some(_) => PlanAction::Update {
            reason: UpdateReason::ConfigChanged,
        },
    }
}

/// Outputs published by a node that was applied earlier, as stored.
#[must_use]
pub fn recorded_outputs(record: &AppliedRecord) -> Outputs {
    let mut outputs = record.outputs.clone();
    outputs
        .entry("id".into())
        .or_insert_with(|| json!(record.physical_id.as_str()));
    outputs
}

/// One planned change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedChange {
    /// Node ID.
    pub node_id: NodeId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// What would happen.
    #[serde(flatten)]
    pub action: PlanAction,
    /// Dependencies of the node.
    pub dependencies: Vec<NodeId>,
}

/// The result of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Stack name.
    pub stack: String,
    /// Changes in apply order; deletions last, in teardown order.
    pub changes: Vec<PlannedChange>,
    /// Every dependency edge of the graph.
    pub edges: Vec<DependencyEdge>,
}

impl Plan {
    /// Number of changes per action label.
    #[must_use]
    pub fn summary(&self) -> BTreeMap<&'static str, usize> {
        let mut summary = BTreeMap::new();
        for change in &self.changes {
            *summary.entry(change.action.as_label()).or_insert(0) += 1;
        }
        summary
    }

    /// Returns true if applying would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| !c.action.is_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_core::PhysicalId;
    use serde_json::Value;

    fn resolved(value: Value, config: Value) -> ResolvedState {
        ResolvedState {
            value,
            config,
            secret_versions: BTreeMap::new(),
        }
    }

    fn record(fp: &Fingerprints, gate_pending: bool) -> AppliedRecord {
        AppliedRecord {
            node_id: NodeId::new("svc").unwrap(),
            kind: ResourceKind::ContainerService,
            physical_id: PhysicalId::new("arn:svc").unwrap(),
            fingerprint: fp.full.clone(),
            config_fingerprint: fp.config.clone(),
            outputs: Outputs::new(),
            secret_versions: BTreeMap::new(),
            content_digest: None,
            dependencies: BTreeSet::new(),
            gate_pending,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn classification_covers_every_case() {
        let kind = ResourceKind::ContainerService;
        let v1 = Fingerprints::compute(kind, &resolved(json!({"s": 1}), json!({"s": "latest"})), None)
            .unwrap();
        let rotated =
            Fingerprints::compute(kind, &resolved(json!({"s": 2}), json!({"s": "latest"})), None)
                .unwrap();
        let changed =
            Fingerprints::compute(kind, &resolved(json!({"s": 2}), json!({"s": 2})), None).unwrap();

        assert_eq!(classify(None, &v1), PlanAction::Create);
        assert_eq!(classify(Some(&record(&v1, false)), &v1), PlanAction::NoChange);
        assert_eq!(classify(Some(&record(&v1, true)), &v1), PlanAction::ResumeGate);
        assert_eq!(
            classify(Some(&record(&v1, false)), &rotated),
            PlanAction::Update {
                reason: UpdateReason::SecretRotated
            }
        );
        assert_eq!(
            classify(Some(&record(&v1, false)), &changed),
            PlanAction::Update {
                reason: UpdateReason::ConfigChanged
            }
        );
    }

    #[test]
    fn kind_and_content_digest_are_part_of_the_fingerprint() {
        let state = resolved(json!({"name": "x"}), json!({"name": "x"}));
        let a = Fingerprints::compute(ResourceKind::Secret, &state, Some("sha256:1")).unwrap();
        let b = Fingerprints::compute(ResourceKind::Secret, &state, Some("sha256:2")).unwrap();
        let c = Fingerprints::compute(ResourceKind::LogGroup, &state, None).unwrap();
        assert_ne!(a.full, b.full);
        assert_ne!(a.full, c.full);
    }

    #[test]
    fn plan_summary_counts_actions() {
        let change = |id: &str, action| PlannedChange {
            node_id: NodeId::new(id).unwrap(),
            kind: ResourceKind::DnsRecord,
            action,
            dependencies: vec![],
        };
        let plan = Plan {
            stack: "demo".into(),
            changes: vec![
                change("a", PlanAction::Create),
                change("b", PlanAction::Create),
                change("c", PlanAction::NoChange),
                change("d", PlanAction::Delete),
            ],
            edges: vec![],
        };
        let summary = plan.summary();
        assert_eq!(summary["create"], 2);
        assert_eq!(summary["delete"], 1);
        assert!(!plan.is_empty());

        let json = serde_json::to_value(&plan.changes[0]).unwrap();
        assert_eq!(json["action"], "create");
        assert_eq!(json["nodeId"], "a");
    }
}
