//! Declaring a stack: resources, secrets, routing rules and exports.
//!
//! A [`Stack`] separates declaration from graph assembly. Declaring a
//! resource returns a [`ResourceHandle`] whose attribute outputs can be
//! embedded in other resources' desired state; the graph derives the
//! implicit dependency edges from those embeddings.
//!
//! ```rust
//! use keel_core::NodeId;
//! use keel_flow::desired::DesiredState;
//! use keel_flow::node::{ResourceKind, ResourceNode};
//! use keel_flow::stack::{Stack, StackConfig};
//!
//! let mut stack = Stack::new(StackConfig::new("demo"));
//! let lb = stack
//!     .add_resource(ResourceNode::new(NodeId::new("app-lb")?, ResourceKind::LoadBalancer))?;
//! stack.add_resource(
//!     ResourceNode::new(NodeId::new("www")?, ResourceKind::DnsRecord)
//!         .with_desired(DesiredState::new().with("alias", lb.attr("dnsName"))),
//! )?;
//! assert_eq!(stack.graph().topological_order()?.len(), 2);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use keel_core::NodeId;

use crate::desired::{DesiredState, Property, SecretBinding};
use crate::error::Result;
use crate::gate::GateSpec;
use crate::graph::ResourceGraph;
use crate::node::{Outputs, ResourceKind, ResourceNode};
use crate::output::{Output, OutputState};
use crate::routing::{RoutingRule, RoutingTable};
use crate::secrets::{SecretMaterial, SecretRef};

/// Graph-construction settings shared by every declaration in a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackConfig {
    /// Stack name.
    pub name: String,
    /// Tags merged into every resource kind that supports tags.
    #[serde(default)]
    pub default_tags: BTreeMap<String, String>,
    /// Gate applied to gated kinds that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_gate: Option<GateSpec>,
}

impl StackConfig {
    /// Creates a config with no defaults.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a default tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_tags.insert(key.into(), value.into());
        self
    }

    /// Sets the default gate.
    #[must_use]
    pub const fn with_default_gate(mut self, gate: GateSpec) -> Self {
        self.default_gate = Some(gate);
        self
    }
}

/// Reads a dotted path (`dnsName`, `validation.0.name`) from outputs.
fn lookup_path(outputs: &Outputs, path: &str) -> std::result::Result<Value, String> {
    let mut segments = path.split('.');
    let head = segments.next().unwrap_or_default();
    let mut current = outputs
        .get(head)
        .ok_or_else(|| format!("output '{head}' not found"))?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| format!("output path '{path}' not found"))?;
    }
    Ok(current.clone())
}

/// Handle to a declared resource.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    id: NodeId,
    outputs: Output<Outputs>,
}

impl ResourceHandle {
    /// The node ID.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    /// All outputs of the node.
    #[must_use]
    pub const fn outputs(&self) -> &Output<Outputs> {
        &self.outputs
    }

    /// One output attribute; dotted paths reach into nested values.
    ///
    /// Fails if the attribute is missing once the node applies.
    #[must_use]
    pub fn attr(&self, path: &str) -> Output<Value> {
        let path = path.to_string();
        self.outputs.try_map(move |outputs| lookup_path(&outputs, &path))
    }

    /// The physical ID, once materialized.
    #[must_use]
    pub fn physical_id(&self) -> Output<Value> {
        self.attr("id")
    }
}

/// Handle to a declared secret.
#[derive(Debug, Clone)]
pub struct SecretHandle {
    id: NodeId,
    outputs: Output<Outputs>,
}

impl SecretHandle {
    /// The node ID.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    /// Reference to the latest version; rotations propagate.
    #[must_use]
    pub fn latest(&self) -> SecretBinding {
        self.reference(SecretRef::latest(self.id.clone()))
    }

    /// Reference to a fixed version.
    #[must_use]
    pub fn pinned(&self, version: u64) -> SecretBinding {
        self.reference(SecretRef::pinned(self.id.clone(), version))
    }

    /// Reference to one key of the latest version of a JSON secret.
    #[must_use]
    pub fn key(&self, key_path: &str) -> SecretBinding {
        self.reference(SecretRef::latest(self.id.clone()).with_key_path(key_path))
    }

    /// Binds an arbitrary reference to this secret.
    #[must_use]
    pub fn reference(&self, reference: SecretRef) -> SecretBinding {
        SecretBinding::new(reference, self.outputs.clone())
    }

    /// The vault identity of the secret, once stored.
    #[must_use]
    pub fn arn(&self) -> Output<Value> {
        self.outputs
            .try_map(|outputs| lookup_path(&outputs, "arn"))
    }
}

/// A declared stack.
#[derive(Debug)]
pub struct Stack {
    config: StackConfig,
    graph: ResourceGraph,
    routing: Vec<RoutingRule>,
    exports: BTreeMap<String, Output<Value>>,
}

impl Stack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new(config: StackConfig) -> Self {
        Self {
            config,
            graph: ResourceGraph::new(),
            routing: Vec::new(),
            exports: BTreeMap::new(),
        }
    }

    /// Stack name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Stack configuration.
    #[must_use]
    pub const fn config(&self) -> &StackConfig {
        &self.config
    }

    /// The resource graph.
    #[must_use]
    pub const fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    /// The resource graph, mutably.
    pub fn graph_mut(&mut self) -> &mut ResourceGraph {
        &mut self.graph
    }

    /// Declares a resource, applying stack defaults.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DuplicateNode`] if the ID is taken.
    pub fn add_resource(&mut self, mut node: ResourceNode) -> Result<ResourceHandle> {
        let kind = node.kind();
        if kind.supports_tags() && !self.config.default_tags.is_empty() {
            merge_default_tags(&mut node.desired, &self.config.default_tags);
        }
        if kind.requires_gate() && node.gate.is_none() {
            node.gate = self.config.default_gate;
        }
        let id = node.id().clone();
        self.graph.add_node(node)?;
        tracing::debug!(node_id = %id, %kind, "resource declared");
        Ok(ResourceHandle {
            outputs: self.graph.outputs_of(&id),
            id,
        })
    }

    /// Declares a secret stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DuplicateNode`] if the ID is taken.
    pub fn add_secret(
        &mut self,
        id: NodeId,
        name: impl Into<String>,
        material: SecretMaterial,
    ) -> Result<SecretHandle> {
        let node = ResourceNode::new(id.clone(), ResourceKind::Secret)
            .with_desired(DesiredState::new().with("name", name.into()))
            .with_material(material);
        self.graph.add_node(node)?;
        Ok(SecretHandle {
            outputs: self.graph.outputs_of(&id),
            id,
        })
    }

    /// An output attribute of a node that may be declared later.
    pub fn output(&mut self, id: &NodeId, path: &str) -> Output<Value> {
        ResourceHandle {
            id: id.clone(),
            outputs: self.graph.outputs_of(id),
        }
        .attr(path)
    }

    /// Handle to an already declared secret.
    pub fn secret_handle(&mut self, id: &NodeId) -> SecretHandle {
        SecretHandle {
            id: id.clone(),
            outputs: self.graph.outputs_of(id),
        }
    }

    /// Declares a host routing rule.
    pub fn add_routing_rule(&mut self, rule: RoutingRule) {
        self.routing.push(rule);
    }

    /// Publishes a value under `name` once the stack applies.
    pub fn export(&mut self, name: impl Into<String>, value: impl Into<Output<Value>>) {
        self.exports.insert(name.into(), value.into());
    }

    /// Validated routing table of the stack.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed or overlapping rules, or
    /// rules targeting undeclared nodes.
    pub fn routing_table(&self) -> Result<RoutingTable> {
        let table = RoutingTable::new(self.routing.clone())?;
        table.check_targets(|target| self.graph.node(target).is_some())?;
        Ok(table)
    }

    /// Validates the graph and the routing rules.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn validate(&self) -> Result<()> {
        self.graph.validate()?;
        for node in self.graph.nodes() {
            if let Some(gate) = &node.gate {
                gate.validate(node.id().as_str())?;
            }
        }
        self.routing_table()?;
        Ok(())
    }

    /// Export values that have resolved.
    #[must_use]
    pub fn resolved_exports(&self) -> BTreeMap<String, Value> {
        self.exports
            .iter()
            .filter_map(|(name, output)| match output.peek() {
                OutputState::Resolved(value) => Some((name.clone(), value)),
                _ => None,
            })
            .collect()
    }
}

fn merge_default_tags(desired: &mut DesiredState, defaults: &BTreeMap<String, String>) {
    match desired.get_mut("tags") {
        Some(Property::Object(map)) => {
            for (k, v) in defaults {
                map.entry(k.clone())
                    .or_insert_with(|| Property::from(v.clone()));
            }
        }
        Some(Property::Value(Value::Object(map))) => {
            for (k, v) in defaults {
                map.entry(k.clone())
                    .or_insert_with(|| Value::String(v.clone()));
            }
        }
        Some(_) => {}
        None => {
            let tags: Map<String, Value> = defaults
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            desired.insert("tags", Value::Object(tags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::Resolution;
    use crate::error::Error;
    use serde_json::json;
    use std::time::Duration;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn default_tags_merge_without_overriding() {
        let mut stack = Stack::new(StackConfig::new("demo").with_tag("env", "prod").with_tag("team", "core"));
        stack
            .add_resource(
                ResourceNode::new(id("logs"), ResourceKind::LogGroup).with_desired(
                    DesiredState::new().with("tags", json!({"team": "payments"})),
                ),
            )
            .unwrap();
        stack
            .add_resource(ResourceNode::new(id("www"), ResourceKind::DnsRecord))
            .unwrap();

        let logs = stack.graph().node(&id("logs")).unwrap();
        let Resolution::Ready(state) = logs.desired.resolve_now() else {
            panic!("expected ready");
        };
        assert_eq!(state.value["tags"], json!({"env": "prod", "team": "payments"}));
        assert!(stack.graph().node(&id("www")).unwrap().desired.get("tags").is_none());
    }

    #[test]
    fn gated_kinds_get_default_gate() {
        let gate = GateSpec::new(Duration::from_secs(5), Duration::from_secs(60));
        let mut stack = Stack::new(StackConfig::new("demo").with_default_gate(gate));
        stack
            .add_resource(ResourceNode::new(id("cert-validation"), ResourceKind::CertificateValidation))
            .unwrap();
        stack
            .add_resource(ResourceNode::new(id("cert"), ResourceKind::Certificate))
            .unwrap();
        assert_eq!(stack.graph().node(&id("cert-validation")).unwrap().gate, Some(gate));
        assert_eq!(stack.graph().node(&id("cert")).unwrap().gate, None);
    }

    #[test]
    fn attr_reads_nested_paths() {
        let mut stack = Stack::new(StackConfig::new("demo"));
        let cert = stack
            .add_resource(ResourceNode::new(id("cert"), ResourceKind::Certificate))
            .unwrap();
        let name = cert.attr("domainValidationOptions.0.resourceRecordName");
        let missing = cert.attr("nope");
        cert.outputs().resolve(Outputs::from([(
            "domainValidationOptions".to_string(),
            json!([{"resourceRecordName": "_abc.example.com."}]),
        )]));
        assert!(matches!(name.peek(), OutputState::Resolved(v) if v == "_abc.example.com."));
        assert!(matches!(missing.peek(), OutputState::Failed(_)));
    }

    #[test]
    fn forward_references_share_the_slot() {
        let mut stack = Stack::new(StackConfig::new("demo"));
        let early = stack.output(&id("lb"), "dnsName");
        let handle = stack
            .add_resource(ResourceNode::new(id("lb"), ResourceKind::LoadBalancer))
            .unwrap();
        handle
            .outputs()
            .resolve(Outputs::from([("dnsName".to_string(), json!("lb.aws"))]));
        assert!(matches!(early.peek(), OutputState::Resolved(v) if v == "lb.aws"));
    }

    #[test]
    fn routing_rules_need_known_targets() {
        let mut stack = Stack::new(StackConfig::new("demo"));
        stack
            .add_resource(ResourceNode::new(id("tg"), ResourceKind::TargetGroup))
            .unwrap();
        stack.add_routing_rule(RoutingRule::new("r1", 100, ["example.com"], id("tg")));
        stack.validate().unwrap();

        stack.add_routing_rule(RoutingRule::new("r2", 200, ["api.example.com"], id("ghost")));
        assert!(matches!(stack.validate(), Err(Error::InvalidRoutingRule { .. })));
    }

    #[test]
    fn exports_only_include_resolved_values() {
        let mut stack = Stack::new(StackConfig::new("demo"));
        let lb = stack
            .add_resource(ResourceNode::new(id("lb"), ResourceKind::LoadBalancer))
            .unwrap();
        stack.export("url", lb.attr("dnsName"));
        stack.export("region", Output::constant("eu-west-1"));
        assert_eq!(
            stack.resolved_exports(),
            BTreeMap::from([("region".to_string(), json!("eu-west-1"))])
        );
    }
}
