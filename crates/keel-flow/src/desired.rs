//! Desired-state property trees.
//!
//! A node's desired state is a JSON-shaped tree whose leaves are literal
//! values, [`Output`] references to other nodes' values, or secret
//! references. Resolving the tree substitutes every reference and yields the
//! JSON handed to the provider plus the fingerprints used for the
//! idempotent-upsert diff.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use keel_core::NodeId;
use keel_core::canonical_json::fingerprint;

use crate::error::Result;
use crate::node::Outputs;
use crate::output::{Output, OutputError, OutputState};
use crate::secrets::{SecretRef, SecretVersion};

/// A secret reference bound to the output slot of its secret node.
#[derive(Debug, Clone)]
pub struct SecretBinding {
    reference: SecretRef,
    target: Output<Outputs>,
}

impl SecretBinding {
    /// Binds `reference` to the outputs of the secret node it names.
    #[must_use]
    pub const fn new(reference: SecretRef, target: Output<Outputs>) -> Self {
        Self { reference, target }
    }

    /// The underlying reference.
    #[must_use]
    pub const fn reference(&self) -> &SecretRef {
        &self.reference
    }
}

/// One node of a desired-state tree.
#[derive(Debug, Clone)]
pub enum Property {
    /// A literal JSON value.
    Value(Value),
    /// A value produced by another node.
    Output(Output<Value>),
    /// A reference to a secret node.
    Secret(SecretBinding),
    /// A list of properties.
    List(Vec<Property>),
    /// A map of properties.
    Object(BTreeMap<String, Property>),
}

impl From<Value> for Property {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for Property {
    fn from(value: &str) -> Self {
        Self::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Property {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

impl From<Output<Value>> for Property {
    fn from(output: Output<Value>) -> Self {
        Self::Output(output)
    }
}

impl From<Output<String>> for Property {
    fn from(output: Output<String>) -> Self {
        Self::Output(output.map(Value::String))
    }
}

impl From<SecretBinding> for Property {
    fn from(binding: SecretBinding) -> Self {
        Self::Secret(binding)
    }
}

impl<P: Into<Property>> From<Vec<P>> for Property {
    fn from(items: Vec<P>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl Property {
    fn visit_references(&self, refs: &mut BTreeSet<NodeId>) {
        match self {
            Self::Value(_) => {}
            Self::Output(output) => refs.extend(output.sources().iter().cloned()),
            Self::Secret(binding) => {
                refs.insert(binding.reference.secret.clone());
            }
            Self::List(items) => items.iter().for_each(|p| p.visit_references(refs)),
            Self::Object(map) => map.values().for_each(|p| p.visit_references(refs)),
        }
    }

    /// Returns `(value, config)`; `config` renders `Latest` secret versions
    /// as `"latest"` so a rotation does not change it.
    fn resolve_into(&self, walk: &mut Walk) -> (Value, Value) {
        match self {
            Self::Value(value) => (value.clone(), value.clone()),
            Self::Output(output) => match output.peek() {
                OutputState::Resolved(value) => (value.clone(), value),
                OutputState::Unresolved => {
                    walk.deferred.extend(output.sources().iter().cloned());
                    (Value::Null, Value::Null)
                }
                OutputState::Failed(err) => {
                    walk.fail(err);
                    (Value::Null, Value::Null)
                }
            },
            Self::Secret(binding) => binding.resolve_into(walk),
            Self::List(items) => {
                let (values, configs): (Vec<Value>, Vec<Value>) =
                    items.iter().map(|p| p.resolve_into(walk)).unzip();
                (Value::Array(values), Value::Array(configs))
            }
            Self::Object(map) => {
                let mut values = Map::new();
                let mut configs = Map::new();
                for (key, prop) in map {
                    let (value, config) = prop.resolve_into(walk);
                    values.insert(key.clone(), value);
                    configs.insert(key.clone(), config);
                }
                (Value::Object(values), Value::Object(configs))
            }
        }
    }
}

impl SecretBinding {
    fn resolve_into(&self, walk: &mut Walk) -> (Value, Value) {
        let secret = &self.reference.secret;
        let outputs = match self.target.peek() {
            OutputState::Resolved(outputs) => outputs,
            OutputState::Unresolved => {
                walk.deferred.insert(secret.clone());
                return (Value::Null, Value::Null);
            }
            OutputState::Failed(err) => {
                walk.fail(err);
                return (Value::Null, Value::Null);
            }
        };

        let secret_id = outputs.get("arn").and_then(Value::as_str);
        let current = outputs.get("version").and_then(Value::as_u64);
        let (Some(secret_id), Some(current)) = (secret_id, current) else {
            walk.fail(OutputError::from_node(
                secret.clone(),
                format!("secret {secret} has no arn/version outputs"),
            ));
            return (Value::Null, Value::Null);
        };

        let (version, config_version) = match self.reference.version {
            SecretVersion::Latest => (current, None),
            SecretVersion::Pinned(v) => (v, Some(v)),
        };
        walk.secret_versions.insert(secret.clone(), version);
        (
            self.reference.marker(secret_id, Some(version)),
            self.reference.marker(secret_id, config_version),
        )
    }
}

#[derive(Default)]
struct Walk {
    deferred: BTreeSet<NodeId>,
    failure: Option<OutputError>,
    secret_versions: BTreeMap<NodeId, u64>,
}

impl Walk {
    fn fail(&mut self, err: OutputError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }
}

/// Fully resolved desired state.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedState {
    /// JSON passed to the provider.
    pub value: Value,
    /// Same as `value`, but with `Latest` secret versions left symbolic.
    pub config: Value,
    /// Secret versions consumed, by secret node.
    pub secret_versions: BTreeMap<NodeId, u64>,
}

/// Outcome of resolving a desired state.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Every reference resolved.
    Ready(ResolvedState),
    /// Some references are not known yet; lists their source nodes.
    Deferred(BTreeSet<NodeId>),
    /// A reference failed.
    Failed(OutputError),
}

/// The desired state of a node: an object-shaped property tree.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    properties: BTreeMap<String, Property>,
}

impl DesiredState {
    /// Creates an empty desired state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`DesiredState::insert`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, property: impl Into<Property>) -> Self {
        self.insert(key, property);
        self
    }

    /// Sets a top-level property.
    pub fn insert(&mut self, key: impl Into<String>, property: impl Into<Property>) {
        self.properties.insert(key.into(), property.into());
    }

    /// Returns a top-level property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Property> {
        self.properties.get(key)
    }

    /// Returns a mutable top-level property.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Property> {
        self.properties.get_mut(key)
    }

    /// Iterates top-level properties in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Property)> {
        self.properties.iter()
    }

    /// Nodes this state references through outputs or secrets.
    ///
    /// These become implicit dependency edges.
    #[must_use]
    pub fn references(&self) -> BTreeSet<NodeId> {
        let mut refs = BTreeSet::new();
        for prop in self.properties.values() {
            prop.visit_references(&mut refs);
        }
        refs
    }

    /// Resolves against the current state of every reference, without waiting.
    #[must_use]
    pub fn resolve_now(&self) -> Resolution {
        let mut walk = Walk::default();
        let mut values = Map::new();
        let mut configs = Map::new();
        for (key, prop) in &self.properties {
            let (value, config) = prop.resolve_into(&mut walk);
            values.insert(key.clone(), value);
            configs.insert(key.clone(), config);
        }
        if let Some(err) = walk.failure {
            return Resolution::Failed(err);
        }
        if !walk.deferred.is_empty() {
            return Resolution::Deferred(walk.deferred);
        }
        Resolution::Ready(ResolvedState {
            value: Value::Object(values),
            config: Value::Object(configs),
            secret_versions: walk.secret_versions,
        })
    }
}

impl ResolvedState {
    /// Fingerprint of the full resolved value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be canonicalized.
    pub fn fingerprint(&self) -> Result<String> {
        Ok(fingerprint(&self.value)?)
    }

    /// Fingerprint with `Latest` secret versions left symbolic.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be canonicalized.
    pub fn config_fingerprint(&self) -> Result<String> {
        Ok(fingerprint(&self.config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn secret_outputs(version: u64) -> Outputs {
        BTreeMap::from([
            ("arn".to_string(), json!("arn:secret:db")),
            ("version".to_string(), json!(version)),
        ])
    }

    #[test]
    fn literal_state_resolves_immediately() {
        let desired = DesiredState::new()
            .with("name", "rabbitmq")
            .with("port", json!(5672));
        let Resolution::Ready(state) = desired.resolve_now() else {
            panic!("expected ready");
        };
        assert_eq!(state.value, json!({"name": "rabbitmq", "port": 5672}));
        assert!(desired.references().is_empty());
    }

    #[test]
    fn unresolved_outputs_defer_with_sources() {
        let lb = Output::<Value>::produced_by(node("app-lb"));
        let desired = DesiredState::new().with(
            "alias",
            Property::Object(BTreeMap::from([("name".to_string(), Property::from(lb.clone()))])),
        );
        assert_eq!(desired.references(), BTreeSet::from([node("app-lb")]));
        assert_eq!(
            desired.resolve_now(),
            Resolution::Deferred(BTreeSet::from([node("app-lb")]))
        );

        lb.resolve(json!("lb.example.com"));
        let Resolution::Ready(state) = desired.resolve_now() else {
            panic!("expected ready");
        };
        assert_eq!(state.value, json!({"alias": {"name": "lb.example.com"}}));
    }

    #[test]
    fn failed_output_fails_resolution() {
        let bad = Output::<Value>::failed(OutputError::from_node(node("cert"), "rejected"));
        let desired = DesiredState::new().with("certificateArn", bad);
        assert!(matches!(desired.resolve_now(), Resolution::Failed(e) if e.message == "rejected"));
    }

    #[test]
    fn latest_secret_changes_value_but_not_config() {
        let v1 = Output::resolved(secret_outputs(1));
        let v2 = Output::resolved(secret_outputs(2));
        let reference = SecretRef::latest(node("db-secret")).with_key_path("password");

        let state = |slot: &Output<Outputs>| {
            let desired = DesiredState::new().with(
                "secrets",
                Property::from(vec![Property::from(SecretBinding::new(reference.clone(), slot.clone()))]),
            );
            match desired.resolve_now() {
                Resolution::Ready(s) => s,
                other => panic!("expected ready, got {other:?}"),
            }
        };
        let first = state(&v1);
        let second = state(&v2);

        assert_ne!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
        assert_eq!(
            first.config_fingerprint().unwrap(),
            second.config_fingerprint().unwrap()
        );
        assert_eq!(second.secret_versions.get(&node("db-secret")), Some(&2));
        assert_eq!(
            second.value["secrets"][0]["$secretRef"]["secretId"],
            "arn:secret:db"
        );
    }

    #[test]
    fn pinned_secret_uses_pinned_version() {
        let slot = Output::resolved(secret_outputs(5));
        let desired = DesiredState::new().with(
            "env",
            SecretBinding::new(SecretRef::pinned(node("db-secret"), 2), slot),
        );
        let Resolution::Ready(state) = desired.resolve_now() else {
            panic!("expected ready");
        };
        assert_eq!(state.value["env"]["$secretRef"]["version"], 2);
        assert_eq!(state.config["env"]["$secretRef"]["version"], 2);
    }
}
