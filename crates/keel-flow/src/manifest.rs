//! JSON declaration manifests.
//!
//! A manifest declares a stack as data:
//!
//! ```json
//! {
//!   "name": "production",
//!   "tags": { "team": "platform" },
//!   "secrets": [
//!     { "id": "db-secret", "name": "database", "value": { "password": { "fromEnv": "DB_PASSWORD" } } }
//!   ],
//!   "resources": [
//!     { "id": "app-lb", "type": "load_balancer", "properties": { "name": "app" } },
//!     { "id": "www", "type": "dns_record",
//!       "properties": { "name": "www.example.com", "values": ["${app-lb.dnsName}"] } }
//!   ],
//!   "exports": { "url": "https://${www.fqdn}" }
//! }
//! ```
//!
//! String properties may embed `${node.attr}` references (`${node}` alone
//! means its physical ID). A string that is exactly one reference keeps the
//! referenced value's JSON type; anything else is interpolated into a string.
//! `{"secretRef": {...}}` objects become secret references. Node IDs used in
//! references must not contain `.`.
//!
//! `listener_rule` resources with a literal `priority`, literal `hosts` and a
//! `targetGroupArn` reference also declare a routing rule.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use keel_core::NodeId;

use crate::desired::{DesiredState, Property};
use crate::error::{Error, Result};
use crate::gate::GateSpec;
use crate::node::{ResourceKind, ResourceNode};
use crate::output::{Output, interpolate};
use crate::routing::RoutingRule;
use crate::secrets::{SecretMaterial, SecretRef};
use crate::stack::{Stack, StackConfig};

/// A declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceDecl {
    /// Node ID.
    pub id: NodeId,
    /// Resource kind.
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    /// Desired-state properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<NodeId>,
    /// Confirmation gate settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,
}

/// A declared secret. Leaves of `value` may be `{"fromEnv": "VAR"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecretDecl {
    /// Node ID.
    pub id: NodeId,
    /// Name in the vault.
    pub name: String,
    /// Secret content.
    pub value: Value,
}

/// A stack declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Manifest {
    /// Stack name.
    pub name: String,
    /// Default tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Default gate for gated kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_gate: Option<GateSpec>,
    /// Secrets.
    #[serde(default)]
    pub secrets: Vec<SecretDecl>,
    /// Resources.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    /// Exported values.
    #[serde(default)]
    pub exports: BTreeMap<String, Value>,
}

impl Manifest {
    /// Parses a manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Manifest`] if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::manifest(format!("invalid manifest: {e}")))
    }

    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Manifest`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::manifest(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Builds a stack, reading `fromEnv` secret values from the process
    /// environment.
    ///
    /// # Errors
    ///
    /// See [`Manifest::build_with`].
    pub fn build(&self) -> Result<Stack> {
        self.build_with(|name| std::env::var(name).ok())
    }

    /// Builds a stack, reading `fromEnv` secret values through `env`.
    ///
    /// The stack is not validated; cycles and unknown references surface
    /// from [`Stack::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Manifest`] for malformed references or missing
    /// environment variables, or [`Error::DuplicateNode`].
    pub fn build_with(&self, env: impl Fn(&str) -> Option<String>) -> Result<Stack> {
        let mut config = StackConfig::new(&self.name);
        config.default_tags.clone_from(&self.tags);
        config.default_gate = self.default_gate;
        let mut stack = Stack::new(config);

        for secret in &self.secrets {
            let value = substitute_env(&secret.value, &env)
                .map_err(|var| Error::manifest(format!("secret {}: environment variable {var} is not set", secret.id)))?;
            stack.add_secret(secret.id.clone(), &secret.name, SecretMaterial::new(value))?;
        }

        for decl in &self.resources {
            let mut desired = DesiredState::new();
            for (key, value) in &decl.properties {
                desired.insert(key.clone(), to_property(&mut stack, value)?);
            }
            let mut node = ResourceNode::new(decl.id.clone(), decl.kind).with_desired(desired);
            for dep in &decl.depends_on {
                node = node.depends_on(dep.clone());
            }
            if let Some(gate) = decl.gate {
                node = node.with_gate(gate);
            }
            stack.add_resource(node)?;

            if let Some(rule) = routing_rule(decl)? {
                stack.add_routing_rule(rule);
            }
        }

        for (name, value) in &self.exports {
            let output = match value {
                Value::String(s) if s.contains("${") => template_output(&mut stack, s)?,
                other => Output::constant(other.clone()),
            };
            stack.export(name.clone(), output);
        }

        tracing::debug!(
            stack = %self.name,
            resources = self.resources.len(),
            secrets = self.secrets.len(),
            "manifest loaded"
        );
        Ok(stack)
    }
}

/// Replaces `{"fromEnv": VAR}` leaves; returns the missing variable name.
fn substitute_env(
    value: &Value,
    env: &impl Fn(&str) -> Option<String>,
) -> std::result::Result<Value, String> {
    match value {
        Value::Object(map) => {
            if let (1, Some(Value::String(var))) = (map.len(), map.get("fromEnv")) {
                return env(var).map(Value::String).ok_or_else(|| var.clone());
            }
            map.iter()
                .map(|(k, v)| Ok((k.clone(), substitute_env(v, env)?)))
                .collect::<std::result::Result<Map<_, _>, _>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .iter()
            .map(|v| substitute_env(v, env))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn to_property(stack: &mut Stack, value: &Value) -> Result<Property> {
    Ok(match value {
        Value::String(s) if s.contains("${") => Property::Output(template_output(stack, s)?),
        Value::Object(map) => {
            if let (1, Some(reference)) = (map.len(), map.get("secretRef")) {
                let reference: SecretRef = serde_json::from_value(reference.clone())
                    .map_err(|e| Error::manifest(format!("invalid secretRef: {e}")))?;
                let handle = stack.secret_handle(&reference.secret);
                return Ok(Property::Secret(handle.reference(reference)));
            }
            let mut props = BTreeMap::new();
            for (key, item) in map {
                props.insert(key.clone(), to_property(stack, item)?);
            }
            Property::Object(props)
        }
        Value::Array(items) => Property::List(
            items
                .iter()
                .map(|item| to_property(stack, item))
                .collect::<Result<_>>()?,
        ),
        other => Property::Value(other.clone()),
    })
}

/// One `${node.attr}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reference {
    node: NodeId,
    path: String,
}

impl Reference {
    fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let (node, path) = expr.split_once('.').unwrap_or((expr, "id"));
        let node = NodeId::new(node)
            .map_err(|e| Error::manifest(format!("invalid reference '${{{expr}}}': {e}")))?;
        if path.is_empty() {
            return Err(Error::manifest(format!("invalid reference '${{{expr}}}': empty attribute")));
        }
        Ok(Self {
            node,
            path: path.to_string(),
        })
    }
}

/// Splits a template into literal text (with braces escaped for
/// [`interpolate`]) and references.
fn parse_template(template: &str) -> Result<(String, Vec<Reference>)> {
    let mut rendered = String::with_capacity(template.len());
    let mut references = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        push_escaped(&mut rendered, &rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| Error::manifest(format!("unterminated reference in '{template}'")))?;
        rendered.push_str(&format!("{{{}}}", references.len()));
        references.push(Reference::parse(&after[..end])?);
        rest = &after[end + 1..];
    }
    push_escaped(&mut rendered, rest);
    Ok((rendered, references))
}

fn push_escaped(out: &mut String, literal: &str) {
    for c in literal.chars() {
        match c {
            '{' => out.push_str("{{"),
            '}' => out.push_str("}}"),
            other => out.push(other),
        }
    }
}

fn template_output(stack: &mut Stack, template: &str) -> Result<Output<Value>> {
    let (rendered, references) = parse_template(template)?;
    let inputs: Vec<Output<Value>> = references
        .iter()
        .map(|r| stack.output(&r.node, &r.path))
        .collect();
    if rendered == "{0}" {
        if let Some(single) = inputs.first().cloned() {
            return Ok(single);
        }
    }
    Ok(interpolate(rendered, &inputs).into())
}

fn routing_rule(decl: &ResourceDecl) -> Result<Option<RoutingRule>> {
    if decl.kind != ResourceKind::ListenerRule {
        return Ok(None);
    }
    let priority = decl.properties.get("priority").and_then(Value::as_u64);
    let hosts = decl.properties.get("hosts").and_then(Value::as_array);
    let target = decl.properties.get("targetGroupArn").and_then(Value::as_str);
    let (Some(priority), Some(hosts), Some(target)) = (priority, hosts, target) else {
        return Ok(None);
    };

    let priority = u32::try_from(priority)
        .map_err(|_| Error::manifest(format!("{}: priority {priority} is out of range", decl.id)))?;
    let hosts = hosts
        .iter()
        .map(|h| {
            h.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::manifest(format!("{}: hosts must be strings", decl.id)))
        })
        .collect::<Result<Vec<_>>>()?;
    let (_, references) = parse_template(target)?;
    let [reference] = references.as_slice() else {
        return Err(Error::manifest(format!(
            "{}: targetGroupArn must be a single reference",
            decl.id
        )));
    };
    Ok(Some(RoutingRule::new(
        decl.id.as_str(),
        priority,
        hosts,
        reference.node.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn templates_escape_literal_braces() {
        let (rendered, refs) = parse_template("{\"host\": \"${lb.dnsName}\"}:${db}").unwrap();
        assert_eq!(rendered, "{{\"host\": \"{0}\"}}:{1}");
        assert_eq!(refs[0], Reference { node: id("lb"), path: "dnsName".into() });
        assert_eq!(refs[1], Reference { node: id("db"), path: "id".into() });
        assert!(parse_template("${lb").is_err());
    }

    #[test]
    fn references_become_implicit_edges() {
        let manifest = Manifest::from_json(
            &json!({
                "name": "demo",
                "resources": [
                    {"id": "lb", "type": "load_balancer", "properties": {"name": "app"}},
                    {"id": "www", "type": "dns_record", "properties": {
                        "name": "www.example.com",
                        "values": ["${lb.dnsName}"],
                        "comment": "points at ${lb.dnsName}"
                    }}
                ]
            })
            .to_string(),
        )
        .unwrap();
        let stack = manifest.build_with(no_env).unwrap();
        stack.validate().unwrap();
        let deps = stack.graph().dependencies_of(&id("www")).unwrap();
        assert_eq!(deps, vec![id("lb")]);
    }

    #[test]
    fn secrets_read_env_and_refs_bind() {
        let manifest = Manifest::from_json(
            &json!({
                "name": "demo",
                "secrets": [{"id": "db-secret", "name": "db", "value": {"password": {"fromEnv": "DB_PASSWORD"}}}],
                "resources": [{"id": "svc", "type": "container_service", "properties": {
                    "secrets": [{"secretRef": {"secret": "db-secret", "keyPath": "password"}}]
                }}]
            })
            .to_string(),
        )
        .unwrap();

        let err = manifest.build_with(no_env).unwrap_err();
        assert!(err.to_string().contains("DB_PASSWORD"));

        let stack = manifest
            .build_with(|name| (name == "DB_PASSWORD").then(|| "hunter2".to_string()))
            .unwrap();
        let svc = stack.graph().node(&id("svc")).unwrap();
        assert_eq!(svc.references(), BTreeSet::from([id("db-secret")]));
        let secret = stack.graph().node(&id("db-secret")).unwrap();
        assert_eq!(secret.material.as_ref().unwrap().expose()["password"], "hunter2");
    }

    #[test]
    fn listener_rules_declare_routing_rules() {
        let manifest = Manifest::from_json(
            &json!({
                "name": "demo",
                "resources": [
                    {"id": "web-tg", "type": "target_group"},
                    {"id": "api-tg", "type": "target_group"},
                    {"id": "web-rule", "type": "listener_rule", "properties": {
                        "priority": 100, "hosts": ["*.example.com"], "targetGroupArn": "${web-tg.arn}"}},
                    {"id": "api-rule", "type": "listener_rule", "properties": {
                        "priority": 200, "hosts": ["api.example.com"], "targetGroupArn": "${api-tg.arn}"}}
                ]
            })
            .to_string(),
        )
        .unwrap();
        let stack = manifest.build_with(no_env).unwrap();
        let table = stack.routing_table().unwrap();
        let rule = table.evaluate("api.example.com").unwrap().unwrap();
        assert_eq!(rule.target, id("web-tg"));
    }

    #[test]
    fn unknown_fields_and_types_are_rejected() {
        assert!(Manifest::from_json(r#"{"name": "x", "resources": [{"id": "a", "type": "teleporter"}]}"#).is_err());
        assert!(Manifest::from_json(r#"{"name": "x", "extra": true}"#).is_err());
        let err = Manifest::from_json("{").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn exports_keep_literals_and_resolve_references() {
        let manifest = Manifest::from_json(
            &json!({
                "name": "demo",
                "resources": [{"id": "lb", "type": "load_balancer"}],
                "exports": {"region": "eu-west-1", "url": "https://${lb.dnsName}/"}
            })
            .to_string(),
        )
        .unwrap();
        let mut stack = manifest.build_with(no_env).unwrap();
        assert_eq!(stack.resolved_exports().len(), 1);
        stack
            .graph_mut()
            .outputs_of(&id("lb"))
            .resolve(BTreeMap::from([("dnsName".to_string(), json!("lb.sim"))]));
        assert_eq!(stack.resolved_exports()["url"], "https://lb.sim/");
    }

    #[test]
    fn lone_reference_keeps_upstream_value() {
        let manifest = Manifest::from_json(
            &json!({
                "name": "demo",
                "resources": [{"id": "lb", "type": "load_balancer"}],
                "exports": {"ports": "${lb.ports}", "label": "port ${lb.ports}"}
            })
            .to_string(),
        )
        .unwrap();
        let mut stack = manifest.build_with(no_env).unwrap();
        stack
            .graph_mut()
            .outputs_of(&id("lb"))
            .resolve(BTreeMap::from([("ports".to_string(), json!([80, 443]))]));

        let exports = stack.resolved_exports();
        assert_eq!(exports["ports"], json!([80, 443]));
        assert!(exports["label"].is_string());
    }
}
