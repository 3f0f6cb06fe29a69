//! Simulated provider and secret vault.
//!
//! [`InMemoryProvider`] keeps resources in a map and publishes plausible
//! outputs per kind (load balancer DNS names, certificate validation
//! records, image references). Every call is counted per node, and failures
//! and gate answers can be scripted per node. State round-trips through
//! [`ProviderSnapshot`] so the CLI can persist it between invocations.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use keel_core::canonical_json::fingerprint;
use keel_core::{NodeId, PhysicalId};

use super::collaborators::SecretVault;
use super::{Confirmation, Materialized, Provider, ProviderContext, ProviderError, ProviderResult};
use crate::node::{Outputs, ResourceKind};
use crate::secrets::SecretMaterial;

/// Provider calls made for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `create` calls.
    pub create: u32,
    /// `read` calls.
    pub read: u32,
    /// `update` calls.
    pub update: u32,
    /// `delete` calls.
    pub delete: u32,
    /// `poll_confirmation` calls.
    pub poll: u32,
}

impl CallCounts {
    /// Sum of all calls.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.create + self.read + self.update + self.delete + self.poll
    }

    /// Calls that change a resource.
    #[must_use]
    pub const fn mutations(&self) -> u32 {
        self.create + self.update + self.delete
    }
}

/// A simulated resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedResource {
    /// Node that owns it.
    pub node_id: NodeId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Last desired state applied.
    pub desired: Value,
    /// Published outputs.
    pub outputs: Outputs,
}

/// Persistent part of an [`InMemoryProvider`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSnapshot {
    /// Resources by physical ID.
    pub resources: BTreeMap<PhysicalId, SimulatedResource>,
    /// Next serial used to mint physical IDs.
    pub next_serial: u64,
}

#[derive(Debug, Clone)]
enum GateScript {
    PendingFor(u32),
    Never,
    Reject(String),
}

#[derive(Debug, Default)]
struct ProviderState {
    snapshot: ProviderSnapshot,
    calls: BTreeMap<NodeId, CallCounts>,
    created_order: Vec<NodeId>,
    next_failures: BTreeMap<NodeId, VecDeque<ProviderError>>,
    always_fail: BTreeMap<NodeId, ProviderError>,
    poll_failures: BTreeMap<NodeId, VecDeque<ProviderError>>,
    gates: BTreeMap<NodeId, GateScript>,
}

impl ProviderState {
    fn count(&mut self, node: &NodeId) -> &mut CallCounts {
        self.calls.entry(node.clone()).or_default()
    }

    fn scripted_failure(&mut self, node: &NodeId) -> Option<ProviderError> {
        if let Some(err) = self.always_fail.get(node) {
            return Some(err.clone());
        }
        self.next_failures.get_mut(node).and_then(VecDeque::pop_front)
    }
}

/// Simulated [`Provider`] with call counters and failure scripting.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    state: Mutex<ProviderState>,
}

impl InMemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider holding previously persisted resources.
    #[must_use]
    pub fn from_snapshot(snapshot: ProviderSnapshot) -> Self {
        Self {
            state: Mutex::new(ProviderState {
                snapshot,
                ..ProviderState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the persistent state.
    #[must_use]
    pub fn snapshot(&self) -> ProviderSnapshot {
        self.lock().snapshot.clone()
    }

    /// Answers `Pending` to the next `polls` confirmation polls of `node`,
    /// then `Confirmed`.
    pub fn confirm_after(&self, node: &NodeId, polls: u32) {
        self.lock()
            .gates
            .insert(node.clone(), GateScript::PendingFor(polls));
    }

    /// Answers `Pending` to every confirmation poll of `node`.
    pub fn never_confirm(&self, node: &NodeId) {
        self.lock().gates.insert(node.clone(), GateScript::Never);
    }

    /// Rejects confirmation of `node`.
    pub fn reject(&self, node: &NodeId, reason: impl Into<String>) {
        self.lock()
            .gates
            .insert(node.clone(), GateScript::Reject(reason.into()));
    }

    /// Fails the next confirmation poll of `node` with `err`.
    pub fn fail_next_poll(&self, node: &NodeId, err: ProviderError) {
        self.lock()
            .poll_failures
            .entry(node.clone())
            .or_default()
            .push_back(err);
    }

    /// Fails the next create, update or delete of `node` with `err`.
    ///
    /// Calls queue: scripting twice fails the next two calls.
    pub fn fail_next(&self, node: &NodeId, err: ProviderError) {
        self.lock()
            .next_failures
            .entry(node.clone())
            .or_default()
            .push_back(err);
    }

    /// Fails every create, update and delete of `node` with `err`.
    pub fn fail_always(&self, node: &NodeId, err: ProviderError) {
        self.lock().always_fail.insert(node.clone(), err);
    }

    /// Clears scripted failures of `node`.
    pub fn heal(&self, node: &NodeId) {
        let mut state = self.lock();
        state.always_fail.remove(node);
        state.next_failures.remove(node);
    }

    /// Removes the resources of `node` behind the engine's back.
    ///
    /// Returns true if something was removed.
    pub fn delete_out_of_band(&self, node: &NodeId) -> bool {
        let mut state = self.lock();
        let before = state.snapshot.resources.len();
        state.snapshot.resources.retain(|_, r| &r.node_id != node);
        state.snapshot.resources.len() != before
    }

    /// Calls made for `node`.
    #[must_use]
    pub fn calls(&self, node: &NodeId) -> CallCounts {
        self.lock().calls.get(node).copied().unwrap_or_default()
    }

    /// Calls made for all nodes.
    #[must_use]
    pub fn total_calls(&self) -> u32 {
        self.lock().calls.values().map(CallCounts::total).sum()
    }

    /// Nodes in the order their create calls succeeded.
    #[must_use]
    pub fn created_order(&self) -> Vec<NodeId> {
        self.lock().created_order.clone()
    }

    /// The resource with `physical_id`, if it exists.
    #[must_use]
    pub fn resource(&self, physical_id: &PhysicalId) -> Option<SimulatedResource> {
        self.lock().snapshot.resources.get(physical_id).cloned()
    }

    /// Number of existing resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().snapshot.resources.len()
    }
}

fn mint_id(kind: ResourceKind, node: &NodeId, serial: u64) -> ProviderResult<PhysicalId> {
    PhysicalId::new(format!("arn:sim:{kind}:{node}/{serial:04}"))
        .map_err(|e| ProviderError::permanent(e.to_string()))
}

fn str_field<'a>(desired: &'a Value, key: &str) -> Option<&'a str> {
    desired.get(key).and_then(Value::as_str)
}

/// Kind-specific outputs a real provider would report.
fn simulated_outputs(ctx: &ProviderContext, physical_id: &PhysicalId, desired: &Value) -> Outputs {
    let node = ctx.node_id.as_str();
    let mut outputs = Outputs::new();
    match ctx.kind {
        ResourceKind::LoadBalancer => {
            outputs.insert("dnsName".into(), json!(format!("{node}.elb.sim.internal")));
            outputs.insert("canonicalHostedZoneId".into(), json!("ZSIMELB"));
        }
        ResourceKind::Certificate => {
            let domain = str_field(desired, "domainName").unwrap_or(node);
            outputs.insert(
                "domainValidationOptions".into(),
                json!([{
                    "domainName": domain,
                    "resourceRecordName": format!("_validation.{domain}"),
                    "resourceRecordType": "CNAME",
                    "resourceRecordValue": format!("_{node}.acm-validations.sim"),
                }]),
            );
        }
        ResourceKind::DnsZone => {
            outputs.insert("nameServers".into(), json!(["ns-1.sim.internal", "ns-2.sim.internal"]));
        }
        ResourceKind::DnsRecord => {
            let fqdn = str_field(desired, "name").unwrap_or(node);
            outputs.insert("fqdn".into(), json!(fqdn));
        }
        ResourceKind::ContainerRepository => {
            let name = str_field(desired, "name").unwrap_or(node);
            outputs.insert("repositoryUrl".into(), json!(format!("registry.sim.internal/{name}")));
        }
        ResourceKind::ContainerImage => {
            let repository = str_field(desired, "repositoryUrl").unwrap_or(node);
            let tag = str_field(desired, "tag").unwrap_or("latest");
            let digest = fingerprint(desired).unwrap_or_default();
            outputs.insert("imageRef".into(), json!(format!("{repository}:{tag}")));
            outputs.insert("imageDigest".into(), json!(digest));
        }
        _ => {}
    }
    if let Some(name) = str_field(desired, "name") {
        outputs.entry("name".into()).or_insert_with(|| json!(name));
    }
    outputs.insert("arn".into(), json!(physical_id.as_str()));
    outputs
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn create(&self, ctx: &ProviderContext, desired: &Value) -> ProviderResult<Materialized> {
        let mut state = self.lock();
        state.count(&ctx.node_id).create += 1;
        if let Some(err) = state.scripted_failure(&ctx.node_id) {
            return Err(err);
        }

        state.snapshot.next_serial += 1;
        let physical_id = mint_id(ctx.kind, &ctx.node_id, state.snapshot.next_serial)?;
        let outputs = simulated_outputs(ctx, &physical_id, desired);
        state.snapshot.resources.insert(
            physical_id.clone(),
            SimulatedResource {
                node_id: ctx.node_id.clone(),
                kind: ctx.kind,
                desired: desired.clone(),
                outputs: outputs.clone(),
            },
        );
        state.created_order.push(ctx.node_id.clone());
        tracing::debug!(%physical_id, "simulated resource created");
        Ok(Materialized {
            physical_id,
            outputs,
        })
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        physical_id: &PhysicalId,
    ) -> ProviderResult<Option<Value>> {
        let mut state = self.lock();
        state.count(&ctx.node_id).read += 1;
        Ok(state
            .snapshot
            .resources
            .get(physical_id)
            .map(|r| r.desired.clone()))
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        physical_id: &PhysicalId,
        desired: &Value,
    ) -> ProviderResult<Outputs> {
        let mut state = self.lock();
        state.count(&ctx.node_id).update += 1;
        if let Some(err) = state.scripted_failure(&ctx.node_id) {
            return Err(err);
        }

        let outputs = simulated_outputs(ctx, physical_id, desired);
        let resource = state
            .snapshot
            .resources
            .get_mut(physical_id)
            .ok_or_else(|| ProviderError::permanent(format!("resource {physical_id} not found")))?;
        resource.desired = desired.clone();
        resource.outputs = outputs.clone();
        Ok(outputs)
    }

    async fn delete(&self, ctx: &ProviderContext, physical_id: &PhysicalId) -> ProviderResult<()> {
        let mut state = self.lock();
        state.count(&ctx.node_id).delete += 1;
        if let Some(err) = state.scripted_failure(&ctx.node_id) {
            return Err(err);
        }
        if state.snapshot.resources.remove(physical_id).is_none() {
            tracing::debug!(%physical_id, "resource already gone");
        }
        Ok(())
    }

    async fn poll_confirmation(
        &self,
        ctx: &ProviderContext,
        _physical_id: &PhysicalId,
    ) -> ProviderResult<Confirmation> {
        let mut state = self.lock();
        state.count(&ctx.node_id).poll += 1;
        if let Some(err) = state
            .poll_failures
            .get_mut(&ctx.node_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(match state.gates.get_mut(&ctx.node_id) {
            None => Confirmation::Confirmed,
            Some(GateScript::Never) => Confirmation::Pending,
            Some(GateScript::Reject(reason)) => Confirmation::Rejected(reason.clone()),
            Some(GateScript::PendingFor(0)) => Confirmation::Confirmed,
            Some(GateScript::PendingFor(remaining)) => {
                *remaining -= 1;
                Confirmation::Pending
            }
        })
    }
}

/// Vault calls made so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VaultCalls {
    /// `create_secret` calls.
    pub create_secret: u32,
    /// `put_secret_value` calls.
    pub put_secret_value: u32,
    /// `delete_secret` calls.
    pub delete_secret: u32,
}

/// A secret held by [`InMemoryVault`].
///
/// Only digests of each version are kept, never plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSecret {
    /// Secret name.
    pub name: String,
    /// Digest per version; version `n` is at index `n - 1`.
    pub versions: Vec<String>,
}

/// Persistent part of an [`InMemoryVault`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSnapshot {
    /// Secrets by identity.
    pub secrets: BTreeMap<PhysicalId, VaultSecret>,
}

#[derive(Debug, Default)]
struct VaultState {
    snapshot: VaultSnapshot,
    calls: VaultCalls,
}

/// Simulated [`SecretVault`].
#[derive(Debug, Default)]
pub struct InMemoryVault {
    state: Mutex<VaultState>,
}

impl InMemoryVault {
    /// Creates an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a vault holding previously persisted secrets.
    #[must_use]
    pub fn from_snapshot(snapshot: VaultSnapshot) -> Self {
        Self {
            state: Mutex::new(VaultState {
                snapshot,
                calls: VaultCalls::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Calls made so far.
    #[must_use]
    pub fn calls(&self) -> VaultCalls {
        self.lock().calls
    }

    /// Returns the persistent state.
    #[must_use]
    pub fn snapshot(&self) -> VaultSnapshot {
        self.lock().snapshot.clone()
    }

    /// Current version of a secret.
    #[must_use]
    pub fn current_version(&self, secret_id: &PhysicalId) -> Option<u64> {
        self.lock()
            .snapshot
            .secrets
            .get(secret_id)
            .map(|s| s.versions.len() as u64)
    }
}

fn digest(material: &SecretMaterial) -> ProviderResult<String> {
    material
        .digest()
        .map_err(|e| ProviderError::permanent(format!("cannot digest secret: {e}")))
}

#[async_trait]
impl SecretVault for InMemoryVault {
    async fn create_secret(
        &self,
        name: &str,
        material: &SecretMaterial,
    ) -> ProviderResult<(PhysicalId, u64)> {
        let digest = digest(material)?;
        let mut state = self.lock();
        state.calls.create_secret += 1;
        let secret_id = PhysicalId::new(format!("arn:sim:secret:{name}"))
            .map_err(|e| ProviderError::permanent(e.to_string()))?;
        if state.snapshot.secrets.contains_key(&secret_id) {
            return Err(ProviderError::permanent(format!("secret {name} already exists")));
        }
        state.snapshot.secrets.insert(
            secret_id.clone(),
            VaultSecret {
                name: name.to_string(),
                versions: vec![digest],
            },
        );
        Ok((secret_id, 1))
    }

    async fn put_secret_value(
        &self,
        secret_id: &PhysicalId,
        material: &SecretMaterial,
    ) -> ProviderResult<u64> {
        let digest = digest(material)?;
        let mut state = self.lock();
        state.calls.put_secret_value += 1;
        let secret = state
            .snapshot
            .secrets
            .get_mut(secret_id)
            .ok_or_else(|| ProviderError::permanent(format!("secret {secret_id} not found")))?;
        secret.versions.push(digest);
        Ok(secret.versions.len() as u64)
    }

    async fn delete_secret(&self, secret_id: &PhysicalId) -> ProviderResult<()> {
        let mut state = self.lock();
        state.calls.delete_secret += 1;
        state.snapshot.secrets.remove(secret_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ApplyId;

    fn ctx(node: &str, kind: ResourceKind) -> ProviderContext {
        ProviderContext::new(NodeId::new(node).unwrap(), kind, ApplyId::generate())
    }

    #[tokio::test]
    async fn create_publishes_kind_specific_outputs() {
        let provider = InMemoryProvider::new();
        let lb = provider
            .create(&ctx("app-lb", ResourceKind::LoadBalancer), &json!({"name": "app"}))
            .await
            .unwrap();
        assert_eq!(lb.outputs["dnsName"], "app-lb.elb.sim.internal");
        assert_eq!(lb.outputs["arn"], lb.physical_id.as_str());

        let cert = provider
            .create(
                &ctx("cert", ResourceKind::Certificate),
                &json!({"domainName": "example.com"}),
            )
            .await
            .unwrap();
        assert_eq!(
            cert.outputs["domainValidationOptions"][0]["resourceRecordName"],
            "_validation.example.com"
        );
        assert_eq!(provider.resource_count(), 2);
        assert_eq!(
            provider.created_order(),
            vec![NodeId::new("app-lb").unwrap(), NodeId::new("cert").unwrap()]
        );
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let provider = InMemoryProvider::new();
        let c = ctx("zone", ResourceKind::DnsZone);
        provider.fail_next(&c.node_id, ProviderError::retryable("throttled"));
        provider.fail_next(&c.node_id, ProviderError::permanent("denied"));

        assert!(provider.create(&c, &json!({})).await.unwrap_err().is_retryable());
        assert!(!provider.create(&c, &json!({})).await.unwrap_err().is_retryable());
        provider.create(&c, &json!({})).await.unwrap();
        assert_eq!(provider.calls(&c.node_id).create, 3);
    }

    #[tokio::test]
    async fn delete_of_unknown_resource_succeeds() {
        let provider = InMemoryProvider::new();
        let c = ctx("gone", ResourceKind::LogGroup);
        provider
            .delete(&c, &PhysicalId::new("arn:sim:log_group:gone/0001").unwrap())
            .await
            .unwrap();
        assert_eq!(provider.calls(&c.node_id).delete, 1);
    }

    #[tokio::test]
    async fn out_of_band_deletion_is_visible_to_read() {
        let provider = InMemoryProvider::new();
        let c = ctx("logs", ResourceKind::LogGroup);
        let created = provider.create(&c, &json!({"name": "/app"})).await.unwrap();
        assert!(provider.read(&c, &created.physical_id).await.unwrap().is_some());
        assert!(provider.delete_out_of_band(&c.node_id));
        assert!(provider.read(&c, &created.physical_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_restores_resources_but_not_counters() {
        let provider = InMemoryProvider::new();
        let c = ctx("logs", ResourceKind::LogGroup);
        let created = provider.create(&c, &json!({})).await.unwrap();

        let json = serde_json::to_string(&provider.snapshot()).unwrap();
        let restored = InMemoryProvider::from_snapshot(serde_json::from_str(&json).unwrap());
        assert!(restored.resource(&created.physical_id).is_some());
        assert_eq!(restored.total_calls(), 0);

        let next = restored.create(&c, &json!({})).await.unwrap();
        assert_ne!(next.physical_id, created.physical_id);
    }

    #[tokio::test]
    async fn vault_versions_start_at_one() {
        let vault = InMemoryVault::new();
        let (id, v1) = vault
            .create_secret("db", &SecretMaterial::new(json!({"password": "a"})))
            .await
            .unwrap();
        let v2 = vault
            .put_secret_value(&id, &SecretMaterial::new(json!({"password": "b"})))
            .await
            .unwrap();
        assert_eq!((v1, v2), (1, 2));
        assert_eq!(vault.current_version(&id), Some(2));
        assert!(!serde_json::to_string(&vault.snapshot()).unwrap().contains("\"b\""));
    }
}
