//! Narrow collaborator interfaces and the adapters that expose them as
//! [`Provider`]s.
//!
//! Cloud SDKs are not part of this crate. An integration implements one of
//! these traits and wraps it in the matching adapter, which translates the
//! resolved desired state into typed calls and registers with a
//! [`CompositeProvider`](super::CompositeProvider) for the kinds it serves.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use keel_core::PhysicalId;

use super::{Materialized, Provider, ProviderContext, ProviderError, ProviderResult};
use crate::node::{Outputs, ResourceKind};
use crate::secrets::SecretMaterial;

/// DNS record operations.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Creates or replaces a record; the same name and type yield the same ID.
    async fn create_record(&self, record: &DnsRecordSpec) -> ProviderResult<PhysicalId>;

    /// Deletes a record. Deleting a missing record succeeds.
    async fn delete_record(&self, record_id: &PhysicalId) -> ProviderResult<()>;

    /// Returns true if the zone exists and is served.
    async fn validate_zone(&self, zone_id: &str) -> ProviderResult<bool>;
}

/// Secret storage with versioned values.
#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Creates a secret and stores its first version.
    ///
    /// Returns the secret's identity and the version number (1).
    async fn create_secret(
        &self,
        name: &str,
        material: &SecretMaterial,
    ) -> ProviderResult<(PhysicalId, u64)>;

    /// Stores a new version of an existing secret and returns its number.
    async fn put_secret_value(
        &self,
        secret_id: &PhysicalId,
        material: &SecretMaterial,
    ) -> ProviderResult<u64>;

    /// Deletes a secret and all its versions.
    async fn delete_secret(&self, secret_id: &PhysicalId) -> ProviderResult<()>;
}

/// Builds container images and pushes them to a registry.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds `context` and returns the pushed image reference.
    async fn build_and_push(&self, context: &BuildContext) -> ProviderResult<String>;
}

/// Load balancer listener and target group operations.
#[async_trait]
pub trait LoadBalancerController: Send + Sync {
    /// Creates a target group.
    async fn create_target_group(&self, spec: &Value) -> ProviderResult<Materialized>;

    /// Creates a listener.
    async fn create_listener(&self, spec: &Value) -> ProviderResult<Materialized>;

    /// Creates a listener rule.
    async fn create_listener_rule(&self, spec: &Value) -> ProviderResult<Materialized>;

    /// Modifies any of the above in place.
    async fn modify(&self, id: &PhysicalId, spec: &Value) -> ProviderResult<Outputs>;

    /// Deletes any of the above. Deleting a missing resource succeeds.
    async fn delete(&self, id: &PhysicalId) -> ProviderResult<()>;
}

/// A DNS record to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecordSpec {
    /// Hosted zone ID.
    pub zone_id: String,
    /// Fully qualified record name.
    pub name: String,
    /// Record type (`A`, `CNAME`, ...).
    #[serde(rename = "type")]
    pub record_type: String,
    /// Record values.
    #[serde(default)]
    pub values: Vec<String>,
    /// TTL in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

const fn default_ttl() -> u64 {
    300
}

/// Inputs of an image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildContext {
    /// Directory holding the build context.
    pub path: String,
    /// Dockerfile path relative to `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Registry repository to push to.
    pub repository_url: String,
    /// Image tag.
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Build arguments.
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
}

fn default_tag() -> String {
    "latest".to_string()
}

fn parse<T: DeserializeOwned>(ctx: &ProviderContext, desired: &Value) -> ProviderResult<T> {
    serde_json::from_value(desired.clone()).map_err(|e| {
        ProviderError::permanent(format!("invalid {} properties for {}: {e}", ctx.kind, ctx.node_id))
    })
}

fn unsupported(adapter: &str, ctx: &ProviderContext) -> ProviderError {
    ProviderError::permanent(format!("{adapter} cannot manage {} ({})", ctx.kind, ctx.node_id))
}

/// Exposes a [`DnsProvider`] for `dns_record` nodes.
#[derive(Debug)]
pub struct DnsRecordAdapter<D> {
    dns: D,
}

impl<D: DnsProvider> DnsRecordAdapter<D> {
    /// Wraps `dns`.
    pub const fn new(dns: D) -> Self {
        Self { dns }
    }

    async fn upsert(&self, ctx: &ProviderContext, desired: &Value) -> ProviderResult<Materialized> {
        if ctx.kind != ResourceKind::DnsRecord {
            return Err(unsupported("dns adapter", ctx));
        }
        let record: DnsRecordSpec = parse(ctx, desired)?;
        if !self.dns.validate_zone(&record.zone_id).await? {
            return Err(ProviderError::permanent(format!(
                "hosted zone {} does not exist",
                record.zone_id
            )));
        }
        let physical_id = self.dns.create_record(&record).await?;
        let outputs = Outputs::from([("fqdn".to_string(), json!(record.name))]);
        Ok(Materialized {
            physical_id,
            outputs,
        })
    }
}

#[async_trait]
impl<D: DnsProvider> Provider for DnsRecordAdapter<D> {
    async fn create(&self, ctx: &ProviderContext, desired: &Value) -> ProviderResult<Materialized> {
        self.upsert(ctx, desired).await
    }

    async fn read(
        &self,
        _ctx: &ProviderContext,
        physical_id: &PhysicalId,
    ) -> ProviderResult<Option<Value>> {
        // Records are upserted, so a missing one is recreated by `update`.
        Ok(Some(json!({ "id": physical_id.as_str() })))
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        _physical_id: &PhysicalId,
        desired: &Value,
    ) -> ProviderResult<Outputs> {
        Ok(self.upsert(ctx, desired).await?.outputs)
    }

    async fn delete(&self, _ctx: &ProviderContext, physical_id: &PhysicalId) -> ProviderResult<()> {
        self.dns.delete_record(physical_id).await
    }
}

/// Exposes an [`ImageBuilder`] for `container_image` nodes.
///
/// The physical ID is the repository the image is pushed to; each build
/// publishes its reference as the `imageRef` output. Deleting an image is a
/// no-op; registries expire images by lifecycle policy.
#[derive(Debug)]
pub struct ImageAdapter<B> {
    builder: B,
}

impl<B: ImageBuilder> ImageAdapter<B> {
    /// Wraps `builder`.
    pub const fn new(builder: B) -> Self {
        Self { builder }
    }

    async fn build(&self, ctx: &ProviderContext, context: &BuildContext) -> ProviderResult<Outputs> {
        if ctx.kind != ResourceKind::ContainerImage {
            return Err(unsupported("image adapter", ctx));
        }
        let image_ref = self.builder.build_and_push(context).await?;
        Ok(Outputs::from([("imageRef".to_string(), json!(image_ref))]))
    }
}

#[async_trait]
impl<B: ImageBuilder> Provider for ImageAdapter<B> {
    async fn create(&self, ctx: &ProviderContext, desired: &Value) -> ProviderResult<Materialized> {
        let context: BuildContext = parse(ctx, desired)?;
        let outputs = self.build(ctx, &context).await?;
        let physical_id = PhysicalId::new(context.repository_url)
            .map_err(|e| ProviderError::permanent(e.to_string()))?;
        Ok(Materialized {
            physical_id,
            outputs,
        })
    }

    async fn read(
        &self,
        _ctx: &ProviderContext,
        physical_id: &PhysicalId,
    ) -> ProviderResult<Option<Value>> {
        Ok(Some(json!({ "repositoryUrl": physical_id.as_str() })))
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        physical_id: &PhysicalId,
        desired: &Value,
    ) -> ProviderResult<Outputs> {
        let context: BuildContext = parse(ctx, desired)?;
        if context.repository_url != physical_id.as_str() {
            return Err(ProviderError::permanent(format!(
                "{} pushes to {}; moving it to {} needs a new node",
                ctx.node_id, physical_id, context.repository_url
            )));
        }
        self.build(ctx, &context).await
    }

    async fn delete(&self, _ctx: &ProviderContext, _physical_id: &PhysicalId) -> ProviderResult<()> {
        Ok(())
    }
}

/// Exposes a [`LoadBalancerController`] for target groups, listeners and
/// listener rules.
#[derive(Debug)]
pub struct LoadBalancerAdapter<L> {
    controller: L,
}

impl<L: LoadBalancerController> LoadBalancerAdapter<L> {
    /// Wraps `controller`.
    pub const fn new(controller: L) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl<L: LoadBalancerController> Provider for LoadBalancerAdapter<L> {
    async fn create(&self, ctx: &ProviderContext, desired: &Value) -> ProviderResult<Materialized> {
        match ctx.kind {
            ResourceKind::TargetGroup => self.controller.create_target_group(desired).await,
            ResourceKind::Listener => self.controller.create_listener(desired).await,
            ResourceKind::ListenerRule => self.controller.create_listener_rule(desired).await,
            _ => Err(unsupported("load balancer adapter", ctx)),
        }
    }

    async fn read(
        &self,
        _ctx: &ProviderContext,
        physical_id: &PhysicalId,
    ) -> ProviderResult<Option<Value>> {
        Ok(Some(json!({ "id": physical_id.as_str() })))
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        physical_id: &PhysicalId,
        desired: &Value,
    ) -> ProviderResult<Outputs> {
        match ctx.kind {
            ResourceKind::TargetGroup | ResourceKind::Listener | ResourceKind::ListenerRule => {
                self.controller.modify(physical_id, desired).await
            }
            _ => Err(unsupported("load balancer adapter", ctx)),
        }
    }

    async fn delete(&self, _ctx: &ProviderContext, physical_id: &PhysicalId) -> ProviderResult<()> {
        self.controller.delete(physical_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use keel_core::{ApplyId, NodeId};

    #[derive(Default)]
    struct FakeDns {
        zones: Vec<String>,
        records: Mutex<Vec<DnsRecordSpec>>,
    }

    #[async_trait]
    impl DnsProvider for FakeDns {
        async fn create_record(&self, record: &DnsRecordSpec) -> ProviderResult<PhysicalId> {
            self.records.lock().unwrap().push(record.clone());
            Ok(PhysicalId::new(format!("{}/{}/{}", record.zone_id, record.name, record.record_type)).unwrap())
        }

        async fn delete_record(&self, _record_id: &PhysicalId) -> ProviderResult<()> {
            Ok(())
        }

        async fn validate_zone(&self, zone_id: &str) -> ProviderResult<bool> {
            Ok(self.zones.iter().any(|z| z == zone_id))
        }
    }

    fn ctx(kind: ResourceKind) -> ProviderContext {
        ProviderContext::new(NodeId::new("n").unwrap(), kind, ApplyId::generate())
    }

    #[tokio::test]
    async fn dns_adapter_upserts_records() {
        let adapter = DnsRecordAdapter::new(FakeDns {
            zones: vec!["Z1".into()],
            ..FakeDns::default()
        });
        let desired = json!({"zoneId": "Z1", "name": "www.example.com", "type": "CNAME", "values": ["lb.example.com"]});

        let created = adapter.create(&ctx(ResourceKind::DnsRecord), &desired).await.unwrap();
        assert_eq!(created.physical_id.as_str(), "Z1/www.example.com/CNAME");
        assert_eq!(created.outputs["fqdn"], "www.example.com");

        adapter
            .update(&ctx(ResourceKind::DnsRecord), &created.physical_id, &desired)
            .await
            .unwrap();
        let records = adapter.dns.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ttl, 300);
    }

    #[tokio::test]
    async fn dns_adapter_rejects_unknown_zone() {
        let adapter = DnsRecordAdapter::new(FakeDns::default());
        let desired = json!({"zoneId": "Z9", "name": "a.example.com", "type": "A"});
        let err = adapter.create(&ctx(ResourceKind::DnsRecord), &desired).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("Z9"));
    }

    #[tokio::test]
    async fn dns_adapter_rejects_other_kinds_and_bad_properties() {
        let adapter = DnsRecordAdapter::new(FakeDns::default());
        assert!(adapter.create(&ctx(ResourceKind::DnsZone), &json!({})).await.is_err());
        let err = adapter
            .create(&ctx(ResourceKind::DnsRecord), &json!({"name": "x"}))
            .await
            .unwrap_err();
        assert!(err.message.contains("invalid dns_record properties"));
    }

    struct TagBuilder;

    #[async_trait]
    impl ImageBuilder for TagBuilder {
        async fn build_and_push(&self, context: &BuildContext) -> ProviderResult<String> {
            Ok(format!("{}:{}", context.repository_url, context.tag))
        }
    }

    #[tokio::test]
    async fn image_adapter_publishes_image_ref() {
        let adapter = ImageAdapter::new(TagBuilder);
        let desired = json!({"path": "./src", "repositoryUrl": "registry/app", "tag": "v2"});
        let created = adapter.create(&ctx(ResourceKind::ContainerImage), &desired).await.unwrap();
        assert_eq!(created.physical_id.as_str(), "registry/app");
        assert_eq!(created.outputs["imageRef"], "registry/app:v2");
        adapter
            .delete(&ctx(ResourceKind::ContainerImage), &created.physical_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn image_rebuild_keeps_repository_identity() {
        let adapter = ImageAdapter::new(TagBuilder);
        let image = ctx(ResourceKind::ContainerImage);
        let v1 = json!({"path": "./src", "repositoryUrl": "registry/app", "tag": "v1"});
        let created = adapter.create(&image, &v1).await.unwrap();

        let v2 = json!({"path": "./src", "repositoryUrl": "registry/app", "tag": "v2"});
        let outputs = adapter.update(&image, &created.physical_id, &v2).await.unwrap();
        assert_eq!(outputs["imageRef"], "registry/app:v2");
        let current = adapter.read(&image, &created.physical_id).await.unwrap().unwrap();
        assert_eq!(current["repositoryUrl"], "registry/app");

        let moved = json!({"path": "./src", "repositoryUrl": "registry/other", "tag": "v2"});
        let err = adapter.update(&image, &created.physical_id, &moved).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("registry/other"));
    }

    #[derive(Default)]
    struct FakeLb {
        calls: Mutex<Vec<String>>,
    }

    impl FakeLb {
        fn made(&self, call: &str, spec: &Value) -> ProviderResult<Materialized> {
            self.calls.lock().unwrap().push(call.to_string());
            let name = spec["name"].as_str().unwrap_or("unnamed");
            Ok(Materialized {
                physical_id: PhysicalId::new(format!("{call}/{name}")).unwrap(),
                outputs: Outputs::from([("name".to_string(), json!(name))]),
            })
        }
    }

    #[async_trait]
    impl LoadBalancerController for FakeLb {
        async fn create_target_group(&self, spec: &Value) -> ProviderResult<Materialized> {
            self.made("tg", spec)
        }

        async fn create_listener(&self, spec: &Value) -> ProviderResult<Materialized> {
            self.made("listener", spec)
        }

        async fn create_listener_rule(&self, spec: &Value) -> ProviderResult<Materialized> {
            self.made("rule", spec)
        }

        async fn modify(&self, id: &PhysicalId, spec: &Value) -> ProviderResult<Outputs> {
            self.calls.lock().unwrap().push(format!("modify {id}"));
            Ok(Outputs::from([("name".to_string(), spec["name"].clone())]))
        }

        async fn delete(&self, id: &PhysicalId) -> ProviderResult<()> {
            self.calls.lock().unwrap().push(format!("delete {id}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn load_balancer_adapter_routes_by_kind() {
        let adapter = LoadBalancerAdapter::new(FakeLb::default());
        let spec = json!({"name": "web"});

        let tg = adapter.create(&ctx(ResourceKind::TargetGroup), &spec).await.unwrap();
        let listener = adapter.create(&ctx(ResourceKind::Listener), &spec).await.unwrap();
        let rule = adapter.create(&ctx(ResourceKind::ListenerRule), &spec).await.unwrap();
        assert_eq!(tg.physical_id.as_str(), "tg/web");
        assert_eq!(listener.physical_id.as_str(), "listener/web");
        assert_eq!(rule.physical_id.as_str(), "rule/web");

        let outputs = adapter
            .update(&ctx(ResourceKind::ListenerRule), &rule.physical_id, &json!({"name": "web-v2"}))
            .await
            .unwrap();
        assert_eq!(outputs["name"], "web-v2");
        adapter.delete(&ctx(ResourceKind::TargetGroup), &tg.physical_id).await.unwrap();

        assert_eq!(
            *adapter.controller.calls.lock().unwrap(),
            vec!["tg", "listener", "rule", "modify rule/web", "delete tg/web"]
        );
    }

    #[tokio::test]
    async fn load_balancer_adapter_rejects_other_kinds() {
        let adapter = LoadBalancerAdapter::new(FakeLb::default());
        let spec = json!({"name": "web"});

        let err = adapter.create(&ctx(ResourceKind::LoadBalancer), &spec).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("load balancer adapter"));
        let id = PhysicalId::new("lb/web").unwrap();
        assert!(adapter.update(&ctx(ResourceKind::DnsRecord), &id, &spec).await.is_err());
        assert!(adapter.controller.calls.lock().unwrap().is_empty());
    }
}
