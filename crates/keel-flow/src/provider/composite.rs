//! Routes provider calls to per-kind adapters.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use keel_core::PhysicalId;

use super::{Confirmation, Materialized, Provider, ProviderContext, ProviderResult};
use crate::node::{Outputs, ResourceKind};

/// A [`Provider`] that dispatches on [`ProviderContext::kind`].
///
/// Kinds without a registered route go to the fallback provider.
///
/// ```rust
/// use std::sync::Arc;
/// use keel_flow::node::ResourceKind;
/// use keel_flow::provider::{CompositeProvider, InMemoryProvider};
///
/// let provider = CompositeProvider::new(Arc::new(InMemoryProvider::new()))
///     .with_route(ResourceKind::DnsRecord, Arc::new(InMemoryProvider::new()));
/// assert_eq!(provider.routed_kinds(), vec![ResourceKind::DnsRecord]);
/// ```
pub struct CompositeProvider {
    routes: BTreeMap<ResourceKind, Arc<dyn Provider>>,
    fallback: Arc<dyn Provider>,
}

impl std::fmt::Debug for CompositeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeProvider")
            .field("routes", &self.routed_kinds())
            .finish_non_exhaustive()
    }
}

impl CompositeProvider {
    /// Creates a composite that sends everything to `fallback`.
    #[must_use]
    pub fn new(fallback: Arc<dyn Provider>) -> Self {
        Self {
            routes: BTreeMap::new(),
            fallback,
        }
    }

    /// Routes `kind` to `provider`, replacing any earlier route.
    #[must_use]
    pub fn with_route(mut self, kind: ResourceKind, provider: Arc<dyn Provider>) -> Self {
        self.routes.insert(kind, provider);
        self
    }

    /// Routes every kind in `kinds` to `provider`.
    #[must_use]
    pub fn with_routes(mut self, kinds: &[ResourceKind], provider: &Arc<dyn Provider>) -> Self {
        for kind in kinds {
            self.routes.insert(*kind, Arc::clone(provider));
        }
        self
    }

    /// Kinds with a dedicated route.
    #[must_use]
    pub fn routed_kinds(&self) -> Vec<ResourceKind> {
        self.routes.keys().copied().collect()
    }

    fn route(&self, kind: ResourceKind) -> &dyn Provider {
        self.routes
            .get(&kind)
            .map_or(self.fallback.as_ref(), AsRef::as_ref)
    }
}

#[async_trait]
impl Provider for CompositeProvider {
    async fn create(&self, ctx: &ProviderContext, desired: &Value) -> ProviderResult<Materialized> {
        self.route(ctx.kind).create(ctx, desired).await
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        physical_id: &PhysicalId,
    ) -> ProviderResult<Option<Value>> {
        self.route(ctx.kind).read(ctx, physical_id).await
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        physical_id: &PhysicalId,
        desired: &Value,
    ) -> ProviderResult<Outputs> {
        self.route(ctx.kind).update(ctx, physical_id, desired).await
    }

    async fn delete(&self, ctx: &ProviderContext, physical_id: &PhysicalId) -> ProviderResult<()> {
        self.route(ctx.kind).delete(ctx, physical_id).await
    }

    async fn poll_confirmation(
        &self,
        ctx: &ProviderContext,
        physical_id: &PhysicalId,
    ) -> ProviderResult<Confirmation> {
        self.route(ctx.kind).poll_confirmation(ctx, physical_id).await
    }
}
