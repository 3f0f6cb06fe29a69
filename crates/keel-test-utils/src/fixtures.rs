//! Pre-built test fixtures for common test scenarios.
//!
//! Provides factory functions to create stacks and a harness that runs them
//! against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use keel_core::NodeId;
use keel_flow::config::EngineConfig;
use keel_flow::desired::{DesiredState, Property};
use keel_flow::gate::GateSpec;
use keel_flow::node::{ResourceKind, ResourceNode};
use keel_flow::output::interpolate;
use keel_flow::plan::Plan;
use keel_flow::provider::InMemoryProvider;
use keel_flow::provider::memory::InMemoryVault;
use keel_flow::report::{ApplyReport, DestroyReport};
use keel_flow::retry::RetryPolicy;
use keel_flow::routing::RoutingRule;
use keel_flow::scheduler::Scheduler;
use keel_flow::secrets::{SecretMaterial, SecretStore};
use keel_flow::stack::{ResourceHandle, Stack, StackConfig};
use keel_flow::state::InMemoryStateStore;

/// Shorthand for a validated node ID.
pub fn node_id(id: &str) -> NodeId {
    NodeId::new(id).expect("valid node id")
}

/// Engine configuration with short delays, suited to paused-clock tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        max_concurrency: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            jitter: Duration::ZERO,
        },
        default_gate: GateSpec::new(Duration::from_secs(1), Duration::from_secs(10)),
    }
}

/// Scheduler wired to in-memory provider, state store and vault.
///
/// The collaborators outlive individual applies, so successive applies of
/// freshly built stacks observe each other's effects.
pub struct TestHarness {
    /// Simulated provider.
    pub provider: Arc<InMemoryProvider>,
    /// Applied records.
    pub state: Arc<InMemoryStateStore>,
    /// Simulated vault.
    pub vault: Arc<InMemoryVault>,
    /// Secret store adapter over `vault`.
    pub secrets: Arc<SecretStore>,
    /// Engine configuration.
    pub config: EngineConfig,
}

impl TestHarness {
    /// Creates a harness using [`fast_config`].
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Creates a harness with a specific configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        let vault = Arc::new(InMemoryVault::new());
        Self {
            provider: Arc::new(InMemoryProvider::new()),
            state: Arc::new(InMemoryStateStore::new()),
            secrets: Arc::new(SecretStore::new(vault.clone())),
            vault,
            config,
        }
    }

    /// Builds a scheduler over the harness collaborators.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.config.clone(),
            self.provider.clone(),
            self.state.clone(),
            self.secrets.clone(),
        )
    }

    /// Plans `stack`.
    pub async fn plan(&self, stack: &mut Stack) -> Plan {
        self.scheduler().plan(stack).await.expect("plan")
    }

    /// Applies `stack` without cancellation.
    pub async fn apply(&self, stack: &mut Stack) -> ApplyReport {
        self.scheduler()
            .apply(stack, &CancellationToken::new())
            .await
            .expect("apply")
    }

    /// Destroys everything applied so far.
    pub async fn destroy(&self) -> DestroyReport {
        self.scheduler()
            .destroy(&CancellationToken::new())
            .await
            .expect("destroy")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory for creating test stacks.
pub struct StackFactory;

impl StackFactory {
    /// A chain of log groups where each node consumes the previous node's ID.
    pub fn chain(ids: &[&str]) -> Stack {
        let mut stack = Stack::new(StackConfig::new("chain"));
        let mut previous = None;
        for id in ids {
            let mut desired = DesiredState::new().with("name", *id);
            if let Some(handle) = &previous {
                desired.insert("upstream", ResourceHandle::physical_id(handle));
            }
            let handle = stack
                .add_resource(ResourceNode::new(node_id(id), ResourceKind::LogGroup).with_desired(desired))
                .expect("add resource");
            previous = Some(handle);
        }
        stack
    }

    /// `base -> left, right -> top`; `left` and `right` are independent.
    pub fn diamond() -> Stack {
        let mut stack = Stack::new(StackConfig::new("diamond"));
        let base = stack
            .add_resource(
                ResourceNode::new(node_id("base"), ResourceKind::SecurityGroup)
                    .with_desired(DesiredState::new().with("name", "base")),
            )
            .expect("base");
        let mut arms = Vec::new();
        for arm in ["left", "right"] {
            arms.push(
                stack
                    .add_resource(
                        ResourceNode::new(node_id(arm), ResourceKind::LogGroup).with_desired(
                            DesiredState::new()
                                .with("name", arm)
                                .with("securityGroup", base.physical_id()),
                        ),
                    )
                    .expect("arm"),
            );
        }
        stack
            .add_resource(
                ResourceNode::new(node_id("top"), ResourceKind::IamPolicy).with_desired(
                    DesiredState::new().with(
                        "resources",
                        Property::from(vec![arms[0].attr("arn"), arms[1].attr("arn")]),
                    ),
                ),
            )
            .expect("top");
        stack
    }

    /// A service behind a load balancer with a validated certificate, DNS
    /// alias, routing rule and database secret.
    ///
    /// `password` is the database secret's password; changing it rotates
    /// the secret.
    pub fn web(password: &str) -> Stack {
        let config = StackConfig::new("web")
            .with_tag("team", "platform")
            .with_default_gate(GateSpec::new(Duration::from_secs(1), Duration::from_secs(10)));
        let mut stack = Stack::new(config);

        let zone = add(&mut stack, "zone", ResourceKind::DnsZone, DesiredState::new().with("name", "example.com"));
        let cert = add(
            &mut stack,
            "cert",
            ResourceKind::Certificate,
            DesiredState::new()
                .with("domainName", "example.com")
                .with("subjectAlternativeNames", json!(["www.example.com"])),
        );
        let cert_dns = add(
            &mut stack,
            "cert-dns",
            ResourceKind::DnsRecord,
            DesiredState::new()
                .with("zoneId", zone.physical_id())
                .with("name", cert.attr("domainValidationOptions.0.resourceRecordName"))
                .with("type", "CNAME")
                .with(
                    "values",
                    Property::from(vec![cert.attr("domainValidationOptions.0.resourceRecordValue")]),
                ),
        );
        let validation = stack
            .add_resource(
                ResourceNode::new(node_id("cert-validation"), ResourceKind::CertificateValidation)
                    .with_desired(DesiredState::new().with("certificateArn", cert.attr("arn")))
                    .depends_on(cert_dns.id().clone()),
            )
            .expect("cert-validation");

        let lb = add(&mut stack, "app-lb", ResourceKind::LoadBalancer, DesiredState::new().with("name", "app"));
        let tg = add(
            &mut stack,
            "app-tg",
            ResourceKind::TargetGroup,
            DesiredState::new().with("port", json!(8080)).with("protocol", "HTTP"),
        );
        add(
            &mut stack,
            "https-listener",
            ResourceKind::Listener,
            DesiredState::new()
                .with("loadBalancerArn", lb.attr("arn"))
                .with("certificateArn", validation.attr("arn"))
                .with("port", json!(443))
                .with("defaultTargetGroupArn", tg.attr("arn")),
        );
        let db = stack
            .add_secret(
                node_id("db-secret"),
                "database",
                SecretMaterial::new(json!({"username": "app", "password": password})),
            )
            .expect("db-secret");
        add(
            &mut stack,
            "app-service",
            ResourceKind::ContainerService,
            DesiredState::new()
                .with("targetGroupArn", tg.attr("arn"))
                .with("secrets", Property::from(vec![Property::from(db.key("password"))]))
                .with("desiredCount", json!(2)),
        );
        let www = add(
            &mut stack,
            "www",
            ResourceKind::DnsRecord,
            DesiredState::new()
                .with("zoneId", zone.physical_id())
                .with("name", "www.example.com")
                .with("type", "CNAME")
                .with("values", Property::from(vec![lb.attr("dnsName")])),
        );

        stack.add_routing_rule(RoutingRule::new(
            "app-rule",
            100,
            ["example.com", "www.example.com"],
            tg.id().clone(),
        ));
        stack.export("url", interpolate("https://{0}/", &[www.attr("fqdn")]));
        stack.export("lbDnsName", lb.attr("dnsName"));
        stack
    }
}

fn add(
    stack: &mut Stack,
    id: &str,
    kind: ResourceKind,
    desired: DesiredState,
) -> ResourceHandle {
    stack
        .add_resource(ResourceNode::new(node_id(id), kind).with_desired(desired))
        .expect("add resource")
}

/// A literal desired state for a single-node stack.
pub fn single(id: &str, kind: ResourceKind, properties: Value) -> Stack {
    let mut stack = Stack::new(StackConfig::new("single"));
    let mut desired = DesiredState::new();
    if let Value::Object(map) = properties {
        for (key, value) in map {
            desired.insert(key, value);
        }
    }
    stack
        .add_resource(ResourceNode::new(node_id(id), kind).with_desired(desired))
        .expect("add resource");
    stack
}
