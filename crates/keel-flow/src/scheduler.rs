//! The scheduler: plans, applies and tears down a stack.
//!
//! A single coordinating loop owns the [`Stack`] and dispatches node
//! operations onto the tokio runtime through a [`JoinSet`]. A node is
//! dispatched once every dependency is applied; among nodes that become
//! eligible together the smallest ID starts first. Completions re-evaluate
//! eligibility, so completion order is free while start order respects the
//! DAG.
//!
//! ## Failure handling
//!
//! - Retryable provider errors are retried inside the node's operation
//! - A failed node fails every transitive dependent by dependency, without
//!   attempting it; applied nodes are never rolled back
//! - A gate that times out leaves its dependents pending and blocked
//! - Cancellation stops dispatch; in-flight operations run to completion

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use keel_core::observability::{apply_span, node_span};
use keel_core::{ApplyId, NodeId};

use crate::config::EngineConfig;
use crate::dag::Dag;
use crate::desired::{DesiredState, Property, Resolution, ResolvedState};
use crate::error::{Error, NodeFailure, Result};
use crate::gate::{GatePhase, GateSpec, GateState, await_confirmation};
use crate::metrics::{FlowMetrics, TimingGuard};
use crate::node::{NodeAction, NodeStatus, Outputs, ResourceKind};
use crate::plan::{Fingerprints, Plan, PlanAction, PlannedChange, classify, recorded_outputs};
use crate::provider::{Materialized, Provider, ProviderContext, ProviderResult};
use crate::report::{ApplyReport, DestroyReport, NodeReport};
use crate::retry::{RetryPolicy, retry};
use crate::secrets::{SecretEntry, SecretMaterial, SecretStore};
use crate::stack::Stack;
use crate::state::{AppliedRecord, StateStore};

/// Plans, applies and destroys stacks against a provider.
pub struct Scheduler {
    config: EngineConfig,
    provider: Arc<dyn Provider>,
    state: Arc<dyn StateStore>,
    secrets: Arc<SecretStore>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn Provider>,
        state: Arc<dyn StateStore>,
        secrets: Arc<SecretStore>,
    ) -> Self {
        Self {
            config,
            provider,
            state,
            secrets,
            metrics: FlowMetrics::new(),
        }
    }

    /// Replaces the metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: FlowMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn load_records(&self) -> Result<BTreeMap<NodeId, AppliedRecord>> {
        Ok(self
            .state
            .list()
            .await?
            .into_iter()
            .map(|r| (r.node_id.clone(), r))
            .collect())
    }

    /// Computes what an apply would do, without calling the provider.
    ///
    /// Outputs of unchanged nodes are settled from their records so that
    /// dependents can be diffed too; nodes whose inputs depend on a change
    /// are reported as deferred.
    ///
    /// # Errors
    ///
    /// Returns a validation error, or an error reading the state store.
    pub async fn plan(&self, stack: &mut Stack) -> Result<Plan> {
        stack.validate()?;
        let records = self.load_records().await?;
        let order = stack.graph().topological_order()?;

        let mut changes = Vec::with_capacity(order.len());
        for id in &order {
            let graph = stack.graph();
            let node = graph.node(id).ok_or_else(|| Error::NodeNotFound {
                node_id: id.clone(),
            })?;
            let kind = node.kind();
            let dependencies = graph.dependencies_of(id)?;
            let action = match node.desired.resolve_now() {
                Resolution::Deferred(waiting_on) => PlanAction::Deferred { waiting_on },
                Resolution::Failed(err) => PlanAction::Deferred {
                    waiting_on: err.node.into_iter().collect(),
                },
                Resolution::Ready(resolved) => {
                    let digest = node.material.as_ref().map(SecretMaterial::digest).transpose()?;
                    let fingerprints = Fingerprints::compute(kind, &resolved, digest.as_deref())?;
                    classify(records.get(id), &fingerprints)
                }
            };
            if action == PlanAction::NoChange {
                if let Some(record) = records.get(id) {
                    stack
                        .graph_mut()
                        .outputs_of(id)
                        .resolve(recorded_outputs(record));
                }
            }
            changes.push(PlannedChange {
                node_id: id.clone(),
                kind,
                action,
                dependencies,
            });
        }

        let orphans: Vec<AppliedRecord> = records
            .into_values()
            .filter(|r| stack.graph().node(&r.node_id).is_none())
            .collect();
        for id in teardown_order(&orphans)? {
            if let Some(record) = orphans.iter().find(|r| r.node_id == id) {
                changes.push(PlannedChange {
                    node_id: id,
                    kind: record.kind,
                    action: PlanAction::Delete,
                    dependencies: record.dependencies.iter().cloned().collect(),
                });
            }
        }

        Ok(Plan {
            stack: stack.name().to_string(),
            changes,
            edges: stack.graph().edges(),
        })
    }

    /// Applies `stack`.
    ///
    /// Per-node failures do not make this fail; they are recorded in the
    /// returned report. Records of nodes that are no longer declared are
    /// torn down afterwards, but only when every node applied.
    ///
    /// # Errors
    ///
    /// Returns a validation error before any provider call, an error if the
    /// stack was already applied, or a state store error.
    pub async fn apply(&self, stack: &mut Stack, cancel: &CancellationToken) -> Result<ApplyReport> {
        let apply_id = ApplyId::generate();
        let span = apply_span("apply", &apply_id.to_string(), stack.name());
        self.apply_inner(stack, cancel, apply_id)
            .instrument(span)
            .await
    }

    async fn apply_inner(
        &self,
        stack: &mut Stack,
        cancel: &CancellationToken,
        apply_id: ApplyId,
    ) -> Result<ApplyReport> {
        let started_at = Utc::now();
        let started = Instant::now();

        stack.validate()?;
        if let Some(node) = stack
            .graph()
            .nodes()
            .find(|n| n.status() != NodeStatus::Pending)
        {
            return Err(Error::InvalidStateTransition {
                from: node.status().to_string(),
                to: NodeStatus::Applying.to_string(),
                reason: "stack was already applied; declare a fresh stack".into(),
            });
        }
        let order = stack.graph().topological_order()?;
        let records = self.load_records().await?;
        self.restore_secrets(&records)?;
        tracing::info!(nodes = order.len(), records = records.len(), "apply started");

        let worker = Arc::new(Worker {
            provider: Arc::clone(&self.provider),
            state: Arc::clone(&self.state),
            secrets: Arc::clone(&self.secrets),
            retry: self.config.retry,
            default_gate: self.config.default_gate,
            metrics: self.metrics.clone(),
            apply_id,
        });

        let mut upstream: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        let mut downstream: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for edge in stack.graph().edges() {
            downstream
                .entry(edge.from.clone())
                .or_default()
                .push(edge.to.clone());
            upstream.entry(edge.to).or_default().insert(edge.from);
        }
        let mut remaining: BTreeMap<NodeId, usize> =
            upstream.iter().map(|(id, deps)| (id.clone(), deps.len())).collect();
        let mut ready: BTreeSet<NodeId> = order
            .iter()
            .filter(|id| !remaining.contains_key(*id))
            .cloned()
            .collect();

        let max_concurrency = self.config.max_concurrency.max(1);
        let mut in_flight: JoinSet<NodeOutcome> = JoinSet::new();
        loop {
            while in_flight.len() < max_concurrency && !cancel.is_cancelled() {
                let Some(id) = ready.pop_first() else {
                    break;
                };
                let task = self.prepare(stack, &id, &upstream, &records)?;
                let worker = Arc::clone(&worker);
                let span = node_span("apply", id.as_str(), task.kind.as_str());
                in_flight.spawn(async move { worker.run_guarded(task).await }.instrument(span));
            }
            self.metrics.set_in_flight(in_flight.len());

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let outcome = joined.map_err(|e| {
                Error::Core(keel_core::Error::internal(format!("node task aborted: {e}")))
            })?;
            self.settle(stack, outcome, &downstream, &mut remaining, &mut ready)?;
        }
        self.metrics.set_in_flight(0);

        let cancelled = cancel.is_cancelled();
        let graph = stack.graph();
        let nodes: Vec<NodeReport> = order
            .iter()
            .filter_map(|id| graph.node(id))
            .map(NodeReport::from_node)
            .collect();
        if cancelled {
            let unattempted = nodes.iter().filter(|n| n.not_attempted()).count();
            tracing::warn!(unattempted, "apply cancelled; remaining nodes not started");
        }

        let all_applied = nodes.iter().all(|n| n.status == NodeStatus::Applied);
        let orphans: Vec<AppliedRecord> = records
            .into_values()
            .filter(|r| graph.node(&r.node_id).is_none())
            .collect();
        let orphans = if orphans.is_empty() {
            DestroyReport::default()
        } else if all_applied && !cancelled {
            tracing::info!(count = orphans.len(), "tearing down undeclared nodes");
            self.teardown(orphans, apply_id, cancel).await?
        } else {
            tracing::warn!(
                count = orphans.len(),
                "apply incomplete; leaving undeclared nodes in place"
            );
            DestroyReport::default()
        };

        let report = ApplyReport {
            apply_id,
            stack: stack.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            cancelled,
            nodes,
            orphans,
            exports: stack.resolved_exports(),
        };
        let exit_code = report.exit_code();
        let result = match exit_code {
            0 => "success",
            2 => "gate_timed_out",
            _ => "failed",
        };
        self.metrics
            .observe_apply_duration("apply", result, started.elapsed());
        tracing::info!(exit_code, counts = ?report.status_counts(), "apply finished");
        Ok(report)
    }

    fn restore_secrets(&self, records: &BTreeMap<NodeId, AppliedRecord>) -> Result<()> {
        for record in records.values().filter(|r| r.kind == ResourceKind::Secret) {
            let version = record.outputs.get("version").and_then(Value::as_u64);
            let (Some(digest), Some(version)) = (record.content_digest.clone(), version) else {
                continue;
            };
            self.secrets
                .restore(
                    record.node_id.clone(),
                    SecretEntry {
                        secret_id: record.physical_id.clone(),
                        version,
                        digest,
                    },
                )
                .map_err(|e| Error::Secret { message: e.message })?;
        }
        Ok(())
    }

    fn prepare(
        &self,
        stack: &mut Stack,
        id: &NodeId,
        upstream: &BTreeMap<NodeId, BTreeSet<NodeId>>,
        records: &BTreeMap<NodeId, AppliedRecord>,
    ) -> Result<NodeTask> {
        let graph = stack.graph_mut();
        graph.begin_apply(id)?;
        self.metrics.record_node_transition(
            NodeStatus::Pending.as_label(),
            NodeStatus::Applying.as_label(),
        );
        let node = graph.node(id).ok_or_else(|| Error::NodeNotFound {
            node_id: id.clone(),
        })?;
        Ok(NodeTask {
            id: id.clone(),
            kind: node.kind(),
            desired: node.desired.clone(),
            gate: node.gate,
            material: node.material.clone(),
            dependencies: upstream.get(id).cloned().unwrap_or_default(),
            record: records.get(id).cloned(),
        })
    }

    fn settle(
        &self,
        stack: &mut Stack,
        outcome: NodeOutcome,
        downstream: &BTreeMap<NodeId, Vec<NodeId>>,
        remaining: &mut BTreeMap<NodeId, usize>,
        ready: &mut BTreeSet<NodeId>,
    ) -> Result<()> {
        let graph = stack.graph_mut();
        let NodeOutcome {
            id,
            kind,
            attempts,
            gate_state,
            elapsed,
            result,
        } = outcome;
        if let Some(node) = graph.node_mut(&id) {
            node.attempts = attempts;
            node.gate_state = gate_state;
        }

        match result {
            Ok((materialized, action)) => {
                graph.complete(&id, materialized)?;
                if let Some(node) = graph.node_mut(&id) {
                    node.action = Some(action);
                }
                self.metrics.record_node_transition(
                    NodeStatus::Applying.as_label(),
                    NodeStatus::Applied.as_label(),
                );
                self.metrics
                    .observe_node_duration(kind.as_str(), "applied", elapsed);
                tracing::info!(node_id = %id, %action, attempts, "node applied");

                for dependent in downstream.get(&id).into_iter().flatten() {
                    let Some(count) = remaining.get_mut(dependent) else {
                        continue;
                    };
                    *count = count.saturating_sub(1);
                    let eligible = *count == 0
                        && graph.node(dependent).is_some_and(|n| {
                            n.status() == NodeStatus::Pending && n.blocked_by.is_none()
                        });
                    if eligible {
                        ready.insert(dependent.clone());
                    }
                }
            }
            Err(failure) => {
                let timed_out = matches!(failure, NodeFailure::GateTimedOut { .. });
                tracing::warn!(node_id = %id, failure = %failure, attempts, "node failed");
                self.metrics
                    .observe_node_duration(kind.as_str(), failure.as_label(), elapsed);
                graph.fail(&id, failure)?;
                self.metrics.record_node_transition(
                    NodeStatus::Applying.as_label(),
                    NodeStatus::Failed.as_label(),
                );

                if timed_out {
                    for dependent in graph.transitive_dependents(&id)? {
                        if let Some(node) = graph.node_mut(&dependent) {
                            if node.status() == NodeStatus::Pending && node.blocked_by.is_none() {
                                node.blocked_by = Some(id.clone());
                            }
                        }
                    }
                } else {
                    for dependent in graph.fail_dependents(&id)? {
                        ready.remove(&dependent);
                        self.metrics.record_node_transition(
                            NodeStatus::Pending.as_label(),
                            NodeStatus::Failed.as_label(),
                        );
                        tracing::debug!(node_id = %dependent, upstream = %id, "not attempted: dependency failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Deletes every applied record in reverse dependency order.
    ///
    /// A node is left in place (blocked) when one of its dependents could
    /// not be deleted. Cancellation skips the remaining nodes.
    ///
    /// # Errors
    ///
    /// Returns a state store error.
    pub async fn destroy(&self, cancel: &CancellationToken) -> Result<DestroyReport> {
        let apply_id = ApplyId::generate();
        let span = apply_span("destroy", &apply_id.to_string(), "");
        async {
            let metrics = self.metrics.clone();
            let _timer =
                TimingGuard::new(move |d| metrics.observe_apply_duration("destroy", "complete", d));
            let records = self.state.list().await?;
            tracing::info!(records = records.len(), "destroy started");
            let report = self.teardown(records, apply_id, cancel).await?;
            tracing::info!(
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                blocked = report.blocked.len(),
                "destroy finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn teardown(
        &self,
        records: Vec<AppliedRecord>,
        apply_id: ApplyId,
        cancel: &CancellationToken,
    ) -> Result<DestroyReport> {
        let order = teardown_order(&records)?;
        let by_id: BTreeMap<NodeId, AppliedRecord> = records
            .into_iter()
            .map(|r| (r.node_id.clone(), r))
            .collect();
        let mut dependents: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
        for record in by_id.values() {
            for dep in &record.dependencies {
                if let Some((dep_id, _)) = by_id.get_key_value(dep) {
                    dependents.entry(dep_id).or_default().push(&record.node_id);
                }
            }
        }

        let mut report = DestroyReport::default();
        for id in order {
            let Some(record) = by_id.get(&id) else {
                continue;
            };
            if cancel.is_cancelled() {
                report.skipped.push(id);
                continue;
            }
            let held = dependents
                .get(&id)
                .into_iter()
                .flatten()
                .any(|d| report.failed.contains_key(*d) || report.blocked.contains(*d));
            if held {
                tracing::warn!(node_id = %id, "left in place: a dependent was not deleted");
                report.blocked.push(id);
                continue;
            }

            let ctx = ProviderContext::new(id.clone(), record.kind, apply_id);
            let span = node_span("delete", id.as_str(), record.kind.as_str());
            match self.delete_one(&ctx, record).instrument(span).await {
                Ok(()) => {
                    self.state.remove(&id).await?;
                    tracing::info!(node_id = %id, "node deleted");
                    report.deleted.push(id);
                }
                Err(failure) => {
                    tracing::warn!(node_id = %id, failure = %failure, "delete failed");
                    report.failed.insert(id, failure);
                }
            }
        }
        Ok(report)
    }

    async fn delete_one(
        &self,
        ctx: &ProviderContext,
        record: &AppliedRecord,
    ) -> std::result::Result<(), NodeFailure> {
        let id = &ctx.node_id;
        let physical_id = &record.physical_id;
        let result = if record.kind == ResourceKind::Secret {
            let secrets = &self.secrets;
            retry(&self.config.retry, &self.metrics, "delete_secret", move |_| {
                secrets.delete_secret(id, physical_id)
            })
            .await
        } else {
            let provider = self.provider.as_ref();
            retry(&self.config.retry, &self.metrics, "delete", move |_| {
                provider.delete(ctx, physical_id)
            })
            .await
        };
        result
            .map(|_| ())
            .map_err(crate::retry::RetryFailure::into_node_failure)
    }
}

/// Reverse dependency order over a set of records.
fn teardown_order(records: &[AppliedRecord]) -> Result<Vec<NodeId>> {
    let mut dag = Dag::new();
    for record in records {
        dag.add_node(record.node_id.clone());
    }
    for record in records {
        let Some(to) = dag.get_index(&record.node_id) else {
            continue;
        };
        for dep in &record.dependencies {
            if let Some(from) = dag.get_index(dep) {
                dag.add_edge(from, to)?;
            }
        }
    }
    let mut order = dag.toposort()?;
    order.reverse();
    Ok(order)
}

struct NodeTask {
    id: NodeId,
    kind: ResourceKind,
    desired: DesiredState,
    gate: Option<GateSpec>,
    material: Option<SecretMaterial>,
    dependencies: BTreeSet<NodeId>,
    record: Option<AppliedRecord>,
}

struct NodeOutcome {
    id: NodeId,
    kind: ResourceKind,
    attempts: u32,
    gate_state: Option<GateState>,
    elapsed: std::time::Duration,
    result: std::result::Result<(Materialized, NodeAction), NodeFailure>,
}

#[derive(Default)]
struct Progress {
    attempts: u32,
    gate_state: Option<GateState>,
}

/// Everything a node operation needs, shared across spawned tasks.
struct Worker {
    provider: Arc<dyn Provider>,
    state: Arc<dyn StateStore>,
    secrets: Arc<SecretStore>,
    retry: RetryPolicy,
    default_gate: GateSpec,
    metrics: FlowMetrics,
    apply_id: ApplyId,
}

type NodeResult<T> = std::result::Result<T, NodeFailure>;

impl Worker {
    async fn run_guarded(&self, task: NodeTask) -> NodeOutcome {
        let id = task.id.clone();
        let kind = task.kind;
        let started = Instant::now();
        let mut progress = Progress::default();
        let result = AssertUnwindSafe(self.run(&task, &mut progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(NodeFailure::Provider {
                    message: "node operation panicked".into(),
                    retryable: false,
                    attempts: 0,
                    retries_exhausted: false,
                })
            });
        NodeOutcome {
            id,
            kind,
            attempts: progress.attempts,
            gate_state: progress.gate_state,
            elapsed: started.elapsed(),
            result,
        }
    }

    async fn run(
        &self,
        task: &NodeTask,
        progress: &mut Progress,
    ) -> NodeResult<(Materialized, NodeAction)> {
        let ctx = ProviderContext::new(task.id.clone(), task.kind, self.apply_id);
        // Every dependency has applied, so every reference is settled.
        let resolved = match task.desired.resolve_now() {
            Resolution::Ready(resolved) => resolved,
            Resolution::Failed(err) => {
                return Err(NodeFailure::UnresolvedInput {
                    message: err.to_string(),
                });
            }
            Resolution::Deferred(waiting_on) => {
                return Err(NodeFailure::UnresolvedInput {
                    message: format!("inputs from {waiting_on:?} are not known"),
                });
            }
        };

        let digest = match (&task.material, task.kind) {
            (Some(material), _) => Some(material.digest().map_err(|e| NodeFailure::Secret {
                message: e.to_string(),
            })?),
            (None, ResourceKind::Secret) => {
                return Err(NodeFailure::Secret {
                    message: "secret node has no material".into(),
                });
            }
            (None, _) => None,
        };
        let fingerprints = Fingerprints::compute(task.kind, &resolved, digest.as_deref())
            .map_err(|e| NodeFailure::UnresolvedInput {
                message: e.to_string(),
            })?;
        let action = classify(task.record.as_ref(), &fingerprints);
        tracing::debug!(%action, "node classified");

        let (materialized, node_action) = match (&action, &task.record) {
            (PlanAction::NoChange, Some(record)) => (from_record(record), NodeAction::Unchanged),
            (PlanAction::ResumeGate, Some(record)) => (from_record(record), NodeAction::GateResumed),
            _ if task.kind == ResourceKind::Secret => self.store_secret(&ctx, task, progress).await?,
            (PlanAction::Update { reason }, Some(record)) => {
                self.update(&ctx, record, &resolved, *reason, progress).await?
            }
            _ => (
                self.create(&ctx, &resolved, progress).await?,
                NodeAction::Created,
            ),
        };
        let materialized = materialized.with_identity();

        let gate = task
            .gate
            .or_else(|| task.kind.requires_gate().then_some(self.default_gate));
        if let Some(spec) = gate.filter(|_| node_action != NodeAction::Unchanged) {
            self.record(task, &materialized, &fingerprints, &resolved, digest.as_deref(), true)
                .await?;
            let state = await_confirmation(
                self.provider.as_ref(),
                &ctx,
                &materialized.physical_id,
                spec,
                &self.metrics,
            )
            .await
            .map_err(|e| NodeFailure::GateRejected {
                reason: e.to_string(),
            })?;
            progress.gate_state = Some(state.clone());
            match state.phase {
                GatePhase::Confirmed => {}
                GatePhase::TimedOut => {
                    return Err(NodeFailure::GateTimedOut {
                        polls: state.polls,
                        last_error: state.last_error,
                    });
                }
                _ => {
                    return Err(NodeFailure::GateRejected {
                        reason: state.last_error.unwrap_or_else(|| "rejected".into()),
                    });
                }
            }
        }

        if node_action != NodeAction::Unchanged {
            self.record(task, &materialized, &fingerprints, &resolved, digest.as_deref(), false)
                .await?;
        } else if let Some(record) = task
            .record
            .as_ref()
            .filter(|r| r.dependencies != task.dependencies)
        {
            self.relink(record, &task.dependencies).await?;
        }
        Ok((materialized, node_action))
    }

    async fn call<T, F, Fut>(&self, progress: &mut Progress, operation: &str, call: F) -> NodeResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        match retry(&self.retry, &self.metrics, operation, call).await {
            Ok((value, attempts)) => {
                progress.attempts += attempts;
                Ok(value)
            }
            Err(failure) => {
                progress.attempts += failure.attempts;
                Err(failure.into_node_failure())
            }
        }
    }

    async fn create(
        &self,
        ctx: &ProviderContext,
        resolved: &ResolvedState,
        progress: &mut Progress,
    ) -> NodeResult<Materialized> {
        let provider = self.provider.as_ref();
        let desired = &resolved.value;
        self.call(progress, "create", move |_| provider.create(ctx, desired))
            .await
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        record: &AppliedRecord,
        resolved: &ResolvedState,
        reason: crate::plan::UpdateReason,
        progress: &mut Progress,
    ) -> NodeResult<(Materialized, NodeAction)> {
        let provider = self.provider.as_ref();
        let physical_id = &record.physical_id;
        let current = self
            .call(progress, "read", move |_| provider.read(ctx, physical_id))
            .await?;
        if current.is_none() {
            tracing::warn!(%physical_id, "resource missing; creating it again");
            let materialized = self.create(ctx, resolved, progress).await?;
            return Ok((materialized, NodeAction::Created));
        }

        let desired = &resolved.value;
        let outputs = self
            .call(progress, "update", move |_| {
                provider.update(ctx, physical_id, desired)
            })
            .await?;
        Ok((
            Materialized {
                physical_id: physical_id.clone(),
                outputs,
            },
            NodeAction::Updated { reason },
        ))
    }

    async fn store_secret(
        &self,
        ctx: &ProviderContext,
        task: &NodeTask,
        progress: &mut Progress,
    ) -> NodeResult<(Materialized, NodeAction)> {
        let material = task.material.as_ref().ok_or_else(|| NodeFailure::Secret {
            message: "secret node has no material".into(),
        })?;
        let name = match task.desired.get("name") {
            Some(Property::Value(Value::String(name))) => name.clone(),
            _ => task.id.to_string(),
        };
        let secrets = &self.secrets;
        let id = &ctx.node_id;
        let secret_name = name.as_str();
        let entry = self
            .call(progress, "put_secret", move |_| {
                secrets.create_or_update_secret(id, secret_name, material)
            })
            .await?;

        let outputs = Outputs::from([
            ("arn".to_string(), json!(entry.secret_id.as_str())),
            ("name".to_string(), json!(name)),
            ("version".to_string(), json!(entry.version)),
        ]);
        let action = if task.record.is_some() {
            NodeAction::Updated {
                reason: crate::plan::UpdateReason::ConfigChanged,
            }
        } else {
            NodeAction::Created
        };
        Ok((
            Materialized {
                physical_id: entry.secret_id,
                outputs,
            },
            action,
        ))
    }

    async fn record(
        &self,
        task: &NodeTask,
        materialized: &Materialized,
        fingerprints: &Fingerprints,
        resolved: &ResolvedState,
        content_digest: Option<&str>,
        gate_pending: bool,
    ) -> NodeResult<()> {
        let record = AppliedRecord {
            node_id: task.id.clone(),
            kind: task.kind,
            physical_id: materialized.physical_id.clone(),
            fingerprint: fingerprints.full.clone(),
            config_fingerprint: fingerprints.config.clone(),
            outputs: materialized.outputs.clone(),
            secret_versions: resolved.secret_versions.clone(),
            content_digest: content_digest.map(str::to_string),
            dependencies: task.dependencies.clone(),
            gate_pending,
            applied_at: Utc::now(),
        };
        self.state
            .put(record)
            .await
            .map_err(|e| NodeFailure::State {
                message: e.to_string(),
            })
    }

    /// Rewrites the dependencies of an unchanged record; teardown order
    /// reads them.
    async fn relink(&self, record: &AppliedRecord, dependencies: &BTreeSet<NodeId>) -> NodeResult<()> {
        tracing::debug!(
            before = ?record.dependencies,
            after = ?dependencies,
            "dependencies changed; rewriting record"
        );
        let record = AppliedRecord {
            dependencies: dependencies.clone(),
            ..record.clone()
        };
        self.state
            .put(record)
            .await
            .map_err(|e| NodeFailure::State {
                message: e.to_string(),
            })
    }
}

fn from_record(record: &AppliedRecord) -> Materialized {
    Materialized {
        physical_id: record.physical_id.clone(),
        outputs: recorded_outputs(record),
    }
}
