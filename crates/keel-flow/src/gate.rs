//! Confirmation gates for resources that need external action to complete.
//!
//! Certificate issuance is the canonical example: the provider accepts the
//! request immediately, but the certificate only becomes valid once DNS
//! validation records propagate. A gate tracks that wait:
//!
//! ```text
//! ┌───────────┐ create/update ok ┌─────────────────────────────┐  confirmed  ┌───────────┐
//! │ REQUESTED │─────────────────►│ PENDING_EXTERNAL_CONFIRMATION│────────────►│ CONFIRMED │
//! └───────────┘                  └─────────────────────────────┘             └───────────┘
//!                                       │                │
//!                              deadline │                │ rejected
//!                                       ▼                ▼
//!                                 ┌───────────┐    ┌──────────┐
//!                                 │ TIMED_OUT │    │ REJECTED │
//!                                 └───────────┘    └──────────┘
//! ```
//!
//! Only `Confirmed` unblocks dependents. `TimedOut` is not retried
//! automatically; re-running apply resumes polling.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::PhysicalId;

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::provider::{Confirmation, Provider, ProviderContext};

/// Default interval between confirmation polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Default time allowed for confirmation.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(45 * 60);

/// Polling parameters of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSpec {
    /// Interval between polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Time allowed from the first poll until the gate times out.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
}

impl Default for GateSpec {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

impl GateSpec {
    /// Creates a gate spec.
    #[must_use]
    pub const fn new(poll_interval: Duration, deadline: Duration) -> Self {
        Self {
            poll_interval,
            deadline,
        }
    }

    /// Checks that polling is spaced out and fits the deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGate`] naming `owner` if the poll interval is
    /// zero or longer than the deadline.
    pub fn validate(&self, owner: &str) -> Result<()> {
        let message = if self.poll_interval.is_zero() {
            "poll interval must be positive".to_string()
        } else if self.deadline < self.poll_interval {
            format!(
                "deadline ({:?}) is shorter than the poll interval ({:?})",
                self.deadline, self.poll_interval
            )
        } else {
            return Ok(());
        };
        Err(Error::InvalidGate {
            owner: owner.to_string(),
            message,
        })
    }
}

/// Phase of a confirmation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatePhase {
    /// Creation not yet acknowledged.
    #[default]
    Requested,
    /// Waiting for external confirmation.
    PendingExternalConfirmation,
    /// Confirmed; dependents may proceed.
    Confirmed,
    /// The deadline elapsed before confirmation.
    TimedOut,
    /// The provider rejected the resource.
    Rejected,
}

impl GatePhase {
    /// Returns true if this is a terminal phase.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::TimedOut | Self::Rejected)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Requested => matches!(target, Self::PendingExternalConfirmation),
            Self::PendingExternalConfirmation => {
                matches!(target, Self::Confirmed | Self::TimedOut | Self::Rejected)
            }
            Self::Confirmed | Self::TimedOut | Self::Rejected => false,
        }
    }

    /// Returns all valid target phases from the current phase.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Requested => vec![Self::PendingExternalConfirmation],
            Self::PendingExternalConfirmation => {
                vec![Self::Confirmed, Self::TimedOut, Self::Rejected]
            }
            Self::Confirmed | Self::TimedOut | Self::Rejected => vec![],
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::PendingExternalConfirmation => "pending_external_confirmation",
            Self::Confirmed => "confirmed",
            Self::TimedOut => "timed_out",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for GatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "REQUESTED"),
            Self::PendingExternalConfirmation => write!(f, "PENDING_EXTERNAL_CONFIRMATION"),
            Self::Confirmed => write!(f, "CONFIRMED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// State of one gate instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateState {
    /// Current phase.
    pub phase: GatePhase,
    /// Number of confirmation polls made.
    pub polls: u32,
    /// Most recent poll error or rejection reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the gate times out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl GateState {
    /// Creates a gate in the `Requested` phase.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transitions to a new phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(skip(self), fields(from = %self.phase, to = %target, polls = self.polls))]
    pub fn transition_to(&mut self, target: GatePhase) -> Result<()> {
        if !self.phase.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
                reason: format!(
                    "valid transitions from {}: {:?}",
                    self.phase,
                    self.phase.valid_transitions()
                ),
            });
        }
        self.phase = target;
        Ok(())
    }
}

/// Drives a gate from `Requested` to a terminal phase.
///
/// Polls `provider` immediately and then every `spec.poll_interval` until
/// the resource is confirmed, rejected, or `spec.deadline` elapses. The
/// final poll happens at the deadline. Retryable poll errors are recorded in
/// `last_error` and polling continues; permanent poll errors reject the gate.
///
/// # Errors
///
/// Returns an error only on an internal state-machine violation.
#[tracing::instrument(
    skip(provider, ctx, physical_id, metrics),
    fields(node_id = %ctx.node_id, physical_id = %physical_id)
)]
pub async fn await_confirmation(
    provider: &dyn Provider,
    ctx: &ProviderContext,
    physical_id: &PhysicalId,
    spec: GateSpec,
    metrics: &FlowMetrics,
) -> Result<GateState> {
    let mut state = GateState::new();
    state.transition_to(GatePhase::PendingExternalConfirmation)?;
    let started = tokio::time::Instant::now();
    let deadline = started + spec.deadline;
    state.deadline = chrono::Duration::from_std(spec.deadline)
        .ok()
        .map(|d| Utc::now() + d);

    loop {
        state.polls += 1;
        match provider.poll_confirmation(ctx, physical_id).await {
            Ok(Confirmation::Confirmed) => {
                metrics.record_gate_poll("confirmed");
                state.transition_to(GatePhase::Confirmed)?;
                tracing::info!(polls = state.polls, "gate confirmed");
                return Ok(state);
            }
            Ok(Confirmation::Pending) => {
                metrics.record_gate_poll("pending");
            }
            Ok(Confirmation::Rejected(reason)) => {
                metrics.record_gate_poll("rejected");
                state.last_error = Some(reason);
                state.transition_to(GatePhase::Rejected)?;
                tracing::warn!(reason = ?state.last_error, "gate rejected");
                return Ok(state);
            }
            Err(err) if err.is_retryable() => {
                metrics.record_gate_poll("error");
                tracing::debug!(error = %err, "confirmation poll failed; continuing");
                state.last_error = Some(err.message);
            }
            Err(err) => {
                metrics.record_gate_poll("error");
                state.last_error = Some(err.message);
                state.transition_to(GatePhase::Rejected)?;
                tracing::warn!(reason = ?state.last_error, "gate rejected by permanent poll error");
                return Ok(state);
            }
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            state.transition_to(GatePhase::TimedOut)?;
            tracing::warn!(polls = state.polls, "gate timed out awaiting external confirmation");
            return Ok(state);
        }
        tokio::time::sleep(spec.poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{InMemoryProvider, ProviderError};

    #[test]
    fn phases_follow_the_state_machine() {
        assert!(GatePhase::Requested.can_transition_to(GatePhase::PendingExternalConfirmation));
        assert!(!GatePhase::Requested.can_transition_to(GatePhase::Confirmed));
        for terminal in [GatePhase::Confirmed, GatePhase::TimedOut, GatePhase::Rejected] {
            assert!(terminal.is_terminal());
            assert!(terminal.valid_transitions().is_empty());
            assert!(GatePhase::PendingExternalConfirmation.can_transition_to(terminal));
        }
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut state = GateState::new();
        let err = state.transition_to(GatePhase::Confirmed).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(state.phase, GatePhase::Requested);
    }

    #[test]
    fn gate_spec_parses_humantime() {
        let spec: GateSpec =
            serde_json::from_str(r#"{"pollInterval": "30s", "deadline": "5m"}"#).unwrap();
        assert_eq!(spec.poll_interval, Duration::from_secs(30));
        assert_eq!(spec.deadline, Duration::from_secs(300));
    }

    #[test]
    fn gate_spec_rejects_busy_polling() {
        assert!(GateSpec::default().validate("cert").is_ok());
        let zero = GateSpec::new(Duration::ZERO, Duration::from_secs(60));
        let err = zero.validate("cert").unwrap_err();
        assert!(matches!(err, Error::InvalidGate { ref owner, .. } if owner == "cert"));
        assert!(err.is_validation());
        let short = GateSpec::new(Duration::from_secs(30), Duration::from_secs(10));
        assert!(short.validate("cert").is_err());
    }

    fn cert_ctx() -> ProviderContext {
        ProviderContext::new(
            keel_core::NodeId::new("cert-validation").unwrap(),
            crate::node::ResourceKind::CertificateValidation,
            keel_core::ApplyId::generate(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn confirms_when_provider_confirms_before_deadline() {
        let provider = InMemoryProvider::new();
        let ctx = cert_ctx();
        provider.confirm_after(&ctx.node_id, 3);
        let pid = PhysicalId::new("cert-1").unwrap();
        let spec = GateSpec::new(Duration::from_secs(30), Duration::from_secs(300));

        let state = await_confirmation(&provider, &ctx, &pid, spec, &FlowMetrics::new())
            .await
            .unwrap();
        assert_eq!(state.phase, GatePhase::Confirmed);
        assert_eq!(state.polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_deadline() {
        let provider = InMemoryProvider::new();
        let ctx = cert_ctx();
        provider.never_confirm(&ctx.node_id);
        let pid = PhysicalId::new("cert-1").unwrap();
        let spec = GateSpec::new(Duration::from_secs(30), Duration::from_secs(300));

        let started = tokio::time::Instant::now();
        let state = await_confirmation(&provider, &ctx, &pid, spec, &FlowMetrics::new())
            .await
            .unwrap();
        assert_eq!(state.phase, GatePhase::TimedOut);
        assert_eq!(state.polls, 11);
        assert_eq!(started.elapsed(), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_poll_errors_are_recorded_and_polling_continues() {
        let provider = InMemoryProvider::new();
        let ctx = cert_ctx();
        provider.fail_next_poll(&ctx.node_id, ProviderError::retryable("throttled"));
        let pid = PhysicalId::new("cert-1").unwrap();

        let state = await_confirmation(&provider, &ctx, &pid, GateSpec::default(), &FlowMetrics::new())
            .await
            .unwrap();
        assert_eq!(state.phase, GatePhase::Confirmed);
        assert_eq!(state.polls, 2);
        assert_eq!(state.last_error.as_deref(), Some("throttled"));
    }

    #[tokio::test]
    async fn rejection_is_terminal() {
        let provider = InMemoryProvider::new();
        let ctx = cert_ctx();
        provider.reject(&ctx.node_id, "CAA record forbids issuance");
        let pid = PhysicalId::new("cert-1").unwrap();

        let state = await_confirmation(&provider, &ctx, &pid, GateSpec::default(), &FlowMetrics::new())
            .await
            .unwrap();
        assert_eq!(state.phase, GatePhase::Rejected);
        assert_eq!(state.last_error.as_deref(), Some("CAA record forbids issuance"));
    }

    #[test]
    fn phase_display_is_screaming_case() {
        assert_eq!(
            GatePhase::PendingExternalConfirmation.to_string(),
            "PENDING_EXTERNAL_CONFIRMATION"
        );
        assert_eq!(GatePhase::TimedOut.as_label(), "timed_out");
    }
}
