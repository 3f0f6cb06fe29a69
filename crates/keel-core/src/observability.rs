//! Observability infrastructure for keel.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers, span constructors and the [`Redacted`] wrapper
//! that keeps secret material out of logs.

use std::fmt;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for CI and log shipping).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
    /// Single-line human readable logs.
    Compact,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `keel_flow=debug`)
///
/// # Example
///
/// ```rust
/// use keel_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty, "info");
/// ```
pub fn init_logging(format: LogFormat, default_directive: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry.with(tracing_fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(tracing_fmt::layer().pretty()).try_init(),
            LogFormat::Compact => registry
                .with(tracing_fmt::layer().compact().with_target(false))
                .try_init(),
        };
        // Another subscriber may already be installed (tests, embedding binaries).
        drop(result);
    });
}

/// Creates a span for a whole apply, plan, or destroy invocation.
///
/// # Example
///
/// ```rust
/// use keel_core::observability::apply_span;
///
/// let span = apply_span("apply", "01HX0000000000000000000000", "production");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn apply_span(operation: &str, apply_id: &str, stack: &str) -> Span {
    tracing::info_span!("apply", op = operation, apply_id = apply_id, stack = stack)
}

/// Creates a span for a single node operation.
#[must_use]
pub fn node_span(operation: &str, node_id: &str, kind: &str) -> Span {
    tracing::info_span!("node", op = operation, node_id = node_id, kind = kind)
}

/// Wrapper that hides its contents from `Debug`, `Display` and serialization.
///
/// Use for secret plaintext and credentials that must never reach logs,
/// reports, or snapshots. The inner value is only reachable through
/// [`Redacted::expose`].
#[derive(Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(transparent)]
pub struct Redacted<T>(T);

impl<T> Redacted<T> {
    /// Wraps a sensitive value.
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Returns a reference to the wrapped value.
    ///
    /// Callers must not log or persist the returned value.
    pub const fn expose(&self) -> &T {
        &self.0
    }

    /// Consumes the wrapper and returns the value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> Serialize for Redacted<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Compact, "info");
        init_logging(LogFormat::Json, "debug");
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = apply_span("apply", "01HX", "prod");
        let _guard = span.enter();
        let node = node_span("create", "app-lb", "load_balancer");
        let _inner = node.enter();
        tracing::info!("inside node span");
    }

    #[test]
    fn redacted_hides_value_everywhere() {
        let secret = Redacted::new("hunter2".to_string());
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(secret.to_string(), "[REDACTED]");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"[REDACTED]\"");
        assert_eq!(secret.expose(), "hunter2");
    }
}
