//! Shared test utilities for keel integration tests.
//!
//! This crate provides:
//! - [`TestHarness`]: a scheduler wired to in-memory provider, state and vault
//! - [`StackFactory`]: ready-made stacks (chains, diamonds, a web stack)
//! - Assertion helpers over apply reports and provider call counts
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_test_utils::{StackFactory, TestHarness, assert_all_applied};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::new();
//!     let mut stack = StackFactory::chain(&["a", "b", "c"]);
//!     let report = harness.apply(&mut stack).await;
//!     assert_all_applied(&report);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;

/// Routes engine logs to the test writer at debug level.
///
/// Later calls are no-ops; `RUST_LOG` adds further directives.
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::from_default_env()
        .add_directive("keel_flow=debug".parse().expect("valid directive"))
        .add_directive("keel_core=debug".parse().expect("valid directive"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
