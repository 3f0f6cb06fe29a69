//! Output futures: values that only exist once a resource is materialized.
//!
//! An [`Output`] starts `Unresolved` and settles exactly once, either to a
//! value or to an [`OutputError`]. Derived outputs are built with
//! [`Output::map`], [`Output::try_map`], [`Output::join`] and [`interpolate`];
//! a derived output fails without running its transform when any input fails.
//!
//! Every output carries its **sources**: the node IDs its value derives from.
//! The resource graph reads them to infer implicit dependency edges, so a
//! node that embeds another node's output is ordered after it without any
//! explicit declaration.
//!
//! ```rust
//! use keel_core::NodeId;
//! use keel_flow::output::{Output, OutputState, interpolate};
//! use serde_json::json;
//!
//! let lb = NodeId::new("app-lb").unwrap();
//! let dns_name = Output::produced_by(lb.clone());
//! let url = interpolate("https://{0}/health", &[dns_name.clone()]);
//!
//! assert!(url.sources().contains(&lb));
//! dns_name.resolve(json!("app-lb-123.elb.amazonaws.com"));
//! assert_eq!(
//!     url.peek(),
//!     OutputState::Resolved("https://app-lb-123.elb.amazonaws.com/health".to_string())
//! );
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use keel_core::NodeId;

/// Result of a settled output.
pub type OutputResult<T> = std::result::Result<T, OutputError>;

/// Why an output failed to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct OutputError {
    /// The node whose failure caused this error, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    /// Description of the failure.
    pub message: String,
}

impl OutputError {
    /// Creates an error without an originating node.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            node: None,
            message: message.into(),
        }
    }

    /// Creates an error attributed to `node`.
    #[must_use]
    pub fn from_node(node: NodeId, message: impl Into<String>) -> Self {
        Self {
            node: Some(node),
            message: message.into(),
        }
    }
}

/// Observable state of an output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputState<T> {
    /// Not yet settled.
    Unresolved,
    /// Settled with a value.
    Resolved(T),
    /// Settled with an error.
    Failed(OutputError),
}

impl<T> OutputState<T> {
    /// Returns true if the output has settled.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::Unresolved)
    }
}

type Subscriber<T> = Box<dyn FnOnce(&OutputResult<T>) + Send>;

struct Slot<T> {
    state: OutputState<T>,
    subscribers: Vec<Subscriber<T>>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    sources: BTreeSet<NodeId>,
}

/// A single-assignment asynchronous value.
///
/// Cloning an `Output` yields another handle to the same value.
pub struct Output<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Output")
            .field("state", &slot.state)
            .field("sources", &self.shared.sources)
            .finish()
    }
}

impl<T> Output<T>
where
    T: Clone + Send + 'static,
{
    fn with_sources(sources: BTreeSet<NodeId>) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    state: OutputState::Unresolved,
                    subscribers: Vec::new(),
                }),
                sources,
            }),
        }
    }

    /// Creates an unresolved output with no sources.
    #[must_use]
    pub fn pending() -> Self {
        Self::with_sources(BTreeSet::new())
    }

    /// Creates an unresolved output produced by `node`.
    #[must_use]
    pub fn produced_by(node: NodeId) -> Self {
        Self::with_sources(BTreeSet::from([node]))
    }

    /// Creates an output that is already resolved to `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        let output = Self::pending();
        output.resolve(value);
        output
    }

    /// Creates an output that has already failed.
    #[must_use]
    pub fn failed(error: OutputError) -> Self {
        let output = Self::pending();
        output.fail(error);
        output
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Node IDs this output derives from.
    #[must_use]
    pub fn sources(&self) -> &BTreeSet<NodeId> {
        &self.shared.sources
    }

    /// Returns true if both handles refer to the same output.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Resolves the output. Returns `false` if it had already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Fails the output. Returns `false` if it had already settled.
    pub fn fail(&self, error: OutputError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, result: OutputResult<T>) -> bool {
        let subscribers = {
            let mut slot = self.lock();
            if slot.state.is_settled() {
                return false;
            }
            slot.state = match &result {
                Ok(value) => OutputState::Resolved(value.clone()),
                Err(err) => OutputState::Failed(err.clone()),
            };
            std::mem::take(&mut slot.subscribers)
        };
        for subscriber in subscribers {
            subscriber(&result);
        }
        true
    }

    /// Registers a callback invoked exactly once when the output settles.
    ///
    /// Callbacks run in subscription order. If the output has already
    /// settled the callback runs immediately on the calling thread.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: FnOnce(&OutputResult<T>) + Send + 'static,
    {
        let mut slot = self.lock();
        let settled = match &slot.state {
            OutputState::Unresolved => None,
            OutputState::Resolved(value) => Some(Ok(value.clone())),
            OutputState::Failed(err) => Some(Err(err.clone())),
        };
        match settled {
            None => slot.subscribers.push(Box::new(callback)),
            Some(result) => {
                drop(slot);
                callback(&result);
            }
        }
    }

    /// Returns the current state without blocking.
    #[must_use]
    pub fn peek(&self) -> OutputState<T> {
        self.lock().state.clone()
    }

    /// Returns true if the output has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.lock().state.is_settled()
    }

    /// Waits until the output settles.
    ///
    /// # Errors
    ///
    /// Returns the [`OutputError`] the output failed with.
    pub async fn wait(&self) -> OutputResult<T> {
        let (tx, rx) = oneshot::channel();
        self.subscribe(move |result| {
            let _ = tx.send(result.clone());
        });
        rx.await
            .unwrap_or_else(|_| Err(OutputError::new("output dropped before settling")))
    }

    /// Derives an output by applying `transform` to the resolved value.
    ///
    /// If this output fails, the derived output fails with the same error
    /// and `transform` never runs.
    #[must_use]
    pub fn map<U, F>(&self, transform: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.try_map(move |value| Ok(transform(value)))
    }

    /// Like [`Output::map`], but `transform` may fail with a message.
    #[must_use]
    pub fn try_map<U, F>(&self, transform: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, String> + Send + 'static,
    {
        let derived = Output::with_sources(self.shared.sources.clone());
        let target = derived.clone();
        self.subscribe(move |result| match result {
            Ok(value) => match transform(value.clone()) {
                Ok(mapped) => {
                    target.resolve(mapped);
                }
                Err(message) => {
                    target.fail(OutputError::new(message));
                }
            },
            Err(err) => {
                target.fail(err.clone());
            }
        });
        derived
    }

    /// Joins outputs into one output of their values, in input order.
    ///
    /// Resolves once every input resolves and fails as soon as any input
    /// fails, with that input's error. `join(&[])` resolves immediately to
    /// an empty list. The joined output's sources are the union of the
    /// inputs' sources.
    #[must_use]
    pub fn join(inputs: &[Self]) -> Output<Vec<T>> {
        let sources = inputs
            .iter()
            .flat_map(|input| input.sources().iter().cloned())
            .collect();
        let joined = Output::with_sources(sources);
        if inputs.is_empty() {
            joined.resolve(Vec::new());
            return joined;
        }

        let collected: Arc<Mutex<(Vec<Option<T>>, usize)>> =
            Arc::new(Mutex::new((vec![None; inputs.len()], inputs.len())));
        for (position, input) in inputs.iter().enumerate() {
            let joined = joined.clone();
            let collected = Arc::clone(&collected);
            input.subscribe(move |result| match result {
                Ok(value) => {
                    let complete = {
                        let mut guard = collected.lock().unwrap_or_else(PoisonError::into_inner);
                        let (values, remaining) = &mut *guard;
                        if let Some(slot) = values.get_mut(position) {
                            if slot.is_none() {
                                *slot = Some(value.clone());
                                *remaining -= 1;
                            }
                        }
                        if *remaining == 0 {
                            Some(values.iter_mut().filter_map(Option::take).collect::<Vec<_>>())
                        } else {
                            None
                        }
                    };
                    if let Some(values) = complete {
                        joined.resolve(values);
                    }
                }
                Err(err) => {
                    joined.fail(err.clone());
                }
            });
        }
        joined
    }
}

impl Output<Value> {
    /// Wraps a literal value as a resolved output with no sources.
    #[must_use]
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::resolved(value.into())
    }
}

impl From<Output<String>> for Output<Value> {
    fn from(output: Output<String>) -> Self {
        output.map(Value::String)
    }
}

/// Builds a string from `template`, substituting `{0}`, `{1}`, ... with the
/// resolved inputs.
///
/// Implemented as a [`Output::join`] followed by a map. String values are
/// inserted verbatim, other JSON values in their compact encoding. `{{` and
/// `}}` produce literal braces. A placeholder without a matching input fails
/// the output.
#[must_use]
pub fn interpolate(template: impl Into<String>, inputs: &[Output<Value>]) -> Output<String> {
    let template = template.into();
    Output::join(inputs).try_map(move |values| render(&template, &values))
}

fn render(template: &str, values: &[Value]) -> Result<String, String> {
    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                rendered.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                rendered.push('}');
            }
            '{' => {
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        _ => return Err(format!("malformed placeholder in template '{template}'")),
                    }
                }
                let index: usize = digits
                    .parse()
                    .map_err(|_| format!("malformed placeholder in template '{template}'"))?;
                match values.get(index) {
                    Some(Value::String(s)) => rendered.push_str(s),
                    Some(other) => rendered.push_str(&other.to_string()),
                    None => return Err(format!("placeholder {{{index}}} has no input")),
                }
            }
            other => rendered.push(other),
        }
    }
    Ok(rendered)
}
