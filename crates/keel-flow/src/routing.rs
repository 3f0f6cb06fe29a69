//! Host-based routing rules.
//!
//! A [`RoutingTable`] is validated once, when declarations are assembled:
//! malformed patterns, out-of-range priorities and rules that overlap at the
//! same priority are configuration errors. [`RoutingTable::evaluate`] is then
//! a pure lookup returning the lowest-priority matching rule. If two rules
//! match at the winning priority anyway, evaluation fails closed.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use keel_core::NodeId;

use crate::error::{Error, Result};

/// Lowest allowed priority (evaluated first).
pub const MIN_PRIORITY: u32 = 1;
/// Highest allowed priority.
pub const MAX_PRIORITY: u32 = 50_000;

const MAX_LABEL_LEN: usize = 63;

/// A parsed host pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostPattern {
    /// Matches exactly one host.
    Exact(String),
    /// `*.domain`: matches one or more labels in front of `domain`.
    Wildcard(String),
}

impl HostPattern {
    /// Parses a pattern, normalizing case and a trailing dot.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the pattern is malformed.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let pattern = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        if pattern.is_empty() {
            return Err("empty host pattern".into());
        }
        let (wildcard, domain) = match pattern.strip_prefix("*.") {
            Some(domain) => (true, domain.to_string()),
            None => (false, pattern.clone()),
        };
        if domain.contains('*') {
            return Err(format!("'{raw}': wildcard is only allowed as the leading label"));
        }
        for label in domain.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(format!("'{raw}': invalid label '{label}'"));
            }
            if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return Err(format!("'{raw}': invalid characters in label '{label}'"));
            }
        }
        Ok(if wildcard {
            Self::Wildcard(domain)
        } else {
            Self::Exact(domain)
        })
    }

    /// Returns true if the normalized `host` matches.
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(exact) => host == exact,
            Self::Wildcard(domain) => host
                .strip_suffix(domain.as_str())
                .and_then(|prefix| prefix.strip_suffix('.'))
                .is_some_and(|prefix| !prefix.is_empty()),
        }
    }

    /// Returns true if some host matches both patterns.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Exact(host), wildcard @ Self::Wildcard(_))
            | (wildcard @ Self::Wildcard(_), Self::Exact(host)) => wildcard.matches(host),
            (Self::Wildcard(a), Self::Wildcard(b)) => {
                a == b || a.ends_with(&format!(".{b}")) || b.ends_with(&format!(".{a}"))
            }
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(host) => f.write_str(host),
            Self::Wildcard(domain) => write!(f, "*.{domain}"),
        }
    }
}

/// Normalizes a request host: trims, lowercases, drops the port and a
/// trailing dot.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// A declared routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    /// Rule identifier, usually the listener rule node ID.
    pub id: String,
    /// Lower is evaluated first.
    pub priority: u32,
    /// Exact hosts or `*.domain` wildcards.
    pub host_patterns: Vec<String>,
    /// Node that receives matching traffic.
    pub target: NodeId,
}

impl RoutingRule {
    /// Creates a rule.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        priority: u32,
        host_patterns: impl IntoIterator<Item = impl Into<String>>,
        target: NodeId,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            host_patterns: host_patterns.into_iter().map(Into::into).collect(),
            target,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: RoutingRule,
    patterns: Vec<HostPattern>,
}

/// A validated, priority-ordered set of routing rules.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rules: Vec<CompiledRule>,
}

impl RoutingTable {
    /// Validates and orders `rules`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRoutingRule`] for malformed rules and
    /// [`Error::RoutingOverlap`] for overlapping rules at the same priority.
    pub fn new(rules: Vec<RoutingRule>) -> Result<Self> {
        let table = Self::compile(rules)?;
        table.check_overlaps()?;
        Ok(table)
    }

    /// Orders `rules` without the overlap check. Evaluation still fails
    /// closed when two rules match at the same priority.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRoutingRule`] for malformed rules.
    pub fn without_overlap_check(rules: Vec<RoutingRule>) -> Result<Self> {
        Self::compile(rules)
    }

    fn compile(rules: Vec<RoutingRule>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let invalid = |message: String| Error::InvalidRoutingRule {
                rule_id: rule.id.clone(),
                message,
            };
            if rule.id.trim().is_empty() {
                return Err(invalid("rule id cannot be empty".into()));
            }
            if !seen.insert(rule.id.clone()) {
                return Err(invalid("duplicate rule id".into()));
            }
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&rule.priority) {
                return Err(invalid(format!(
                    "priority {} outside {MIN_PRIORITY}..={MAX_PRIORITY}",
                    rule.priority
                )));
            }
            if rule.host_patterns.is_empty() {
                return Err(invalid("no host patterns".into()));
            }
            let mut patterns = rule
                .host_patterns
                .iter()
                .map(|raw| HostPattern::parse(raw))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(invalid)?;
            patterns.sort();
            patterns.dedup();
            compiled.push(CompiledRule { rule, patterns });
        }
        compiled.sort_by(|a, b| {
            (a.rule.priority, &a.rule.id).cmp(&(b.rule.priority, &b.rule.id))
        });
        Ok(Self { rules: compiled })
    }

    fn check_overlaps(&self) -> Result<()> {
        for (i, first) in self.rules.iter().enumerate() {
            for second in self.rules.iter().skip(i + 1) {
                if second.rule.priority != first.rule.priority {
                    break;
                }
                for a in &first.patterns {
                    if let Some(b) = second.patterns.iter().find(|b| a.overlaps(b)) {
                        return Err(Error::RoutingOverlap {
                            priority: first.rule.priority,
                            first: first.rule.id.clone(),
                            second: second.rule.id.clone(),
                            first_pattern: a.to_string(),
                            second_pattern: b.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks that every rule targets a known node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRoutingRule`] naming the first unknown target.
    pub fn check_targets(&self, is_known: impl Fn(&NodeId) -> bool) -> Result<()> {
        match self.rules.iter().find(|c| !is_known(&c.rule.target)) {
            Some(c) => Err(Error::InvalidRoutingRule {
                rule_id: c.rule.id.clone(),
                message: format!("unknown target {}", c.rule.target),
            }),
            None => Ok(()),
        }
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &RoutingRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if there are no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the lowest-priority rule matching `host`, or `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoutingConflict`] if more than one rule matches at
    /// the winning priority.
    pub fn evaluate(&self, host: &str) -> Result<Option<&RoutingRule>> {
        let host = normalize_host(host);
        let mut matching = self
            .rules
            .iter()
            .filter(|c| c.patterns.iter().any(|p| p.matches(&host)));
        let Some(winner) = matching.next() else {
            return Ok(None);
        };
        let tied: Vec<String> = matching
            .take_while(|c| c.rule.priority == winner.rule.priority)
            .map(|c| c.rule.id.clone())
            .collect();
        if !tied.is_empty() {
            let mut rules = vec![winner.rule.id.clone()];
            rules.extend(tied);
            tracing::warn!(%host, priority = winner.rule.priority, ?rules, "ambiguous routing rejected");
            return Err(Error::RoutingConflict {
                host,
                priority: winner.rule.priority,
                rules,
            });
        }
        Ok(Some(&winner.rule))
    }
}
