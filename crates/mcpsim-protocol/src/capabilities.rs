//! # Capability Negotiation
//!
//! A [`CapabilitySet`] maps feature names (`resources`, `prompts`, `tools`,
//! `sampling`, ...) to a structured descriptor. During the initialization
//! handshake the client's offer is intersected with the peer's set by
//! [`negotiate`]; the result is what the connection may use for its whole
//! lifetime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Well-known feature names
pub mod feature {
    /// Contextual data items
    pub const RESOURCES: &str = "resources";
    /// Interactive templates
    pub const PROMPTS: &str = "prompts";
    /// Model-actionable functions
    pub const TOOLS: &str = "tools";
    /// Server-initiated model completions
    pub const SAMPLING: &str = "sampling";
}

/// Feature name to descriptor mapping
///
/// # Examples
///
/// ```
/// use mcpsim_protocol::capabilities::{CapabilitySet, feature};
///
/// let caps = CapabilitySet::new()
///     .with(feature::TOOLS, serde_json::json!({}))
///     .with(feature::PROMPTS, serde_json::json!({"list": {}}));
///
/// assert!(caps.supports(feature::TOOLS));
/// assert!(!caps.supports(feature::SAMPLING));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    features: BTreeMap<String, Value>,
}

impl CapabilitySet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// The offer this client makes by default: every feature it can drive
    pub fn client_default() -> Self {
        Self::new()
            .with(feature::RESOURCES, Value::Object(Map::new()))
            .with(feature::PROMPTS, Value::Object(Map::new()))
            .with(feature::TOOLS, Value::Object(Map::new()))
            .with(feature::SAMPLING, Value::Object(Map::new()))
    }

    /// Add or replace a feature descriptor
    pub fn with(mut self, feature: impl Into<String>, descriptor: Value) -> Self {
        self.features.insert(feature.into(), descriptor);
        self
    }

    /// Remove a feature from the set
    pub fn without(mut self, feature: &str) -> Self {
        self.features.remove(feature);
        self
    }

    /// Whether the feature is present and enabled
    pub fn supports(&self, feature: &str) -> bool {
        self.features.get(feature).is_some_and(is_enabled)
    }

    /// Descriptor for an enabled feature
    pub fn descriptor(&self, feature: &str) -> Option<&Value> {
        self.features.get(feature).filter(|d| is_enabled(d))
    }

    /// Enabled feature names in sorted order
    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.features
            .iter()
            .filter(|(_, d)| is_enabled(d))
            .map(|(name, _)| name.as_str())
    }

    /// Number of enabled features
    pub fn len(&self) -> usize {
        self.features().count()
    }

    /// True when no feature is enabled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `false` and `null` descriptors are how a peer says "not supported".
fn is_enabled(descriptor: &Value) -> bool {
    !matches!(descriptor, Value::Null | Value::Bool(false))
}

/// Compute the effective capability set from the local offer and the peer's set
///
/// A feature is kept only when both sides enable it. Object descriptors are
/// intersected by key: an empty object means "no restrictions" and yields
/// the other side's descriptor, otherwise only keys both sides list survive
/// (carrying the peer's value). Two restricted descriptors with no key in
/// common leave nothing to use, so the feature is dropped.
pub fn negotiate(offer: &CapabilitySet, peer: &CapabilitySet) -> CapabilitySet {
    let features = offer
        .features
        .iter()
        .filter(|(_, local)| is_enabled(local))
        .filter_map(|(name, local)| {
            let remote = peer.descriptor(name)?;
            Some((name.clone(), intersect(local, remote)?))
        })
        .collect();
    CapabilitySet { features }
}

fn intersect(local: &Value, remote: &Value) -> Option<Value> {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) if l.is_empty() => Some(Value::Object(r.clone())),
        (Value::Object(l), Value::Object(r)) if r.is_empty() => Some(Value::Object(l.clone())),
        (Value::Object(l), Value::Object(r)) => {
            let common: Map<String, Value> = r
                .iter()
                .filter(|(key, _)| l.contains_key(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            (!common.is_empty()).then_some(Value::Object(common))
        }
        (Value::Bool(true), other) => Some(other.clone()),
        (_, remote) => Some(remote.clone()),
    }
}
