//! Connection configuration.

use std::time::Duration;

use mcpsim_protocol::CapabilitySet;
use mcpsim_protocol::types::Implementation;
use serde::{Deserialize, Serialize};

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Settings for one [`Connection`](crate::Connection)
///
/// Durations are stored in milliseconds so the struct serializes to plain
/// numbers; the accessor methods hand out [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Identity sent in `initialize`
    pub client_info: Implementation,
    /// Capabilities offered to the peer
    pub offer: CapabilitySet,
    /// Default deadline for feature invocations, `None` waits forever
    pub request_timeout_ms: Option<u64>,
    /// Deadline for the `initialize` exchange
    pub negotiation_timeout_ms: u64,
    /// Deadline for an approval verdict on one sampling request
    pub sampling_timeout_ms: Option<u64>,
    /// How often overdue requests are swept
    pub sweep_interval_ms: u64,
    /// Fail the connection on unknown or duplicate response identifiers
    pub strict_violations: bool,
    /// Recent events kept by the event sink
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::default(),
            offer: CapabilitySet::client_default(),
            request_timeout_ms: Some(30_000),
            negotiation_timeout_ms: 10_000,
            sampling_timeout_ms: Some(300_000),
            sweep_interval_ms: 250,
            strict_violations: false,
            event_buffer: 1024,
        }
    }
}

impl ConnectionConfig {
    /// Set the identity sent in `initialize`
    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = Implementation {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    /// Set the capability offer
    pub fn with_offer(mut self, offer: CapabilitySet) -> Self {
        self.offer = offer;
        self
    }

    /// Set the default request deadline (`None` disables it)
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms = timeout.map(millis);
        self
    }

    /// Set the negotiation deadline
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout_ms = millis(timeout);
        self
    }

    /// Set the approval deadline (`None` waits for the authority indefinitely)
    pub fn with_sampling_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sampling_timeout_ms = timeout.map(millis);
        self
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = millis(interval);
        self
    }

    /// Escalate identifier violations to connection failure
    pub fn with_strict_violations(mut self, strict: bool) -> Self {
        self.strict_violations = strict;
        self
    }

    /// Set how many recent events are retained
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Default request deadline
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Negotiation deadline
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Approval deadline
    pub fn sampling_timeout(&self) -> Option<Duration> {
        self.sampling_timeout_ms.map(Duration::from_millis)
    }

    /// Sweep interval, never below one millisecond
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_offer_every_client_feature() {
        let config = ConnectionConfig::default();
        assert!(config.offer.supports("sampling"));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert!(!config.strict_violations);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"request_timeout_ms": null, "sweep_interval_ms": 0}"#).unwrap();
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.sweep_interval(), Duration::from_millis(1));
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_builders() {
        let config = ConnectionConfig::default()
            .with_client_info("probe", "0.1")
            .with_request_timeout(Some(Duration::from_millis(1500)))
            .with_strict_violations(true);
        assert_eq!(config.client_info.name, "probe");
        assert_eq!(config.request_timeout_ms, Some(1500));
        assert!(config.strict_violations);
    }
}
