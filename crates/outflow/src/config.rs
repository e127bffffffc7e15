//! Relay configuration.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::reaper::lease_cutoff;
use crate::status::WriteMode;

/// Everything the relay needs to know, passed explicitly.
///
/// Durations are stored in whole milliseconds/seconds so the struct can be
/// read from any serde format without a duration codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Broker topic every event is sent to.
    pub topic: String,
    /// Events claimed per publish cycle.
    pub batch_limit: usize,
    /// How long a claim may stay PROCESSING before the reaper releases it.
    pub lease_timeout_secs: u64,
    /// Delay between the end of one publish cycle and the start of the next.
    pub publish_interval_ms: u64,
    /// Delay between reaper sweeps.
    pub reap_interval_secs: u64,
    pub write_mode: WriteMode,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic: "outbox".to_string(),
            batch_limit: 10,
            lease_timeout_secs: 180,
            publish_interval_ms: 5_000,
            reap_interval_secs: 60,
            write_mode: WriteMode::ById,
        }
    }
}

impl RelayConfig {
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval_secs = interval.as_secs();
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.batch_limit == 0 {
            return Err(ConfigError::ZeroBatchLimit);
        }
        if self.lease_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("lease_timeout_secs"));
        }
        // The reaper subtracts the timeout from the clock on every sweep.
        if lease_cutoff(Utc::now(), self.lease_timeout()).is_err() {
            return Err(ConfigError::LeaseTimeoutOutOfRange(self.lease_timeout_secs));
        }
        if self.publish_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration("publish_interval_ms"));
        }
        if self.reap_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("reap_interval_secs"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_schedule() {
        let config = RelayConfig::default();

        assert_eq!(config.batch_limit, 10);
        assert_eq!(config.lease_timeout(), Duration::from_secs(180));
        assert_eq!(config.publish_interval(), Duration::from_secs(5));
        assert_eq!(config.reap_interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"topic":"orders","write_mode":"versioned"}"#).unwrap();

        assert_eq!(config.topic, "orders");
        assert_eq!(config.write_mode, WriteMode::Versioned);
        assert_eq!(config.batch_limit, 10);
    }

    #[test]
    fn validate_rejects_degenerate_values() {
        assert_eq!(
            RelayConfig::default().with_topic(" ").validate(),
            Err(ConfigError::EmptyTopic)
        );
        assert_eq!(
            RelayConfig::default().with_batch_limit(0).validate(),
            Err(ConfigError::ZeroBatchLimit)
        );
        assert_eq!(
            RelayConfig::default()
                .with_lease_timeout(Duration::from_millis(10))
                .validate(),
            Err(ConfigError::ZeroDuration("lease_timeout_secs"))
        );
        assert_eq!(
            RelayConfig::default()
                .with_publish_interval(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroDuration("publish_interval_ms"))
        );
    }

    #[test]
    fn validate_rejects_lease_timeout_the_reaper_cannot_apply() {
        assert_eq!(
            RelayConfig::default()
                .with_lease_timeout(Duration::from_secs(u64::MAX))
                .validate(),
            Err(ConfigError::LeaseTimeoutOutOfRange(u64::MAX))
        );
        assert!(RelayConfig::default()
            .with_lease_timeout(Duration::from_secs(30 * 24 * 60 * 60))
            .validate()
            .is_ok());
    }
}
