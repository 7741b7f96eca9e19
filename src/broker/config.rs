use serde::{Deserialize, Serialize};

/// Broker tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Lease duration for steps without a timeout policy.
    #[serde(default = "default_lease_secs")]
    pub default_lease_secs: f64,
    /// Workers silent for longer than this are pruned by the reaper.
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: f64,
    /// How often the background reaper scans leases and workers.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: f64,
}

fn default_lease_secs() -> f64 {
    60.0
}
fn default_worker_timeout_secs() -> f64 {
    300.0
}
fn default_reap_interval_secs() -> f64 {
    5.0
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_lease_secs: default_lease_secs(),
            worker_timeout_secs: default_worker_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl BrokerConfig {
    pub(crate) fn default_lease_ms(&self) -> i64 {
        (self.default_lease_secs * 1_000.0) as i64
    }

    pub(crate) fn worker_timeout_ms(&self) -> i64 {
        (self.worker_timeout_secs * 1_000.0) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.default_lease_secs, 60.0);
        assert_eq!(config.default_lease_ms(), 60_000);
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: BrokerConfig = serde_json::from_str(r#"{"default_lease_secs": 2.5}"#).unwrap();
        assert_eq!(config.default_lease_secs, 2.5);
        assert_eq!(config.worker_timeout_secs, 300.0);
    }
}
