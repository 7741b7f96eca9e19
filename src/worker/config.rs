use serde::{Deserialize, Serialize};

/// Worker engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between polls when the broker has no work.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    /// How often to send a keep-alive while idle or busy.
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: f64,
    /// Transport retries before a report is abandoned.
    #[serde(default = "default_report_retries")]
    pub report_retries: u32,
    /// Base backoff between report retries; doubles per attempt.
    #[serde(default = "default_report_backoff_secs")]
    pub report_backoff_secs: f64,
}

fn default_poll_interval_secs() -> f64 {
    0.5
}
fn default_keep_alive_interval_secs() -> f64 {
    30.0
}
fn default_report_retries() -> u32 {
    3
}
fn default_report_backoff_secs() -> f64 {
    0.5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            report_retries: default_report_retries(),
            report_backoff_secs: default_report_backoff_secs(),
        }
    }
}

/// Number of worker processes requested through the `WORKER_PROCESSES`
/// environment variable; defaults to 1.
pub fn worker_processes_from_env() -> usize {
    std::env::var("WORKER_PROCESSES")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .filter(|n| *n >= 1)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_secs, 0.5);
        assert_eq!(config.report_retries, 3);
    }

    #[test]
    fn test_partial_deserialization() {
        let config: WorkerConfig = serde_json::from_str(r#"{"report_retries": 7}"#).unwrap();
        assert_eq!(config.report_retries, 7);
        assert_eq!(config.keep_alive_interval_secs, 30.0);
    }
}
