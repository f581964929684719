use std::time::Duration;

use serde::Deserialize;

mod cluster;
pub use cluster::ClusterTuning;
mod upgrade;
pub use upgrade::UpgradeTuning;

/// Parameters for [`run`](crate::run) and both reconcilers.
///
/// Every field has a default, so a partial JSON document is a valid config:
///
/// ```
/// let config = kube_ray_controller::Config::from_json(r#"{"workers": 8}"#).unwrap();
/// assert_eq!(config.workers, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Number of keys reconciled concurrently.
    pub workers: usize,
    /// Deadline for one reconcile pass.
    #[serde(with = "humantime_serde")]
    pub reconcile_timeout: Duration,
    /// Deadline for a single orchestration API call.
    #[serde(with = "humantime_serde")]
    pub api_timeout: Duration,
    /// Requeue backoff for keys whose reconcile failed.
    pub backoff: Backoff,
    /// Attempts for an in-place retry of a transient API error.
    pub api_attempts: u32,
    /// Attempts for a status read-modify-write before giving up on conflicts.
    pub conflict_attempts: u32,
    pub cluster: ClusterTuning,
    pub upgrade: UpgradeTuning,
    pub dashboard: DashboardConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            reconcile_timeout: Duration::from_secs(30),
            api_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
            api_attempts: 3,
            conflict_attempts: 5,
            cluster: ClusterTuning::default(),
            upgrade: UpgradeTuning::default(),
            dashboard: DashboardConfig::default(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterTuning) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_upgrade(mut self, upgrade: UpgradeTuning) -> Self {
        self.upgrade = upgrade;
        self
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Backoff {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
        }
    }

    /// Delay before the `attempt`-th retry, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

/// How the controller talks to each cluster's dashboard.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DashboardConfig {
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            port: 8265,
            timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = Config::from_json(
            r#"{
                "workers": 2,
                "upgrade": {"stabilityPolls": 5, "drainGracePeriod": "2m"},
                "backoff": {"initial": "1s", "max": "30s"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.upgrade.stability_polls, 5);
        assert_eq!(config.upgrade.drain_grace_period, Duration::from_secs(120));
        assert_eq!(config.upgrade.pending_timeout, UpgradeTuning::default().pending_timeout);
        assert_eq!(config.backoff.initial, Duration::from_secs(1));
        assert_eq!(config.backoff.multiplier, 2.0);
        assert_eq!(config.dashboard.port, 8265);
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(500), Duration::from_secs(1));
    }
}
