use std::time::Duration;

use serde::Deserialize;

use super::Backoff;

/// Tunables for the service lifecycle: promotion, drain and recovery timing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpgradeTuning {
    /// Consecutive healthy polls required before a pending cluster is promoted.
    pub stability_polls: u32,
    /// Minimum time the pending cluster must stay healthy before promotion.
    #[serde(with = "humantime_serde")]
    pub stability_window: Duration,
    /// Delay between the traffic swap and deletion of the old active cluster.
    #[serde(with = "humantime_serde")]
    pub drain_grace_period: Duration,
    /// How long a pending cluster has to become promotable.
    #[serde(with = "humantime_serde")]
    pub pending_timeout: Duration,
    /// Consecutive UNHEALTHY polls that abort an upgrade.
    pub unhealthy_threshold: u32,
    /// Delay before re-attempting a failed upgrade, growing per failure.
    pub retry_backoff: Backoff,
    /// Requeue interval while waiting, upgrading or recovering.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Requeue interval for a steady serving deployment.
    #[serde(with = "humantime_serde")]
    pub serving_poll_interval: Duration,
}

impl Default for UpgradeTuning {
    fn default() -> Self {
        Self {
            stability_polls: 3,
            stability_window: Duration::from_secs(10),
            drain_grace_period: Duration::from_secs(60),
            pending_timeout: Duration::from_secs(600),
            unhealthy_threshold: 3,
            retry_backoff: Backoff::new(Duration::from_secs(30), Duration::from_secs(600)),
            poll_interval: Duration::from_secs(2),
            serving_poll_interval: Duration::from_secs(10),
        }
    }
}
