use std::time::Duration;

use serde::Deserialize;

/// Tunables for the cluster topology reconciler.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterTuning {
    /// Failed pods a group may replace before the cluster is reported Failed.
    pub failure_budget: u32,
    /// How long a pod may stay unschedulable or stuck starting.
    #[serde(with = "humantime_serde")]
    pub pod_start_timeout: Duration,
    /// Requeue interval while pods are still converging.
    #[serde(with = "humantime_serde")]
    pub converging_requeue: Duration,
    /// Requeue interval for a converged cluster.
    #[serde(with = "humantime_serde")]
    pub converged_requeue: Duration,
}

impl Default for ClusterTuning {
    fn default() -> Self {
        Self {
            failure_budget: 5,
            pod_start_timeout: Duration::from_secs(300),
            converging_requeue: Duration::from_secs(2),
            converged_requeue: Duration::from_secs(60),
        }
    }
}
