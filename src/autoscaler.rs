//! Bridge between an external autoscaler and the cluster reconciler.
//!
//! The autoscaler decides how many workers each group should run and which
//! workers to give up; this module only bounds those decisions by the group's
//! declared limits.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::resource::{QualifiedName, WorkerGroupSpec};

/// A scaling decision for one worker group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleDecision {
    pub replicas: i32,
    /// Specific workers the autoscaler wants removed first.
    pub workers_to_delete: Vec<String>,
}

/// Source of externally computed scaling decisions.
pub trait ScaleSignal: Send + Sync {
    fn decision(&self, cluster: &QualifiedName, group: &str) -> Option<ScaleDecision>;

    /// Called once the named workers have been deleted.
    fn acknowledge(&self, _cluster: &QualifiedName, _group: &str, _deleted: &[String]) {}

    /// Called once the cluster is gone; its decisions no longer apply.
    fn forget(&self, _cluster: &QualifiedName) {}
}

/// A [`ScaleSignal`] the autoscaler writes into.
#[derive(Debug, Default)]
pub struct ScaleTable {
    decisions: RwLock<HashMap<(QualifiedName, String), ScaleDecision>>,
}

impl ScaleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_target(&self, cluster: &QualifiedName, group: &str, replicas: i32) {
        self.decisions
            .write()
            .entry((cluster.clone(), group.to_string()))
            .or_default()
            .replicas = replicas;
    }

    /// Scale down by removing exactly `workers`.
    pub fn scale_down(
        &self,
        cluster: &QualifiedName,
        group: &str,
        replicas: i32,
        workers: Vec<String>,
    ) {
        self.decisions.write().insert(
            (cluster.clone(), group.to_string()),
            ScaleDecision {
                replicas,
                workers_to_delete: workers,
            },
        );
    }
}

impl ScaleSignal for ScaleTable {
    fn decision(&self, cluster: &QualifiedName, group: &str) -> Option<ScaleDecision> {
        self.decisions
            .read()
            .get(&(cluster.clone(), group.to_string()))
            .cloned()
    }

    fn acknowledge(&self, cluster: &QualifiedName, group: &str, deleted: &[String]) {
        if let Some(decision) = self
            .decisions
            .write()
            .get_mut(&(cluster.clone(), group.to_string()))
        {
            decision.workers_to_delete.retain(|pod| !deleted.contains(pod));
        }
    }

    fn forget(&self, cluster: &QualifiedName) {
        self.decisions.write().retain(|(name, _), _| name != cluster);
    }
}

/// The bounded view of a group's target the reconciler acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTarget {
    pub replicas: i32,
    pub workers_to_delete: Vec<String>,
}

#[derive(Clone)]
pub struct AutoscalerBridge {
    signal: Option<Arc<dyn ScaleSignal>>,
}

impl AutoscalerBridge {
    pub fn new(signal: Arc<dyn ScaleSignal>) -> Self {
        Self {
            signal: Some(signal),
        }
    }

    /// A bridge with no autoscaler attached; groups keep their declared size.
    pub fn disabled() -> Self {
        Self { signal: None }
    }

    /// Target for `group`, with the replica count clamped to its declared bounds.
    ///
    /// Falls back to the declared replica count while the autoscaler has not
    /// published a decision for the group.
    pub fn target(&self, cluster: &QualifiedName, group: &WorkerGroupSpec) -> GroupTarget {
        let decision = self
            .signal
            .as_ref()
            .and_then(|signal| signal.decision(cluster, &group.name));
        let (replicas, workers_to_delete) = match decision {
            Some(decision) => (decision.replicas, decision.workers_to_delete),
            None => (group.replicas, Vec::new()),
        };
        let (min, max) = (group.min_replicas, group.max_replicas.max(group.min_replicas));
        GroupTarget {
            replicas: replicas.clamp(min, max),
            workers_to_delete,
        }
    }

    pub fn acknowledge(&self, cluster: &QualifiedName, group: &str, deleted: &[String]) {
        if let Some(signal) = &self.signal {
            signal.acknowledge(cluster, group, deleted);
        }
    }

    pub fn forget(&self, cluster: &QualifiedName) {
        if let Some(signal) = &self.signal {
            signal.forget(cluster);
        }
    }
}

impl Default for AutoscalerBridge {
    fn default() -> Self {
        Self::disabled()
    }
}
