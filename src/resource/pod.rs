use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use super::labels;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Head,
    Worker,
}

impl Role {
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Worker => "worker",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "head" => Some(Self::Head),
            "worker" => Some(Self::Worker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") | None => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            Some(_) => Self::Unknown,
        }
    }
}

/// Why a pod has not managed to start, and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartFailure {
    pub reason: String,
    pub since: DateTime<Utc>,
}

const STUCK_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

/// A live pod as seen by one reconcile pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedPod {
    pub name: String,
    pub role: Role,
    /// Worker group name; `None` for the head.
    pub group: Option<String>,
    pub phase: PodPhase,
    pub ready: bool,
    pub address: Option<String>,
    pub created: DateTime<Utc>,
    pub terminating: bool,
    pub start_failure: Option<StartFailure>,
}

impl ObservedPod {
    /// Reads a pod labeled by the controller; `None` for anything else.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let meta = &pod.metadata;
        let pod_labels = meta.labels.as_ref()?;
        let role = Role::from_label(pod_labels.get(labels::NODE_TYPE)?)?;
        let group = match role {
            Role::Head => None,
            Role::Worker => Some(pod_labels.get(labels::GROUP)?.clone()),
        };
        let created = meta
            .creation_timestamp
            .as_ref()
            .map(|time| time.0)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let status = pod.status.as_ref();
        let phase = PodPhase::parse(status.and_then(|status| status.phase.as_deref()));
        let conditions = status
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or_default();
        let ready = conditions
            .iter()
            .any(|cond| cond.type_ == "Ready" && cond.status == "True");

        let unschedulable = conditions.iter().find(|cond| {
            cond.type_ == "PodScheduled"
                && cond.status == "False"
                && cond.reason.as_deref() == Some("Unschedulable")
        });
        let start_failure = if let Some(cond) = unschedulable {
            Some(StartFailure {
                reason: cond
                    .message
                    .clone()
                    .unwrap_or_else(|| "Unschedulable".to_string()),
                since: cond
                    .last_transition_time
                    .as_ref()
                    .map(|time| time.0)
                    .unwrap_or(created),
            })
        } else {
            status
                .and_then(|status| status.container_statuses.as_deref())
                .unwrap_or_default()
                .iter()
                .filter_map(|container| container.state.as_ref()?.waiting.as_ref()?.reason.clone())
                .find(|reason| STUCK_WAITING_REASONS.contains(&reason.as_str()))
                .map(|reason| StartFailure {
                    reason,
                    since: created,
                })
        };

        Some(Self {
            name: meta.name.clone()?,
            role,
            group,
            phase,
            ready,
            address: status.and_then(|status| status.pod_ip.clone()),
            created,
            terminating: meta.deletion_timestamp.is_some(),
            start_failure,
        })
    }

    pub fn is_running_ready(&self) -> bool {
        self.phase == PodPhase::Running && self.ready
    }

    /// Ray processes never exit cleanly on their own, so a succeeded pod is dead too.
    pub fn is_dead(&self) -> bool {
        matches!(self.phase, PodPhase::Failed | PodPhase::Succeeded)
    }
}

/// Pods of one cluster, rebuilt from the platform on every pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterObservedState {
    pub pods: Vec<ObservedPod>,
    /// Whether the head routing object exists.
    pub head_service: bool,
}

impl ClusterObservedState {
    /// Pods not already being deleted.
    pub fn live(&self) -> impl Iterator<Item = &ObservedPod> {
        self.pods.iter().filter(|pod| !pod.terminating)
    }

    pub fn heads(&self) -> impl Iterator<Item = &ObservedPod> {
        self.live().filter(|pod| pod.role == Role::Head)
    }

    pub fn workers<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a ObservedPod> + 'a {
        self.live()
            .filter(move |pod| pod.role == Role::Worker && pod.group.as_deref() == Some(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(json: serde_json::Value) -> Pod {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn ready_worker_is_observed_with_group_and_address() {
        let observed = ObservedPod::from_pod(&pod(serde_json::json!({
            "metadata": {
                "name": "c-small-worker-abcde",
                "creationTimestamp": "2024-05-01T10:00:00Z",
                "labels": {"ray.io/node-type": "worker", "ray.io/group": "small"}
            },
            "status": {
                "phase": "Running",
                "podIP": "10.0.0.7",
                "conditions": [{"type": "Ready", "status": "True"}]
            }
        })))
        .unwrap();

        assert_eq!(observed.role, Role::Worker);
        assert_eq!(observed.group.as_deref(), Some("small"));
        assert!(observed.is_running_ready());
        assert_eq!(observed.address.as_deref(), Some("10.0.0.7"));
        assert!(observed.start_failure.is_none());
    }

    #[test]
    fn unschedulable_pod_records_start_failure() {
        let observed = ObservedPod::from_pod(&pod(serde_json::json!({
            "metadata": {"name": "c-head-x", "labels": {"ray.io/node-type": "head"}},
            "status": {
                "phase": "Pending",
                "conditions": [{
                    "type": "PodScheduled",
                    "status": "False",
                    "reason": "Unschedulable",
                    "message": "0/3 nodes are available",
                    "lastTransitionTime": "2024-05-01T10:00:00Z"
                }]
            }
        })))
        .unwrap();

        let failure = observed.start_failure.unwrap();
        assert_eq!(failure.reason, "0/3 nodes are available");
        assert_eq!(failure.since.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn crash_looping_container_records_start_failure() {
        let observed = ObservedPod::from_pod(&pod(serde_json::json!({
            "metadata": {"name": "c-head-x", "labels": {"ray.io/node-type": "head"}},
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "ray-head",
                    "image": "ray",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 4,
                    "state": {"waiting": {"reason": "CrashLoopBackOff"}}
                }]
            }
        })))
        .unwrap();

        assert_eq!(observed.start_failure.unwrap().reason, "CrashLoopBackOff");
    }

    #[test]
    fn unlabeled_pods_are_ignored() {
        assert!(ObservedPod::from_pod(&pod(serde_json::json!({
            "metadata": {"name": "sidecar"}
        })))
        .is_none());
    }
}
