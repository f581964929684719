use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};

use super::{controller_reference, QualifiedName, RayService, CLUSTER_KIND, SERVICE_KIND};
use crate::Error;

/// Declared topology of a Ray cluster.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub head_group: HeadGroupSpec,
    #[serde(default)]
    pub worker_groups: Vec<WorkerGroupSpec>,
    #[serde(default)]
    pub enable_autoscaling: bool,
    /// Address of the external state store backing head fault tolerance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_store: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadGroupSpec {
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupSpec {
    #[serde(rename = "groupName")]
    pub name: String,
    pub replicas: i32,
    #[serde(default)]
    pub min_replicas: i32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: i32,
    pub template: PodTemplateSpec,
}

fn default_max_replicas() -> i32 {
    i32::MAX
}

fn has_containers(template: &PodTemplateSpec) -> bool {
    template
        .spec
        .as_ref()
        .is_some_and(|spec| !spec.containers.is_empty())
}

impl ClusterSpec {
    pub fn group(&self, name: &str) -> Option<&WorkerGroupSpec> {
        self.worker_groups.iter().find(|group| group.name == name)
    }

    /// Rejects specs no amount of reconciling can converge.
    pub fn validate(&self) -> Result<(), Error> {
        if !has_containers(&self.head_group.template) {
            return Err(Error::validation("head group template has no containers"));
        }

        let mut seen = HashSet::new();
        for group in &self.worker_groups {
            if group.name.is_empty() {
                return Err(Error::validation("worker group name must not be empty"));
            }
            if !seen.insert(group.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate worker group name {:?}",
                    group.name
                )));
            }
            if !has_containers(&group.template) {
                return Err(Error::validation(format!(
                    "worker group {:?} template has no containers",
                    group.name
                )));
            }
            if group.min_replicas < 0 || group.replicas < 0 {
                return Err(Error::validation(format!(
                    "worker group {:?} has a negative replica count",
                    group.name
                )));
            }
            if group.min_replicas > group.max_replicas {
                return Err(Error::validation(format!(
                    "worker group {:?}: minReplicas {} exceeds maxReplicas {}",
                    group.name, group.min_replicas, group.max_replicas
                )));
            }
            if self.enable_autoscaling
                && !(group.min_replicas..=group.max_replicas).contains(&group.replicas)
            {
                return Err(Error::validation(format!(
                    "worker group {:?}: replicas {} outside [{}, {}]",
                    group.name, group.replicas, group.min_replicas, group.max_replicas
                )));
            }
        }
        Ok(())
    }
}

/// Lifecycle of a cluster's pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClusterState {
    #[default]
    Uninitialized,
    Waiting,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadInfo {
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    pub service_name: String,
}

/// Failed pods replaced in one group since it was last healthy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub count: u32,
    pub last_pod: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub state: ClusterState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub desired_workers: i32,
    #[serde(default)]
    pub ready_workers: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<HeadInfo>,
    /// Keyed by group name; the head uses [`HEAD_GROUP`](crate::cluster::HEAD_GROUP).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<String, FailureRecord>,
    /// Digest of the cluster spec the failure counters were accumulated against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
}

/// A cluster object as stored by the orchestration platform.
#[derive(Debug, Clone, PartialEq)]
pub struct RayCluster {
    pub name: QualifiedName,
    /// Assigned by the apiserver on creation.
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    /// Set when a service slot owns this cluster.
    pub owner: Option<QualifiedName>,
    pub owner_uid: Option<String>,
    pub spec: ClusterSpec,
    pub status: Option<ClusterStatus>,
}

impl RayCluster {
    pub fn new(name: QualifiedName, spec: ClusterSpec) -> Self {
        Self {
            name,
            uid: None,
            resource_version: None,
            owner: None,
            owner_uid: None,
            spec,
            status: None,
        }
    }

    pub fn owned_by(mut self, service: &RayService) -> Self {
        self.owner = Some(service.name.clone());
        self.owner_uid = service.uid.clone();
        self
    }

    /// Reference placed on this cluster's pods and head service.
    ///
    /// `None` until the cluster has been created and has a uid.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let uid = self.uid.as_deref()?;
        Some(controller_reference(CLUSTER_KIND, &self.name.name, uid))
    }

    /// The reference to the owning service, if it is known.
    pub fn service_reference(&self) -> Option<OwnerReference> {
        let (owner, uid) = (self.owner.as_ref()?, self.owner_uid.as_deref()?);
        Some(controller_reference(SERVICE_KIND, &owner.name, uid))
    }

    pub fn status(&self) -> ClusterStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn head_service(&self) -> QualifiedName {
        self.name.sibling(head_service_name(&self.name.name))
    }
}

pub fn head_service_name(cluster: &str) -> String {
    format!("{cluster}-head-svc")
}

#[cfg(test)]
pub(crate) mod fixtures {
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    use super::*;

    pub fn template(image: &str) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "ray".into(),
                    image: Some(image.into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    pub fn group(name: &str, replicas: i32, min: i32, max: i32) -> WorkerGroupSpec {
        WorkerGroupSpec {
            name: name.into(),
            replicas,
            min_replicas: min,
            max_replicas: max,
            template: template("rayproject/ray:2.9.0"),
        }
    }

    pub fn spec(groups: Vec<WorkerGroupSpec>) -> ClusterSpec {
        ClusterSpec {
            head_group: HeadGroupSpec {
                template: template("rayproject/ray:2.9.0"),
            },
            worker_groups: groups,
            enable_autoscaling: false,
            external_store: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn valid_spec_passes() {
        spec(vec![group("small", 3, 1, 5), group("gpu", 0, 0, 2)])
            .validate()
            .unwrap();
    }

    #[test]
    fn duplicate_group_names_rejected() {
        let err = spec(vec![group("small", 1, 0, 5), group("small", 2, 0, 5)])
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::SpecValidation(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn replicas_outside_bounds_rejected_only_when_autoscaling() {
        let mut cluster = spec(vec![group("small", 7, 1, 5)]);
        cluster.validate().unwrap();

        cluster.enable_autoscaling = true;
        assert!(cluster.validate().unwrap_err().is_permanent());
    }

    #[test]
    fn inverted_bounds_rejected() {
        assert!(spec(vec![group("small", 1, 4, 2)]).validate().is_err());
    }

    #[test]
    fn empty_head_template_rejected() {
        let mut cluster = spec(vec![]);
        cluster.head_group.template = PodTemplateSpec::default();
        assert!(cluster.validate().is_err());
    }

    #[test]
    fn spec_round_trips_through_crd_json() {
        let json = serde_json::json!({
            "headGroup": {
                "template": {"spec": {"containers": [{"name": "ray-head", "image": "ray"}]}}
            },
            "workerGroups": [{
                "groupName": "small",
                "replicas": 2,
                "minReplicas": 1,
                "template": {"spec": {"containers": [{"name": "ray-worker", "image": "ray"}]}}
            }],
            "enableAutoscaling": true
        });
        let cluster: ClusterSpec = serde_json::from_value(json).unwrap();
        assert_eq!(cluster.worker_groups[0].name, "small");
        assert_eq!(cluster.worker_groups[0].max_replicas, i32::MAX);
        assert!(cluster.enable_autoscaling);
        cluster.validate().unwrap();
    }
}
