//! Declared and observed state of Ray clusters and services.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube_core::Resource;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod cluster;
pub use cluster::{
    ClusterSpec, ClusterState, ClusterStatus, FailureRecord, HeadGroupSpec, HeadInfo, RayCluster,
    WorkerGroupSpec,
};
pub mod pod;
pub use pod::{ClusterObservedState, ObservedPod, PodPhase, Role, StartFailure};
pub mod route;
pub use route::{Route, RoutePort, CLIENT_PORT, DASHBOARD_PORT, GCS_PORT, SERVE_PORT};
pub mod service;
pub use service::{
    AppPhase, ApplicationStatus, ClusterSlot, RayService, RetiringCluster, ServiceSpec,
    ServiceState, ServiceStatus,
};

pub const API_GROUP: &str = "ray.io";
pub const API_VERSION: &str = "v1";
pub const CLUSTER_KIND: &str = "RayCluster";
pub const SERVICE_KIND: &str = "RayService";

/// Pod and object labels.
pub mod labels {
    pub const CLUSTER: &str = "ray.io/cluster";
    pub const GROUP: &str = "ray.io/group";
    pub const NODE_TYPE: &str = "ray.io/node-type";
    pub const SERVE: &str = "ray.io/serve";
    /// Back-reference from a service-owned cluster to its service.
    pub const SERVICE: &str = "ray.io/service";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
}

pub const MANAGER_NAME: &str = "kube-ray-controller";

/// Uniquely identifies a namespaced object of a known type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    /// The object namespace
    pub namespace: String,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns `None` for cluster-scoped or unnamed objects.
    pub fn from_resource<K: Resource>(resource: &K) -> Option<Self> {
        let meta = resource.meta();
        Some(Self {
            namespace: meta.namespace.clone()?,
            name: meta.name.clone()?,
        })
    }

    /// A sibling object in the same namespace.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), name)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Controller reference from an owned object to the `ray.io` object `name`.
///
/// The apiserver garbage collects owned objects once every owner they
/// reference is gone.
pub fn controller_reference(kind: &str, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: format!("{API_GROUP}/{API_VERSION}"),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Short stable digest of a serializable value.
///
/// Sixteen hex characters keep derived object names within the 63 character
/// limit for labels.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..8]))
}
