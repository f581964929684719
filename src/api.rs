//! The orchestration API as seen by the reconcilers.
//!
//! Every read and write the reconcilers perform goes through [`KubeApi`], so
//! the same reconcile logic runs against a live apiserver ([`KubeClientApi`])
//! or the in-memory [`MemoryApi`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

use crate::resource::{ObservedPod, QualifiedName, RayCluster, RayService, Route};
use crate::Error;

mod kube;
pub use self::kube::{cluster_resource, service_resource, KubeClientApi};
pub mod memory;
pub use memory::MemoryApi;

#[async_trait]
pub trait KubeApi: Send + Sync + 'static {
    async fn get_cluster(&self, name: &QualifiedName) -> Result<Option<RayCluster>, Error>;

    /// Fails with [`Error::Conflict`] if the name is taken.
    async fn create_cluster(&self, cluster: &RayCluster) -> Result<RayCluster, Error>;

    /// Succeeds if the cluster is already gone.
    async fn delete_cluster(&self, name: &QualifiedName) -> Result<(), Error>;

    /// Writes the status subresource, guarded by `cluster.resource_version`.
    async fn replace_cluster_status(&self, cluster: &RayCluster) -> Result<RayCluster, Error>;

    async fn get_service(&self, name: &QualifiedName) -> Result<Option<RayService>, Error>;

    /// Writes the status subresource, guarded by `service.resource_version`.
    async fn replace_service_status(&self, service: &RayService) -> Result<RayService, Error>;

    /// Pods labeled as belonging to `cluster`.
    async fn list_pods(&self, cluster: &QualifiedName) -> Result<Vec<ObservedPod>, Error>;

    /// Returns the name assigned to the new pod.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<String, Error>;

    /// Succeeds if the pod is already gone.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    async fn get_route(&self, name: &QualifiedName) -> Result<Option<Route>, Error>;

    async fn create_route(&self, route: &Route) -> Result<Route, Error>;

    /// Replaces the selector in one write, guarded by `route.resource_version`.
    async fn replace_route_selector(&self, route: &Route) -> Result<Route, Error>;

    /// Succeeds if the route is already gone.
    async fn delete_route(&self, name: &QualifiedName) -> Result<(), Error>;
}
