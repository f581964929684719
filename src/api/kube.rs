use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec as K8sServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_client::api::{DeleteParams, ListParams, PostParams};
use kube_client::{Api, Client};
use kube_core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::de::DeserializeOwned;

use super::KubeApi;
use crate::resource::{
    labels, ObservedPod, QualifiedName, RayCluster, RayService, Route, RoutePort, API_GROUP,
    API_VERSION, CLUSTER_KIND, MANAGER_NAME, SERVICE_KIND,
};
use crate::{Config, Error};

/// [`KubeApi`] backed by a live apiserver.
#[derive(Clone)]
pub struct KubeClientApi {
    client: Client,
    timeout: Duration,
    clusters: ApiResource,
    services: ApiResource,
}

pub fn cluster_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(API_GROUP, API_VERSION, CLUSTER_KIND))
}

pub fn service_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(API_GROUP, API_VERSION, SERVICE_KIND))
}

impl KubeClientApi {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            timeout: config.api_timeout,
            clusters: cluster_resource(),
            services: service_resource(),
        }
    }

    fn dynamic(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn routes(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, kube_client::Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }

    /// Like [`call`](Self::call), but a 404 resolves to `None`.
    async fn call_opt<T>(
        &self,
        fut: impl Future<Output = Result<T, kube_client::Error>>,
    ) -> Result<Option<T>, Error> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(err)) if is_not_found(&err) => Ok(None),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }
}

fn is_not_found(err: &kube_client::Error) -> bool {
    matches!(err, kube_client::Error::Api(response) if response.code == 404)
}

fn field<T: DeserializeOwned>(obj: &DynamicObject, key: &str) -> Result<Option<T>, Error> {
    match obj.data.get(key) {
        Some(value) if !value.is_null() => Ok(Some(serde_json::from_value(value.clone())?)),
        _ => Ok(None),
    }
}

fn object_name(obj: &DynamicObject) -> Result<QualifiedName, Error> {
    QualifiedName::from_resource(obj)
        .ok_or_else(|| Error::validation("object has no namespace or name"))
}

fn cluster_from_object(obj: &DynamicObject) -> Result<RayCluster, Error> {
    let name = object_name(obj)?;
    let owner = obj
        .metadata
        .labels
        .as_ref()
        .and_then(|map| map.get(labels::SERVICE))
        .map(|service| name.sibling(service.clone()));
    let owner_uid = obj
        .metadata
        .owner_references
        .iter()
        .flatten()
        .find(|reference| reference.kind == SERVICE_KIND)
        .map(|reference| reference.uid.clone());
    Ok(RayCluster {
        spec: field(obj, "spec")?.ok_or_else(|| Error::validation("cluster has no spec"))?,
        status: field(obj, "status")?,
        uid: obj.metadata.uid.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        owner,
        owner_uid,
        name,
    })
}

fn cluster_to_object(
    cluster: &RayCluster,
    resource: &ApiResource,
) -> Result<DynamicObject, Error> {
    let mut obj =
        DynamicObject::new(&cluster.name.name, resource).within(&cluster.name.namespace);
    obj.metadata.uid = cluster.uid.clone();
    obj.metadata.resource_version = cluster.resource_version.clone();
    let mut object_labels = std::collections::BTreeMap::from([(
        labels::MANAGED_BY.to_string(),
        MANAGER_NAME.to_string(),
    )]);
    if let Some(owner) = &cluster.owner {
        object_labels.insert(labels::SERVICE.to_string(), owner.name.clone());
    }
    obj.metadata.labels = Some(object_labels);
    obj.metadata.owner_references = cluster.service_reference().map(|owner| vec![owner]);
    obj.data = serde_json::json!({
        "spec": serde_json::to_value(&cluster.spec)?,
        "status": serde_json::to_value(&cluster.status)?,
    });
    Ok(obj)
}

fn service_from_object(obj: &DynamicObject) -> Result<RayService, Error> {
    Ok(RayService {
        name: object_name(obj)?,
        uid: obj.metadata.uid.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        spec: field(obj, "spec")?.ok_or_else(|| Error::validation("service has no spec"))?,
        status: field(obj, "status")?,
    })
}

fn service_to_object(
    service: &RayService,
    resource: &ApiResource,
) -> Result<DynamicObject, Error> {
    let mut obj =
        DynamicObject::new(&service.name.name, resource).within(&service.name.namespace);
    obj.metadata.uid = service.uid.clone();
    obj.metadata.resource_version = service.resource_version.clone();
    obj.data = serde_json::json!({
        "spec": serde_json::to_value(&service.spec)?,
        "status": serde_json::to_value(&service.status)?,
    });
    Ok(obj)
}

fn route_from_service(svc: &Service) -> Result<Route, Error> {
    let name = QualifiedName::from_resource(svc)
        .ok_or_else(|| Error::validation("service has no namespace or name"))?;
    let spec = svc.spec.clone().unwrap_or_default();
    Ok(Route {
        name,
        resource_version: svc.metadata.resource_version.clone(),
        selector: spec.selector.unwrap_or_default(),
        ports: spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|port| RoutePort::new(port.name.unwrap_or_default(), port.port))
            .collect(),
        owners: svc.metadata.owner_references.clone().unwrap_or_default(),
    })
}

fn route_to_service(route: &Route) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(route.name.name.clone()),
            namespace: Some(route.name.namespace.clone()),
            labels: Some(
                [(labels::MANAGED_BY.to_string(), MANAGER_NAME.to_string())]
                    .into_iter()
                    .collect(),
            ),
            owner_references: (!route.owners.is_empty()).then(|| route.owners.clone()),
            ..Default::default()
        },
        spec: Some(K8sServiceSpec {
            selector: Some(route.selector.clone()),
            ports: Some(
                route
                    .ports
                    .iter()
                    .map(|port| ServicePort {
                        name: Some(port.name.clone()),
                        port: port.port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

#[async_trait]
impl KubeApi for KubeClientApi {
    async fn get_cluster(&self, name: &QualifiedName) -> Result<Option<RayCluster>, Error> {
        let api = self.dynamic(&self.clusters, &name.namespace);
        self.call_opt(api.get(&name.name))
            .await?
            .map(|obj| cluster_from_object(&obj))
            .transpose()
    }

    async fn create_cluster(&self, cluster: &RayCluster) -> Result<RayCluster, Error> {
        let api = self.dynamic(&self.clusters, &cluster.name.namespace);
        let mut obj = cluster_to_object(cluster, &self.clusters)?;
        obj.metadata.uid = None;
        obj.metadata.resource_version = None;
        let created = self.call(api.create(&PostParams::default(), &obj)).await?;
        cluster_from_object(&created)
    }

    async fn delete_cluster(&self, name: &QualifiedName) -> Result<(), Error> {
        let api = self.dynamic(&self.clusters, &name.namespace);
        self.call_opt(api.delete(&name.name, &DeleteParams::background()))
            .await
            .map(drop)
    }

    async fn replace_cluster_status(&self, cluster: &RayCluster) -> Result<RayCluster, Error> {
        let api = self.dynamic(&self.clusters, &cluster.name.namespace);
        let body = serde_json::to_vec(&cluster_to_object(cluster, &self.clusters)?)?;
        let updated = self
            .call(api.replace_status(&cluster.name.name, &PostParams::default(), body))
            .await?;
        cluster_from_object(&updated)
    }

    async fn get_service(&self, name: &QualifiedName) -> Result<Option<RayService>, Error> {
        let api = self.dynamic(&self.services, &name.namespace);
        self.call_opt(api.get(&name.name))
            .await?
            .map(|obj| service_from_object(&obj))
            .transpose()
    }

    async fn replace_service_status(&self, service: &RayService) -> Result<RayService, Error> {
        let api = self.dynamic(&self.services, &service.name.namespace);
        let body = serde_json::to_vec(&service_to_object(service, &self.services)?)?;
        let updated = self
            .call(api.replace_status(&service.name.name, &PostParams::default(), body))
            .await?;
        service_from_object(&updated)
    }

    async fn list_pods(&self, cluster: &QualifiedName) -> Result<Vec<ObservedPod>, Error> {
        let api = self.pods(&cluster.namespace);
        let params = ListParams::default().labels(&format!("{}={}", labels::CLUSTER, cluster.name));
        let pods = self.call(api.list(&params)).await?;
        Ok(pods.items.iter().filter_map(ObservedPod::from_pod).collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<String, Error> {
        let created = self
            .call(self.pods(namespace).create(&PostParams::default(), pod))
            .await?;
        created
            .metadata
            .name
            .ok_or_else(|| Error::transient("created pod has no name"))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.call_opt(self.pods(namespace).delete(name, &DeleteParams::default()))
            .await
            .map(drop)
    }

    async fn get_route(&self, name: &QualifiedName) -> Result<Option<Route>, Error> {
        self.call_opt(self.routes(&name.namespace).get(&name.name))
            .await?
            .map(|svc| route_from_service(&svc))
            .transpose()
    }

    async fn create_route(&self, route: &Route) -> Result<Route, Error> {
        let created = self
            .call(
                self.routes(&route.name.namespace)
                    .create(&PostParams::default(), &route_to_service(route)),
            )
            .await?;
        route_from_service(&created)
    }

    async fn replace_route_selector(&self, route: &Route) -> Result<Route, Error> {
        let api = self.routes(&route.name.namespace);
        let mut svc = self.call(api.get(&route.name.name)).await?;
        if svc.metadata.resource_version != route.resource_version {
            return Err(Error::conflict(format!(
                "route {} changed since it was read",
                route.name
            )));
        }
        svc.spec.get_or_insert_with(Default::default).selector = Some(route.selector.clone());
        let replaced = self
            .call(api.replace(&route.name.name, &PostParams::default(), &svc))
            .await?;
        route_from_service(&replaced)
    }

    async fn delete_route(&self, name: &QualifiedName) -> Result<(), Error> {
        self.call_opt(self.routes(&name.namespace).delete(&name.name, &DeleteParams::default()))
            .await
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::cluster::fixtures;
    use crate::resource::route::serve_selector;
    use crate::resource::{ClusterState, ClusterStatus};

    #[test]
    fn cluster_survives_dynamic_object_conversion() {
        let mut service = RayService::new(QualifiedName::new("ml", "fruit"), Default::default());
        service.uid = Some("uid-fruit".into());
        let mut cluster = RayCluster::new(
            QualifiedName::new("ml", "fruit-0123abcd"),
            fixtures::spec(vec![fixtures::group("small", 2, 0, 4)]),
        )
        .owned_by(&service);
        cluster.uid = Some("uid-cluster".into());
        cluster.resource_version = Some("42".into());
        cluster.status = Some(ClusterStatus {
            state: ClusterState::Ready,
            ..Default::default()
        });

        let obj = cluster_to_object(&cluster, &cluster_resource()).unwrap();
        assert_eq!(obj.types.as_ref().unwrap().kind, "RayCluster");
        let owners = obj.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].name, "fruit");
        assert_eq!(owners[0].uid, "uid-fruit");
        assert_eq!(cluster_from_object(&obj).unwrap(), cluster);
    }

    #[test]
    fn user_cluster_has_no_owner_references() {
        let cluster = RayCluster::new(QualifiedName::new("ml", "c"), fixtures::spec(vec![]));
        let obj = cluster_to_object(&cluster, &cluster_resource()).unwrap();
        assert!(obj.metadata.owner_references.is_none());
    }

    #[test]
    fn route_survives_service_conversion() {
        let mut service = RayService::new(QualifiedName::new("ml", "fruit"), Default::default());
        service.uid = Some("uid-fruit".into());
        let route = Route::new(
            QualifiedName::new("ml", "fruit-serve-svc"),
            serve_selector("fruit-0123abcd"),
            vec![RoutePort::new("serve", 8000)],
        )
        .owned_by(service.owner_reference());

        let svc = route_to_service(&route);
        assert_eq!(svc.metadata.owner_references.as_ref().unwrap()[0].kind, "RayService");
        assert_eq!(route_from_service(&svc).unwrap(), route);
    }

    #[test]
    fn cluster_without_spec_is_rejected() {
        let obj = DynamicObject::new("bare", &cluster_resource()).within("ml");
        assert!(cluster_from_object(&obj).unwrap_err().is_permanent());
    }
}
