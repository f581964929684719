//! Watch streams turned into resource keys for the work queue.
//!
//! Pods map to their cluster and clusters owned by a service map to the
//! service, so every change ends up at the one reconciler that writes it.

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube_client::{Api, Client};
use kube_core::{DynamicObject, Resource};
use kube_runtime::watcher;

use crate::api::{cluster_resource, service_resource};
use crate::resource::{labels, QualifiedName};
use crate::runner::{ResourceKey, ResourceKind};

pub mod objects;
pub use objects::objects;

/// A changed object and its key.
pub struct Event<Entry> {
    pub key: QualifiedName,
    pub entry: Entry,
}

fn label<'a, K: Resource>(object: &'a K, name: &str) -> Option<&'a str> {
    object.meta().labels.as_ref()?.get(name).map(String::as_str)
}

/// The reconciler responsible for a cluster: its owning service if it has one.
pub fn key_for_cluster(key: &QualifiedName, service: Option<&str>) -> ResourceKey {
    match service {
        Some(service) => ResourceKey::service(key.sibling(service)),
        None => ResourceKey::cluster(key.clone()),
    }
}

pub fn keys_for_pod(pod: &Pod) -> Option<ResourceKey> {
    let namespace = pod.meta().namespace.as_deref()?;
    let cluster = label(pod, labels::CLUSTER)?;
    Some(key_for_cluster(
        &QualifiedName::new(namespace, cluster),
        label(pod, labels::SERVICE),
    ))
}

type KeyStream = BoxStream<'static, Result<Option<ResourceKey>, watcher::Error>>;

/// Merged change stream over clusters, services and controller-labeled pods.
///
/// Pass `None` to watch every namespace.
pub fn events(
    client: Client,
    namespace: Option<&str>,
) -> impl Stream<Item = Result<ResourceKey, watcher::Error>> + Send {
    let clusters: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &cluster_resource()),
        None => Api::all_with(client.clone(), &cluster_resource()),
    };
    let services: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &service_resource()),
        None => Api::all_with(client.clone(), &service_resource()),
    };
    let pods: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let streams: Vec<KeyStream> = vec![
        objects(clusters, watcher::Config::default())
            .map_ok(|event| Some(key_for_cluster(&event.key, label(&event.entry, labels::SERVICE))))
            .boxed(),
        objects(services, watcher::Config::default())
            .map_ok(|event| Some(ResourceKey::service(event.key)))
            .boxed(),
        objects(pods, watcher::Config::default().labels(labels::CLUSTER))
            .map_ok(|event| keys_for_pod(&event.entry))
            .boxed(),
    ];

    stream::select_all(streams).try_filter_map(|key| async move { Ok(key) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(labels: serde_json::Value) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": {"name": "p", "namespace": "ml", "labels": labels}
        }))
        .unwrap()
    }

    #[test]
    fn pods_map_to_their_cluster() {
        let key = keys_for_pod(&pod(serde_json::json!({"ray.io/cluster": "c"}))).unwrap();
        assert_eq!(key, ResourceKey::cluster(QualifiedName::new("ml", "c")));
    }

    #[test]
    fn pods_of_service_clusters_map_to_the_service() {
        let key = keys_for_pod(&pod(serde_json::json!({
            "ray.io/cluster": "fruit-01234567",
            "ray.io/service": "fruit"
        })))
        .unwrap();
        assert_eq!(key, ResourceKey::service(QualifiedName::new("ml", "fruit")));
        assert_eq!(key.kind, ResourceKind::Service);
    }

    #[test]
    fn unlabeled_pods_are_ignored() {
        assert!(keys_for_pod(&pod(serde_json::json!({}))).is_none());
    }
}
