//! Pods and routing objects built from a cluster's templates.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::resource::route::head_selector;
use crate::resource::{
    labels, RayCluster, Role, Route, RoutePort, WorkerGroupSpec, CLIENT_PORT, DASHBOARD_PORT,
    GCS_PORT, MANAGER_NAME, SERVE_PORT,
};

pub fn head_pod(cluster: &RayCluster) -> Pod {
    let mut env = vec![env_var("RAY_CLUSTER_NAME", &cluster.name.name)];
    if let Some(store) = &cluster.spec.external_store {
        env.push(env_var("RAY_REDIS_ADDRESS", store));
    }
    from_template(
        cluster,
        &cluster.spec.head_group.template,
        format!("{}-head-", cluster.name.name),
        Role::Head,
        None,
        env,
    )
}

pub fn worker_pod(cluster: &RayCluster, group: &WorkerGroupSpec) -> Pod {
    let gcs = format!(
        "{}.{}.svc.cluster.local:{GCS_PORT}",
        cluster.head_service().name,
        cluster.name.namespace
    );
    from_template(
        cluster,
        &group.template,
        format!("{}-{}-worker-", cluster.name.name, group.name),
        Role::Worker,
        Some(group.name.as_str()),
        vec![
            env_var("RAY_CLUSTER_NAME", &cluster.name.name),
            env_var("RAY_ADDRESS", &gcs),
        ],
    )
}

/// The routing object in front of the head pod.
pub fn head_route(cluster: &RayCluster) -> Route {
    Route::new(
        cluster.head_service(),
        head_selector(&cluster.name.name),
        vec![
            RoutePort::new("gcs", GCS_PORT),
            RoutePort::new("dashboard", DASHBOARD_PORT),
            RoutePort::new("client", CLIENT_PORT),
            RoutePort::new("serve", SERVE_PORT),
        ],
    )
    .owned_by(cluster.owner_reference())
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn from_template(
    cluster: &RayCluster,
    template: &PodTemplateSpec,
    generate_name: String,
    role: Role,
    group: Option<&str>,
    env: Vec<EnvVar>,
) -> Pod {
    let template_meta = template.metadata.clone().unwrap_or_default();

    let mut pod_labels: BTreeMap<String, String> = template_meta.labels.unwrap_or_default();
    pod_labels.insert(labels::CLUSTER.to_string(), cluster.name.name.clone());
    pod_labels.insert(labels::NODE_TYPE.to_string(), role.as_label().to_string());
    pod_labels.insert(
        labels::GROUP.to_string(),
        group.unwrap_or(super::HEAD_GROUP).to_string(),
    );
    pod_labels.insert(labels::SERVE.to_string(), "true".to_string());
    pod_labels.insert(labels::MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    if let Some(owner) = &cluster.owner {
        pod_labels.insert(labels::SERVICE.to_string(), owner.name.clone());
    }

    let mut spec = template.spec.clone().unwrap_or_default();
    // The Ray container is the first one by convention.
    if let Some(container) = spec.containers.first_mut() {
        let container_env = container.env.get_or_insert_with(Vec::new);
        for var in env {
            container_env.retain(|existing| existing.name != var.name);
            container_env.push(var);
        }
    }

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(generate_name),
            namespace: Some(cluster.name.namespace.clone()),
            labels: Some(pod_labels),
            annotations: template_meta.annotations,
            owner_references: cluster.owner_reference().map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::cluster::fixtures::{group, spec};
    use crate::resource::{ObservedPod, QualifiedName, RayService};

    fn cluster() -> RayCluster {
        RayCluster::new(QualifiedName::new("ml", "c"), spec(vec![group("small", 1, 0, 4)]))
    }

    fn env(pod: &Pod) -> BTreeMap<String, String> {
        pod.spec.as_ref().unwrap().containers[0]
            .env
            .iter()
            .flatten()
            .map(|var| (var.name.clone(), var.value.clone().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn worker_pod_is_labeled_and_points_at_gcs() {
        let cluster = cluster();
        let pod = worker_pod(&cluster, &cluster.spec.worker_groups[0]);

        assert_eq!(pod.metadata.generate_name.as_deref(), Some("c-small-worker-"));
        let pod_labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(pod_labels[labels::CLUSTER], "c");
        assert_eq!(pod_labels[labels::GROUP], "small");
        assert_eq!(pod_labels[labels::NODE_TYPE], "worker");
        assert_eq!(env(&pod)["RAY_ADDRESS"], "c-head-svc.ml.svc.cluster.local:6379");
    }

    #[test]
    fn head_pod_gets_store_address_only_with_external_store() {
        let mut cluster = cluster();
        assert!(!env(&head_pod(&cluster)).contains_key("RAY_REDIS_ADDRESS"));

        cluster.spec.external_store = Some("redis:6379".into());
        let pod = head_pod(&cluster);
        assert_eq!(env(&pod)["RAY_REDIS_ADDRESS"], "redis:6379");
        assert_eq!(pod.metadata.generate_name.as_deref(), Some("c-head-"));
    }

    #[test]
    fn built_pods_are_observable() {
        let cluster = cluster();
        let mut pod = head_pod(&cluster);
        pod.metadata.name = Some("c-head-abcde".into());
        let observed = ObservedPod::from_pod(&pod).unwrap();
        assert_eq!(observed.role, Role::Head);
        assert!(observed.group.is_none());
    }

    #[test]
    fn service_owned_pods_carry_the_service_label() {
        let service = RayService::new(QualifiedName::new("ml", "fruit"), Default::default());
        let cluster = cluster().owned_by(&service);
        let pod = worker_pod(&cluster, &cluster.spec.worker_groups[0]);
        assert_eq!(pod.metadata.labels.unwrap()[labels::SERVICE], "fruit");
    }

    #[test]
    fn pods_and_head_route_are_owned_by_the_created_cluster() {
        let mut cluster = cluster();
        assert!(head_pod(&cluster).metadata.owner_references.is_none());

        cluster.uid = Some("uid-c".into());
        let pod = worker_pod(&cluster, &cluster.spec.worker_groups[0]);
        let owners = pod.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "RayCluster");
        assert_eq!(owners[0].uid, "uid-c");

        let route = head_route(&cluster);
        assert_eq!(route.owners, owners);
    }

    #[test]
    fn head_route_selects_head_pod() {
        let route = head_route(&cluster());
        assert_eq!(route.name.name, "c-head-svc");
        assert_eq!(route.selector[labels::NODE_TYPE], "head");
        assert_eq!(route.ports.len(), 4);
    }
}
