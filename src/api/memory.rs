//! An in-memory orchestration API.
//!
//! Objects get monotonically increasing resource versions and every mutating
//! call is appended to a journal, so callers can assert on exactly which
//! writes a reconcile pass issued and in what order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;

use super::KubeApi;
use crate::resource::{
    labels, ClusterSpec, ObservedPod, PodPhase, QualifiedName, RayCluster, RayService, Role,
    Route, ServiceSpec, StartFailure,
};
use crate::Error;

/// A mutating call recorded by [`MemoryApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    CreateCluster(QualifiedName),
    DeleteCluster(QualifiedName),
    ClusterStatus(QualifiedName),
    ServiceStatus(QualifiedName),
    CreatePod { cluster: QualifiedName, pod: String },
    DeletePod { cluster: QualifiedName, pod: String },
    CreateRoute { route: QualifiedName, cluster: String },
    UpdateRoute { route: QualifiedName, cluster: String },
    DeleteRoute(QualifiedName),
}

struct StoredPod {
    cluster: QualifiedName,
    /// Uids from the pod's owner references.
    owners: Vec<String>,
    observed: ObservedPod,
}

#[derive(Default)]
struct Store {
    version: u64,
    next_uid: u64,
    next_pod: u64,
    next_address: u32,
    clusters: BTreeMap<QualifiedName, RayCluster>,
    services: BTreeMap<QualifiedName, RayService>,
    pods: BTreeMap<(String, String), StoredPod>,
    routes: BTreeMap<QualifiedName, Route>,
    journal: Vec<Mutation>,
    failures: HashMap<&'static str, VecDeque<Error>>,
    unlistable: HashSet<QualifiedName>,
}

impl Store {
    fn bump(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }

    fn uid(&mut self) -> Option<String> {
        self.next_uid += 1;
        Some(format!("uid-{:04}", self.next_uid))
    }

    /// Removes objects whose owners are all gone, cascading through what
    /// they own in turn. Collected objects are not journaled.
    fn collect_garbage(&mut self) {
        loop {
            let live: HashSet<String> = self
                .clusters
                .values()
                .filter_map(|cluster| cluster.uid.clone())
                .chain(self.services.values().filter_map(|service| service.uid.clone()))
                .collect();
            let before = self.clusters.len() + self.pods.len() + self.routes.len();
            self.clusters
                .retain(|_, cluster| !orphaned(&live, cluster.owner_uid.as_deref()));
            self.pods
                .retain(|_, pod| !orphaned(&live, pod.owners.iter().map(String::as_str)));
            self.routes.retain(|_, route| {
                !orphaned(&live, route.owners.iter().map(|owner| owner.uid.as_str()))
            });
            if self.clusters.len() + self.pods.len() + self.routes.len() == before {
                return;
            }
        }
    }

    fn injected(&mut self, op: &'static str) -> Result<(), Error> {
        match self.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Owned by something, and by nothing that still exists.
fn orphaned<'a>(live: &HashSet<String>, owners: impl IntoIterator<Item = &'a str>) -> bool {
    let mut owners = owners.into_iter().peekable();
    owners.peek().is_some() && owners.all(|uid| !live.contains(uid))
}

fn check_version(
    stored: &Option<String>,
    given: &Option<String>,
    what: &QualifiedName,
) -> Result<(), Error> {
    if stored != given {
        return Err(Error::conflict(format!(
            "{what}: resourceVersion {given:?} does not match {stored:?}"
        )));
    }
    Ok(())
}

/// In-memory [`KubeApi`].
#[derive(Default)]
pub struct MemoryApi {
    store: Mutex<Store>,
}

impl MemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `op` (a [`KubeApi`] method name) fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: Error) {
        self.store.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Makes every pod listing for `cluster` time out.
    pub fn fail_pod_listing(&self, cluster: &QualifiedName) {
        self.store.lock().unlistable.insert(cluster.clone());
    }

    pub fn insert_cluster(&self, mut cluster: RayCluster) {
        let mut store = self.store.lock();
        if cluster.uid.is_none() {
            cluster.uid = store.uid();
        }
        cluster.resource_version = store.bump();
        store.clusters.insert(cluster.name.clone(), cluster);
    }

    pub fn insert_service(&self, mut service: RayService) {
        let mut store = self.store.lock();
        if service.uid.is_none() {
            service.uid = store.uid();
        }
        service.resource_version = store.bump();
        store.services.insert(service.name.clone(), service);
    }

    /// Simulates a user deleting a service; what it owns is collected.
    pub fn delete_service(&self, name: &QualifiedName) {
        let mut store = self.store.lock();
        store.services.remove(name);
        store.collect_garbage();
    }

    /// Simulates a user editing a service spec.
    pub fn update_service_spec(&self, name: &QualifiedName, spec: ServiceSpec) {
        let mut store = self.store.lock();
        let version = store.bump();
        if let Some(service) = store.services.get_mut(name) {
            service.spec = spec;
            service.resource_version = version;
        }
    }

    /// Simulates a user editing a cluster spec.
    pub fn update_cluster_spec(&self, name: &QualifiedName, edit: impl FnOnce(&mut ClusterSpec)) {
        let mut store = self.store.lock();
        let version = store.bump();
        if let Some(cluster) = store.clusters.get_mut(name) {
            edit(&mut cluster.spec);
            cluster.resource_version = version;
        }
    }

    pub fn cluster(&self, name: &QualifiedName) -> Option<RayCluster> {
        self.store.lock().clusters.get(name).cloned()
    }

    pub fn cluster_names(&self) -> Vec<QualifiedName> {
        self.store.lock().clusters.keys().cloned().collect()
    }

    pub fn service(&self, name: &QualifiedName) -> Option<RayService> {
        self.store.lock().services.get(name).cloned()
    }

    pub fn route(&self, name: &QualifiedName) -> Option<Route> {
        self.store.lock().routes.get(name).cloned()
    }

    pub fn pods(&self, cluster: &QualifiedName) -> Vec<ObservedPod> {
        self.store
            .lock()
            .pods
            .values()
            .filter(|stored| &stored.cluster == cluster)
            .map(|stored| stored.observed.clone())
            .collect()
    }

    /// Edit every pod of `cluster` matching `filter`.
    pub fn update_pods(
        &self,
        cluster: &QualifiedName,
        filter: impl Fn(&ObservedPod) -> bool,
        edit: impl Fn(&mut ObservedPod),
    ) {
        let mut store = self.store.lock();
        for stored in store.pods.values_mut() {
            if &stored.cluster == cluster && filter(&stored.observed) {
                edit(&mut stored.observed);
            }
        }
    }

    /// Marks every pod of `cluster` running and ready with an address.
    pub fn mark_ready(&self, cluster: &QualifiedName) {
        let mut store = self.store.lock();
        let Store {
            pods, next_address, ..
        } = &mut *store;
        for stored in pods.values_mut() {
            if &stored.cluster == cluster {
                stored.observed.phase = PodPhase::Running;
                stored.observed.ready = true;
                stored.observed.start_failure = None;
                stored.observed.address.get_or_insert_with(|| {
                    *next_address += 1;
                    format!("10.0.{}.{}", *next_address / 250, *next_address % 250 + 1)
                });
            }
        }
    }

    pub fn mark_failed(&self, cluster: &QualifiedName, pod: &str) {
        self.update_pods(cluster, |observed| observed.name == pod, |observed| {
            observed.phase = PodPhase::Failed;
            observed.ready = false;
        });
    }

    pub fn mark_unschedulable(&self, cluster: &QualifiedName, pod: &str, since: DateTime<Utc>) {
        self.update_pods(cluster, |observed| observed.name == pod, |observed| {
            observed.start_failure = Some(StartFailure {
                reason: "0/3 nodes are available: insufficient cpu".into(),
                since,
            });
        });
    }

    pub fn journal(&self) -> Vec<Mutation> {
        self.store.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.store.lock().journal.clear();
    }
}

#[async_trait]
impl KubeApi for MemoryApi {
    async fn get_cluster(&self, name: &QualifiedName) -> Result<Option<RayCluster>, Error> {
        let mut store = self.store.lock();
        store.injected("get_cluster")?;
        Ok(store.clusters.get(name).cloned())
    }

    async fn create_cluster(&self, cluster: &RayCluster) -> Result<RayCluster, Error> {
        let mut store = self.store.lock();
        store.injected("create_cluster")?;
        if store.clusters.contains_key(&cluster.name) {
            return Err(Error::conflict(format!("cluster {} already exists", cluster.name)));
        }
        let mut created = cluster.clone();
        created.uid = store.uid();
        created.resource_version = store.bump();
        store.clusters.insert(created.name.clone(), created.clone());
        store.journal.push(Mutation::CreateCluster(created.name.clone()));
        Ok(created)
    }

    async fn delete_cluster(&self, name: &QualifiedName) -> Result<(), Error> {
        let mut store = self.store.lock();
        store.injected("delete_cluster")?;
        if store.clusters.remove(name).is_some() {
            store.journal.push(Mutation::DeleteCluster(name.clone()));
            store.collect_garbage();
        }
        Ok(())
    }

    async fn replace_cluster_status(&self, cluster: &RayCluster) -> Result<RayCluster, Error> {
        let mut store = self.store.lock();
        store.injected("replace_cluster_status")?;
        let version = store.version + 1;
        let stored = store
            .clusters
            .get_mut(&cluster.name)
            .ok_or_else(|| Error::conflict(format!("cluster {} is gone", cluster.name)))?;
        check_version(&stored.resource_version, &cluster.resource_version, &cluster.name)?;
        stored.status = cluster.status.clone();
        stored.resource_version = Some(version.to_string());
        let updated = stored.clone();
        store.version = version;
        store.journal.push(Mutation::ClusterStatus(cluster.name.clone()));
        Ok(updated)
    }

    async fn get_service(&self, name: &QualifiedName) -> Result<Option<RayService>, Error> {
        let mut store = self.store.lock();
        store.injected("get_service")?;
        Ok(store.services.get(name).cloned())
    }

    async fn replace_service_status(&self, service: &RayService) -> Result<RayService, Error> {
        let mut store = self.store.lock();
        store.injected("replace_service_status")?;
        let version = store.version + 1;
        let stored = store
            .services
            .get_mut(&service.name)
            .ok_or_else(|| Error::conflict(format!("service {} is gone", service.name)))?;
        check_version(&stored.resource_version, &service.resource_version, &service.name)?;
        stored.status = service.status.clone();
        stored.resource_version = Some(version.to_string());
        let updated = stored.clone();
        store.version = version;
        store.journal.push(Mutation::ServiceStatus(service.name.clone()));
        Ok(updated)
    }

    async fn list_pods(&self, cluster: &QualifiedName) -> Result<Vec<ObservedPod>, Error> {
        {
            let mut store = self.store.lock();
            store.injected("list_pods")?;
            if store.unlistable.contains(cluster) {
                return Err(Error::transient(format!("listing pods of {cluster} timed out")));
            }
        }
        Ok(self.pods(cluster))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<String, Error> {
        let mut store = self.store.lock();
        store.injected("create_pod")?;
        let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
        let cluster = pod_labels
            .get(labels::CLUSTER)
            .ok_or_else(|| Error::validation("pod has no cluster label"))?;
        let role = match pod_labels.get(labels::NODE_TYPE).map(String::as_str) {
            Some("head") => Role::Head,
            _ => Role::Worker,
        };
        store.next_pod += 1;
        let seq = store.next_pod;
        let prefix = pod
            .metadata
            .generate_name
            .clone()
            .or_else(|| pod.metadata.name.clone())
            .unwrap_or_default();
        let name = format!("{prefix}{seq:05}");
        let cluster = QualifiedName::new(namespace, cluster.clone());
        let owners = pod
            .metadata
            .owner_references
            .iter()
            .flatten()
            .map(|owner| owner.uid.clone())
            .collect();
        let observed = ObservedPod {
            name: name.clone(),
            role,
            group: pod_labels.get(labels::GROUP).cloned().filter(|_| role == Role::Worker),
            phase: PodPhase::Pending,
            ready: false,
            address: None,
            created: Utc
                .timestamp_opt(1_700_000_000 + seq as i64, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            terminating: false,
            start_failure: None,
        };
        store.journal.push(Mutation::CreatePod {
            cluster: cluster.clone(),
            pod: name.clone(),
        });
        store.pods.insert(
            (namespace.to_string(), name.clone()),
            StoredPod {
                cluster,
                owners,
                observed,
            },
        );
        Ok(name)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut store = self.store.lock();
        store.injected("delete_pod")?;
        if let Some(stored) = store.pods.remove(&(namespace.to_string(), name.to_string())) {
            store.journal.push(Mutation::DeletePod {
                cluster: stored.cluster,
                pod: name.to_string(),
            });
        }
        Ok(())
    }

    async fn get_route(&self, name: &QualifiedName) -> Result<Option<Route>, Error> {
        let mut store = self.store.lock();
        store.injected("get_route")?;
        Ok(store.routes.get(name).cloned())
    }

    async fn create_route(&self, route: &Route) -> Result<Route, Error> {
        let mut store = self.store.lock();
        store.injected("create_route")?;
        if store.routes.contains_key(&route.name) {
            return Err(Error::conflict(format!("route {} already exists", route.name)));
        }
        let mut created = route.clone();
        created.resource_version = store.bump();
        store.routes.insert(created.name.clone(), created.clone());
        store.journal.push(Mutation::CreateRoute {
            route: route.name.clone(),
            cluster: route.target_cluster().unwrap_or_default().to_string(),
        });
        Ok(created)
    }

    async fn replace_route_selector(&self, route: &Route) -> Result<Route, Error> {
        let mut store = self.store.lock();
        store.injected("replace_route_selector")?;
        let version = store.version + 1;
        let stored = store
            .routes
            .get_mut(&route.name)
            .ok_or_else(|| Error::conflict(format!("route {} is gone", route.name)))?;
        check_version(&stored.resource_version, &route.resource_version, &route.name)?;
        stored.selector = route.selector.clone();
        stored.resource_version = Some(version.to_string());
        let updated = stored.clone();
        store.version = version;
        store.journal.push(Mutation::UpdateRoute {
            route: route.name.clone(),
            cluster: route.target_cluster().unwrap_or_default().to_string(),
        });
        Ok(updated)
    }

    async fn delete_route(&self, name: &QualifiedName) -> Result<(), Error> {
        let mut store = self.store.lock();
        store.injected("delete_route")?;
        if store.routes.remove(name).is_some() {
            store.journal.push(Mutation::DeleteRoute(name.clone()));
        }
        Ok(())
    }
}
