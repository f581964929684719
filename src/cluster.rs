//! The cluster topology reconciler.
//!
//! Each pass reads the cluster declaration and its pods, diffs them in
//! [`plan`], issues the resulting pod and routing-object mutations and writes
//! the new status back only when it changed.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::KubeApi;
use crate::autoscaler::{AutoscalerBridge, GroupTarget};
use crate::clock::Clock;
use crate::config::Config;
use crate::resource::cluster::head_service_name;
use crate::resource::{ClusterObservedState, ClusterState, ClusterStatus, QualifiedName, RayCluster};
use crate::retry::{retry_on_conflict, retry_with_backoff};
use crate::runner::Action;
use crate::Error;

mod plan;
pub use plan::{plan, record_rejections, DeleteReason, Plan, PlanInput, PodAction, Rejection};
mod pod;
pub use pod::{head_pod, head_route, worker_pod};

/// Failure-counter key of the head pod.
pub const HEAD_GROUP: &str = "head";

pub struct ClusterController<A> {
    api: Arc<A>,
    bridge: AutoscalerBridge,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl<A: KubeApi> ClusterController<A> {
    pub fn new(
        api: Arc<A>,
        bridge: AutoscalerBridge,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            api,
            bridge,
            clock,
            config,
        }
    }

    /// Reconciles a user-owned cluster.
    ///
    /// Clusters owned by a service are driven by that service's controller
    /// and are skipped here.
    pub async fn reconcile(&self, key: &QualifiedName) -> Result<Action, Error> {
        let Some(cluster) = self.api.get_cluster(key).await? else {
            // Pods and the head service are collected through their owner references.
            log::debug!("cluster {key} is gone");
            self.bridge.forget(key);
            return Ok(Action::AwaitChange);
        };
        if let Some(owner) = &cluster.owner {
            log::debug!("cluster {key} is owned by service {owner}");
            return Ok(Action::AwaitChange);
        }

        let (status, rejections) = self.sync_pass(&cluster).await?;
        match rejections.into_iter().next() {
            Some(rejection) => Err(rejection.into_error()),
            None => Ok(self.requeue_for(&status)),
        }
    }

    pub fn requeue_for(&self, status: &ClusterStatus) -> Action {
        let tuning = &self.config.cluster;
        match status.state {
            ClusterState::Ready | ClusterState::Failed => Action::Requeue(tuning.converged_requeue),
            ClusterState::Uninitialized | ClusterState::Waiting => {
                Action::Requeue(tuning.converging_requeue)
            }
        }
    }

    /// Runs one convergence pass over `cluster` and returns its new status.
    ///
    /// An invalid spec is recorded in the status reasons and returned as
    /// [`Error::SpecValidation`] without touching any pod. Mutations the API
    /// refuses are recorded in the returned status rather than returned.
    pub async fn sync(&self, cluster: &RayCluster) -> Result<ClusterStatus, Error> {
        let (status, _) = self.sync_pass(cluster).await?;
        Ok(status)
    }

    async fn sync_pass(
        &self,
        cluster: &RayCluster,
    ) -> Result<(ClusterStatus, Vec<Rejection>), Error> {
        let prior = cluster.status();
        let now = self.clock.now();
        let observed = self.observe(cluster).await?;
        let targets = self.targets(cluster);
        let planned = plan(&PlanInput {
            cluster: &cluster.name,
            spec: &cluster.spec,
            observed: &observed,
            prior: &prior,
            targets: &targets,
            tuning: &self.config.cluster,
            now,
        });

        let planned = match planned {
            Ok(planned) => planned,
            Err(err) if err.is_permanent() => {
                log::warn!("cluster {} rejected: {err}", cluster.name);
                let mut status = prior;
                status.reasons = vec![err.to_string()];
                self.write_status(cluster, &status).await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let rejections = self.apply(cluster, &planned).await;
        let mut status = planned.status;
        record_rejections(&mut status, &rejections, &self.config.cluster, now);
        if status.state != prior.state {
            log::info!(
                "cluster {} is now {:?} ({}/{} workers ready)",
                cluster.name,
                status.state,
                status.ready_workers,
                status.desired_workers
            );
        }
        self.write_status(cluster, &status).await?;
        Ok((status, rejections))
    }

    /// Deletes everything belonging to `name`: pods first, then the head
    /// routing object, then the cluster object itself.
    pub async fn teardown(&self, name: &QualifiedName) -> Result<(), Error> {
        let api = self.api.as_ref();
        let backoff = &self.config.backoff;
        let attempts = self.config.api_attempts;

        let pods =
            retry_with_backoff(backoff, attempts, "list_pods", || api.list_pods(name)).await?;
        for pod in pods.iter().filter(|pod| !pod.terminating) {
            retry_with_backoff(backoff, attempts, "delete_pod", || {
                api.delete_pod(&name.namespace, &pod.name)
            })
            .await?;
        }

        let head_service = name.sibling(head_service_name(&name.name));
        retry_with_backoff(backoff, attempts, "delete_route", || {
            api.delete_route(&head_service)
        })
        .await?;
        retry_with_backoff(backoff, attempts, "delete_cluster", || api.delete_cluster(name)).await?;
        self.bridge.forget(name);
        log::info!("tore down cluster {name} ({} pods)", pods.len());
        Ok(())
    }

    async fn observe(&self, cluster: &RayCluster) -> Result<ClusterObservedState, Error> {
        let api = self.api.as_ref();
        let backoff = &self.config.backoff;
        let attempts = self.config.api_attempts;
        let head_service = cluster.head_service();

        let pods = retry_with_backoff(backoff, attempts, "list_pods", || {
            api.list_pods(&cluster.name)
        })
        .await?;
        let route = retry_with_backoff(backoff, attempts, "get_route", || {
            api.get_route(&head_service)
        })
        .await?;
        Ok(ClusterObservedState {
            pods,
            head_service: route.is_some(),
        })
    }

    fn targets(&self, cluster: &RayCluster) -> BTreeMap<String, GroupTarget> {
        cluster
            .spec
            .worker_groups
            .iter()
            .map(|group| {
                let target = if cluster.spec.enable_autoscaling {
                    self.bridge.target(&cluster.name, group)
                } else {
                    GroupTarget {
                        replicas: group.replicas,
                        workers_to_delete: Vec::new(),
                    }
                };
                (group.name.clone(), target)
            })
            .collect()
    }

    /// Issues the planned mutations, each retried on transient errors.
    ///
    /// A refused mutation does not stop the rest of the plan.
    async fn apply(&self, cluster: &RayCluster, planned: &Plan) -> Vec<Rejection> {
        let mut rejections = Vec::new();
        for action in &planned.actions {
            if let Err(error) = self.apply_one(cluster, action).await {
                log::warn!("cluster {}: {action:?} failed: {error}", cluster.name);
                rejections.push(Rejection {
                    action: action.clone(),
                    error,
                });
            }
        }

        for (group, deleted) in &planned.acknowledged {
            self.bridge.acknowledge(&cluster.name, group, deleted);
        }
        rejections
    }

    async fn apply_one(&self, cluster: &RayCluster, action: &PodAction) -> Result<(), Error> {
        let api = self.api.as_ref();
        let backoff = &self.config.backoff;
        let attempts = self.config.api_attempts;
        let namespace = cluster.name.namespace.as_str();

        match action {
            PodAction::CreateHead => {
                let pod = head_pod(cluster);
                let name = retry_with_backoff(backoff, attempts, "create_pod", || {
                    api.create_pod(namespace, &pod)
                })
                .await?;
                log::info!("cluster {}: created head pod {name}", cluster.name);
            }
            PodAction::CreateWorker { group } => {
                let Some(spec) = cluster.spec.group(group) else {
                    return Ok(());
                };
                let pod = worker_pod(cluster, spec);
                let name = retry_with_backoff(backoff, attempts, "create_pod", || {
                    api.create_pod(namespace, &pod)
                })
                .await?;
                log::info!("cluster {}: created worker {name} in group {group}", cluster.name);
            }
            PodAction::DeletePod { pod, reason } => {
                retry_with_backoff(backoff, attempts, "delete_pod", || {
                    api.delete_pod(namespace, pod)
                })
                .await?;
                log::info!("cluster {}: deleted pod {pod} ({reason:?})", cluster.name);
            }
            PodAction::CreateHeadService => {
                let route = head_route(cluster);
                let created = retry_with_backoff(backoff, attempts, "create_route", || {
                    api.create_route(&route)
                })
                .await;
                match created {
                    Ok(_) => {
                        log::info!("cluster {}: created head service {}", cluster.name, route.name)
                    }
                    Err(err) if err.is_conflict() => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    async fn write_status(
        &self,
        cluster: &RayCluster,
        status: &ClusterStatus,
    ) -> Result<(), Error> {
        if cluster.status.as_ref() == Some(status) {
            return Ok(());
        }
        let api = self.api.as_ref();
        let attempts = self.config.conflict_attempts;
        retry_on_conflict(attempts, "replace_cluster_status", move || async move {
            let Some(mut fresh) = api.get_cluster(&cluster.name).await? else {
                return Ok(());
            };
            if fresh.status.as_ref() == Some(status) {
                return Ok(());
            }
            fresh.status = Some(status.clone());
            api.replace_cluster_status(&fresh).await.map(drop)
        })
        .await
    }
}
