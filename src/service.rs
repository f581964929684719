//! The service lifecycle controller.
//!
//! A service owns at most two clusters at a time: the active one behind the
//! serve route and, during an upgrade, a pending one built from the new
//! spec. The pending cluster only takes traffic after it has served every
//! application for the whole stability window, and the old active cluster
//! is only deleted after the route has been swapped away from it and the
//! drain grace period has passed.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::api::KubeApi;
use crate::clock::{after, Clock};
use crate::cluster::ClusterController;
use crate::config::Config;
use crate::dashboard::{DashboardClient, ServeStatus};
use crate::resource::{
    ClusterSlot, ClusterState, QualifiedName, RayCluster, RayService, RetiringCluster,
    ServiceState, ServiceStatus,
};
use crate::retry::retry_on_conflict;
use crate::router::TrafficRouter;
use crate::runner::Action;
use crate::Error;

pub mod slot;
use slot::SlotView;

pub struct ServiceController<A, D> {
    api: Arc<A>,
    clusters: Arc<ClusterController<A>>,
    dashboard: Arc<D>,
    router: TrafficRouter<A>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

/// One reconcile pass over a single service.
struct Pass<'a> {
    service: &'a RayService,
    hash: String,
    now: DateTime<Utc>,
}

impl<A: KubeApi, D: DashboardClient> ServiceController<A, D> {
    pub fn new(
        api: Arc<A>,
        clusters: Arc<ClusterController<A>>,
        dashboard: Arc<D>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            router: TrafficRouter::new(api.clone()),
            api,
            clusters,
            dashboard,
            clock,
            config,
        }
    }

    pub async fn reconcile(&self, key: &QualifiedName) -> Result<Action, Error> {
        let Some(service) = self.api.get_service(key).await? else {
            log::debug!("service {key} is gone");
            return Ok(Action::AwaitChange);
        };

        let prior = service.status();
        let mut status = prior.clone();
        let outcome = self.step(&service, &mut status).await;
        if status.state != prior.state {
            status.last_transition = Some(self.clock.now());
            log::info!("service {key}: {:?} -> {:?}", prior.state, status.state);
        }
        // Progress made before an error is kept.
        if status != prior {
            self.write_status(&service, &status).await?;
        }
        outcome
    }

    async fn step(
        &self,
        service: &RayService,
        status: &mut ServiceStatus,
    ) -> Result<Action, Error> {
        if let Err(err) = service.spec.validate() {
            log::warn!("service {} rejected: {err}", service.name);
            status.reasons = vec![err.to_string()];
            return Err(err);
        }
        let pass = Pass {
            service,
            hash: service.spec.config_hash()?,
            now: self.clock.now(),
        };
        status.reasons.clear();

        self.retire_drained(&pass, status).await?;

        if status.state == ServiceState::Initializing || status.active.is_none() {
            let active = self.create_cluster(&pass, status, &pass.hash).await?;
            status.active = Some(active);
            status.state = ServiceState::WaitingForActiveCluster;
            return Ok(self.requeue(status));
        }

        let active_serve = match self.sync_active(&pass, status).await? {
            Some(serve) => serve,
            None => return Ok(self.requeue(status)),
        };
        if let Some(serve) = &active_serve {
            status.num_serve_endpoints = serve.endpoints;
            status.applications = serve.applications.clone();
        }

        match status.state {
            ServiceState::Initializing | ServiceState::WaitingForActiveCluster => {
                self.wait_for_active(&pass, status, active_serve.as_ref()).await?
            }
            ServiceState::Serving => self.serve(&pass, status).await?,
            ServiceState::Upgrading => self.upgrade(&pass, status).await?,
            ServiceState::Swapping => self.swap(&pass, status).await?,
            ServiceState::RecoveringFromPendingFailure => self.recover(&pass, status).await?,
        }
        Ok(self.requeue(status))
    }

    fn requeue(&self, status: &ServiceStatus) -> Action {
        let tuning = &self.config.upgrade;
        let settled = status.pending.is_none() && status.retiring.is_empty();
        if status.state == ServiceState::Serving && settled {
            Action::Requeue(tuning.serving_poll_interval)
        } else {
            Action::Requeue(tuning.poll_interval)
        }
    }

    /// Syncs the active cluster and polls its applications.
    ///
    /// Returns `None` when the active cluster was lost and had to be replaced;
    /// the service then waits for the replacement like a new service would.
    async fn sync_active(
        &self,
        pass: &Pass<'_>,
        status: &mut ServiceStatus,
    ) -> Result<Option<Option<ServeStatus>>, Error> {
        let Some(mut active) = status.active.clone() else {
            return Ok(None);
        };
        let view = self.sync_slot(pass, &mut active).await;
        status.active = Some(active);
        match view? {
            SlotView::Polled { serve } => Ok(Some(serve)),
            SlotView::Missing => {
                self.replace_lost_active(pass, status).await?;
                Ok(None)
            }
        }
    }

    async fn replace_lost_active(
        &self,
        pass: &Pass<'_>,
        status: &mut ServiceStatus,
    ) -> Result<(), Error> {
        let lost = status.active.take().map(|slot| slot.cluster_name).unwrap_or_default();
        log::warn!("service {}: active cluster {lost} is gone", pass.service.name);

        let replacement = match status.pending.take() {
            Some(pending) if pending.config_hash == pass.hash => pending,
            Some(stale) => {
                self.clusters.teardown(&pass.service.name.sibling(&stale.cluster_name)).await?;
                self.create_cluster(pass, status, &pass.hash).await?
            }
            None => self.create_cluster(pass, status, &pass.hash).await?,
        };
        status.active = Some(replacement);
        status.reasons.push(format!("active cluster {lost} was lost"));
        status.state = ServiceState::WaitingForActiveCluster;
        Ok(())
    }

    async fn wait_for_active(
        &self,
        pass: &Pass<'_>,
        status: &mut ServiceStatus,
        serve: Option<&ServeStatus>,
    ) -> Result<(), Error> {
        let Some(active) = &status.active else {
            return Ok(());
        };
        let endpoints = serve.is_some_and(|serve| serve.endpoints > 0);
        if active.cluster_state == ClusterState::Ready && endpoints {
            self.router.ensure_route(pass.service, &active.cluster_name).await?;
            status.state = ServiceState::Serving;
        }
        Ok(())
    }

    async fn serve(&self, pass: &Pass<'_>, status: &mut ServiceStatus) -> Result<(), Error> {
        let Some(active) = status.active.clone() else {
            return Ok(());
        };
        self.router.ensure_route(pass.service, &active.cluster_name).await?;

        if let Some(stray) = status.pending.clone() {
            self.clusters.teardown(&pass.service.name.sibling(&stray.cluster_name)).await?;
            status.pending = None;
        }

        if active.config_hash == pass.hash {
            status.retry_after = None;
            return Ok(());
        }
        if let Some(retiring) = status.retiring.first() {
            status.reasons.push(format!(
                "upgrade waits for cluster {} to drain",
                retiring.cluster_name
            ));
            return Ok(());
        }
        if let Some(retry_after) = status.retry_after.filter(|at| pass.now < *at) {
            status.reasons.push(format!("upgrade retry scheduled after {retry_after}"));
            return Ok(());
        }

        let pending = self.create_cluster(pass, status, &pass.hash).await?;
        log::info!(
            "service {}: upgrading from {} to {}",
            pass.service.name,
            active.cluster_name,
            pending.cluster_name
        );
        status.pending = Some(pending);
        status.state = ServiceState::Upgrading;
        Ok(())
    }

    async fn upgrade(&self, pass: &Pass<'_>, status: &mut ServiceStatus) -> Result<(), Error> {
        let Some(mut pending) = status.pending.clone() else {
            status.state = ServiceState::Serving;
            return Ok(());
        };

        if pending.config_hash != pass.hash {
            log::info!(
                "service {}: spec changed during upgrade, abandoning {}",
                pass.service.name,
                pending.cluster_name
            );
            self.clusters.teardown(&pass.service.name.sibling(&pending.cluster_name)).await?;
            status.pending = None;
            status.state = ServiceState::Serving;
            return Ok(());
        }

        let view = self.sync_slot(pass, &mut pending).await;
        let serve = match view {
            Ok(SlotView::Polled { serve }) => serve,
            Ok(SlotView::Missing) => {
                let reason = format!("pending cluster {} disappeared", pending.cluster_name);
                status.pending = Some(pending);
                self.fail_upgrade(pass, status, reason);
                return Ok(());
            }
            Err(err) => {
                let failure = if err.is_permanent() {
                    Some(format!("pending cluster {} rejected: {err}", pending.cluster_name))
                } else {
                    slot::failure(&pending, None, &self.config.upgrade, pass.now)
                };
                status.pending = Some(pending);
                return match failure {
                    Some(reason) => {
                        self.fail_upgrade(pass, status, reason);
                        Ok(())
                    }
                    None => {
                        status.reasons.push(format!("pending cluster not synced: {err}"));
                        Err(err)
                    }
                };
            }
        };

        slot::record_poll(&mut pending, serve.as_ref(), pass.now);
        let tuning = &self.config.upgrade;
        let failure = slot::failure(&pending, serve.as_ref(), tuning, pass.now);
        let promotable = slot::is_promotable(&pending, tuning, pass.now);
        status.pending = Some(pending);

        if let Some(reason) = failure {
            self.fail_upgrade(pass, status, reason);
        } else if promotable {
            status.state = ServiceState::Swapping;
        }
        Ok(())
    }

    async fn swap(&self, pass: &Pass<'_>, status: &mut ServiceStatus) -> Result<(), Error> {
        let (Some(active), Some(mut pending)) = (status.active.clone(), status.pending.clone())
        else {
            status.state = ServiceState::Serving;
            return Ok(());
        };

        let view = match self.sync_slot(pass, &mut pending).await {
            Ok(view) => view,
            Err(err) if err.is_permanent() => {
                let reason = format!("pending cluster {} rejected: {err}", pending.cluster_name);
                status.pending = Some(pending);
                self.fail_upgrade(pass, status, reason);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let serve = match view {
            SlotView::Polled { serve } if slot::is_serving(&pending, serve.as_ref()) => serve,
            _ => {
                log::warn!(
                    "service {}: pending cluster {} stopped serving before the swap",
                    pass.service.name,
                    pending.cluster_name
                );
                pending.healthy_polls = 0;
                pending.healthy_since = None;
                status.pending = Some(pending);
                status.state = ServiceState::Upgrading;
                return Ok(());
            }
        };

        self.router
            .swap_backend(&pass.service.serve_route(), &active.cluster_name, &pending.cluster_name)
            .await?;

        status.retiring.push(RetiringCluster {
            cluster_name: active.cluster_name.clone(),
            delete_after: after(pass.now, self.config.upgrade.drain_grace_period),
        });
        if let Some(serve) = serve {
            status.num_serve_endpoints = serve.endpoints;
            status.applications = serve.applications;
        }
        log::info!(
            "service {}: promoted {} and retired {}",
            pass.service.name,
            pending.cluster_name,
            active.cluster_name
        );
        status.active = Some(pending);
        status.pending = None;
        status.failed_upgrades = 0;
        status.retry_after = None;
        status.state = ServiceState::Serving;
        Ok(())
    }

    async fn recover(&self, pass: &Pass<'_>, status: &mut ServiceStatus) -> Result<(), Error> {
        if let Some(pending) = status.pending.clone() {
            self.clusters.teardown(&pass.service.name.sibling(&pending.cluster_name)).await?;
            status.pending = None;
        }
        status.state = ServiceState::Serving;
        Ok(())
    }

    fn fail_upgrade(&self, pass: &Pass<'_>, status: &mut ServiceStatus, reason: String) {
        status.failed_upgrades += 1;
        let delay = self.config.upgrade.retry_backoff.delay(status.failed_upgrades);
        status.retry_after = Some(after(pass.now, delay));
        log::warn!(
            "service {}: upgrade failed ({reason}), retrying in {}s",
            pass.service.name,
            delay.as_secs()
        );
        status.last_failure = Some(reason);
        status.state = ServiceState::RecoveringFromPendingFailure;
    }

    /// Tears down retired clusters whose drain grace period is over.
    ///
    /// A name held by the active or pending slot is dropped from the list
    /// without deleting anything.
    async fn retire_drained(
        &self,
        pass: &Pass<'_>,
        status: &mut ServiceStatus,
    ) -> Result<(), Error> {
        let in_use: Vec<String> = [&status.active, &status.pending]
            .into_iter()
            .flatten()
            .map(|slot| slot.cluster_name.clone())
            .collect();
        for name in &in_use {
            release_retiring(status, name);
        }

        let due: Vec<String> = status
            .retiring
            .iter()
            .filter(|retiring| retiring.delete_after <= pass.now)
            .map(|retiring| retiring.cluster_name.clone())
            .collect();
        for name in due {
            self.clusters.teardown(&pass.service.name.sibling(&name)).await?;
            status.retiring.retain(|retiring| retiring.cluster_name != name);
        }
        Ok(())
    }

    /// Creates the cluster for `hash`, or adopts it if it already exists.
    ///
    /// An adopted cluster that was retiring is taken off the retiring list.
    async fn create_cluster(
        &self,
        pass: &Pass<'_>,
        status: &mut ServiceStatus,
        hash: &str,
    ) -> Result<ClusterSlot, Error> {
        let name = pass.service.cluster_name(hash);
        let spec = pass.service.spec.cluster.clone();
        let cluster =
            RayCluster::new(pass.service.name.sibling(&name), spec).owned_by(pass.service);
        match self.api.create_cluster(&cluster).await {
            Ok(_) => log::info!("service {}: created cluster {name}", pass.service.name),
            // Left over from a pass whose status write did not land, or still retiring.
            Err(err) if err.is_conflict() => {}
            Err(err) => return Err(err),
        }
        if release_retiring(status, &name) {
            log::info!("service {}: reclaimed retiring cluster {name}", pass.service.name);
        }
        Ok(ClusterSlot::new(name, hash.to_string(), pass.now))
    }

    /// Drives one slot's cluster and, once it is Ready, its applications.
    async fn sync_slot(&self, pass: &Pass<'_>, slot: &mut ClusterSlot) -> Result<SlotView, Error> {
        let name = pass.service.name.sibling(&slot.cluster_name);
        let Some(cluster) = self.api.get_cluster(&name).await? else {
            return Ok(SlotView::Missing);
        };
        let cluster_status = self.clusters.sync(&cluster).await?;
        slot.cluster_state = cluster_status.state;

        let ready = cluster_status.state == ClusterState::Ready;
        let head = match cluster_status.head {
            Some(head) if ready => head,
            _ => return Ok(SlotView::Polled { serve: None }),
        };
        let Some(ip) = head.pod_ip else {
            return Ok(SlotView::Polled { serve: None });
        };
        let address = format!("{ip}:{}", self.config.dashboard.port);

        // Only the current spec's config is known; older slots keep what they run.
        let submitted = slot.config_submitted_to.as_deref() == Some(head.pod_name.as_str());
        if slot.config_hash == pass.hash && !submitted {
            match self
                .dashboard
                .deploy_config(&address, &pass.service.spec.serve_config)
                .await
            {
                Ok(()) => {
                    log::info!(
                        "service {}: submitted serve config to {} ({})",
                        pass.service.name,
                        slot.cluster_name,
                        head.pod_name
                    );
                    slot.config_submitted_to = Some(head.pod_name);
                }
                Err(err) if err.is_transient() => {
                    log::warn!("service {}: {err}", pass.service.name);
                    return Ok(SlotView::Polled { serve: None });
                }
                Err(err) => return Err(err),
            }
        }

        match self.dashboard.application_statuses(&address).await {
            Ok(serve) => Ok(SlotView::Polled { serve: Some(serve) }),
            Err(err) if err.is_transient() => {
                log::debug!("service {}: {err}", pass.service.name);
                Ok(SlotView::Polled { serve: None })
            }
            Err(err) => Err(err),
        }
    }

    async fn write_status(
        &self,
        service: &RayService,
        status: &ServiceStatus,
    ) -> Result<(), Error> {
        let api = self.api.as_ref();
        let attempts = self.config.conflict_attempts;
        retry_on_conflict(attempts, "replace_service_status", move || async move {
            let Some(mut fresh) = api.get_service(&service.name).await? else {
                return Ok(());
            };
            if fresh.status.as_ref() == Some(status) {
                return Ok(());
            }
            fresh.status = Some(status.clone());
            api.replace_service_status(&fresh).await.map(drop)
        })
        .await
    }
}

/// Takes `name` off the retiring list; returns whether it was on it.
fn release_retiring(status: &mut ServiceStatus, name: &str) -> bool {
    let before = status.retiring.len();
    status.retiring.retain(|retiring| retiring.cluster_name != name);
    status.retiring.len() != before
}
