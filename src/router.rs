//! Atomic traffic swaps between the two clusters of a service.

use std::sync::Arc;

use crate::api::KubeApi;
use crate::resource::route::serve_selector;
use crate::resource::{QualifiedName, RayService, Route, RoutePort, SERVE_PORT};
use crate::Error;

pub struct TrafficRouter<A> {
    api: Arc<A>,
}

impl<A: KubeApi> TrafficRouter<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self { api }
    }

    /// Points the serve route of `service` at the serving pods of `cluster`,
    /// creating the route if needed.
    ///
    /// A created route is owned by the service.
    pub async fn ensure_route(&self, service: &RayService, cluster: &str) -> Result<Route, Error> {
        let route = service.serve_route();
        match self.api.get_route(&route).await? {
            None => {
                log::info!("creating serve route {route} for cluster {cluster}");
                let created = Route::new(
                    route,
                    serve_selector(cluster),
                    vec![RoutePort::new("serve", SERVE_PORT)],
                )
                .owned_by(service.owner_reference());
                self.api.create_route(&created).await
            }
            Some(current) if current.target_cluster() == Some(cluster) => Ok(current),
            Some(current) => {
                let from = current.target_cluster().unwrap_or_default().to_string();
                self.swap_backend(&route, &from, cluster).await
            }
        }
    }

    /// Moves `route` from the pods of cluster `from` to those of cluster `to`.
    ///
    /// The selector is replaced in one write guarded by the route's resource
    /// version, so the route never selects a mix of both clusters or neither.
    /// If the write fails the previous selector stays in place. Swapping a
    /// route that already points at `to` succeeds without writing.
    pub async fn swap_backend(
        &self,
        route: &QualifiedName,
        from: &str,
        to: &str,
    ) -> Result<Route, Error> {
        let current = self
            .api
            .get_route(route)
            .await?
            .ok_or_else(|| Error::transient(format!("route {route} does not exist")))?;

        match current.target_cluster() {
            Some(target) if target == to => return Ok(current),
            Some(target) if target != from => {
                return Err(Error::conflict(format!(
                    "route {route} points at {target}, expected {from}"
                )));
            }
            _ => {}
        }

        let mut swapped = current;
        swapped.selector = serve_selector(to);
        let updated = self.api.replace_route_selector(&swapped).await?;
        log::info!("route {route} swapped from cluster {from} to {to}");
        Ok(updated)
    }
}
