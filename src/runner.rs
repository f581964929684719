use std::fmt;
use std::panic;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, TryStreamExt};
use kube_client::Client;
use kube_runtime::watcher;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{KubeApi, KubeClientApi};
use crate::autoscaler::AutoscalerBridge;
use crate::clock::{Clock, SystemClock};
use crate::cluster::ClusterController;
use crate::config::Config;
use crate::dashboard::{DashboardClient, HttpDashboardClient};
use crate::queue::WorkQueue;
use crate::resource::QualifiedName;
use crate::service::ServiceController;
use crate::{subscriber, Error};

/// What a reconciler wants to happen to its key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run again after the delay even if nothing changes.
    Requeue(Duration),
    /// Run again only when a watched object changes.
    AwaitChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cluster,
    Service,
}

/// A unit of work: one declared object to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: QualifiedName,
}

impl ResourceKey {
    pub fn cluster(name: QualifiedName) -> Self {
        Self {
            kind: ResourceKind::Cluster,
            name,
        }
    }

    pub fn service(name: QualifiedName) -> Self {
        Self {
            kind: ResourceKind::Service,
            name,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ResourceKind::Cluster => "raycluster",
            ResourceKind::Service => "rayservice",
        };
        write!(f, "{kind} {}", self.name)
    }
}

/// Both reconcilers, sharing one API handle, clock and config.
pub struct Controllers<A, D> {
    clusters: Arc<ClusterController<A>>,
    services: ServiceController<A, D>,
}

impl<A: KubeApi, D: DashboardClient> Controllers<A, D> {
    pub fn new(
        api: Arc<A>,
        dashboard: Arc<D>,
        bridge: AutoscalerBridge,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        let clusters = Arc::new(ClusterController::new(
            api.clone(),
            bridge,
            clock.clone(),
            config.clone(),
        ));
        let services = ServiceController::new(api, clusters.clone(), dashboard, clock, config);
        Self { clusters, services }
    }

    pub async fn reconcile(&self, key: &ResourceKey) -> Result<Action, Error> {
        match key.kind {
            ResourceKind::Cluster => self.clusters.reconcile(&key.name).await,
            ResourceKind::Service => self.services.reconcile(&key.name).await,
        }
    }
}

#[derive(Debug)]
pub enum RunError<E> {
    Subscribe(E),
    /// A collaborator could not be constructed.
    Setup(Error),
}

impl<E: fmt::Display> fmt::Display for RunError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe(err) => write!(f, "event subscription failed: {err}"),
            Self::Setup(err) => write!(f, "setup failed: {err}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RunError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Subscribe(err) => Some(err),
            Self::Setup(err) => Some(err),
        }
    }
}

/// Reconciles every key `events` yields until the stream ends, fails or
/// `cancel` fires.
///
/// Up to `config.workers` keys are reconciled concurrently; one key is
/// never reconciled by two workers at once. Passes already running when
/// the loop stops are allowed to finish.
pub async fn run<A, D, S, E>(
    controllers: Arc<Controllers<A, D>>,
    config: &Config,
    events: S,
    cancel: CancellationToken,
) -> Result<(), RunError<E>>
where
    A: KubeApi,
    D: DashboardClient,
    S: Stream<Item = Result<ResourceKey, E>>,
{
    let queue = WorkQueue::new(config.backoff);
    let workers: Vec<JoinHandle<()>> = (0..config.workers.max(1))
        .map(|id| {
            tokio::spawn(worker(
                id,
                controllers.clone(),
                queue.clone(),
                config.reconcile_timeout,
            ))
        })
        .collect();

    futures::pin_mut!(events);
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            event = events.try_next() => match event {
                Ok(Some(key)) => queue.add(key),
                Ok(None) => break Ok(()),
                Err(err) => break Err(RunError::Subscribe(err)),
            },
        }
    };

    queue.shutdown();
    for handle in workers {
        if let Err(err) = handle.await {
            if let Ok(panic) = err.try_into_panic() {
                panic::resume_unwind(panic)
            }
        }
    }
    result
}

/// Runs both reconcilers against a live apiserver.
pub async fn run_in_cluster(
    client: Client,
    config: Config,
    bridge: AutoscalerBridge,
    namespace: Option<&str>,
    cancel: CancellationToken,
) -> Result<(), RunError<watcher::Error>> {
    let api = Arc::new(KubeClientApi::new(client.clone(), &config));
    let dashboard = Arc::new(HttpDashboardClient::new(&config.dashboard).map_err(RunError::Setup)?);
    let config = Arc::new(config);
    let controllers = Arc::new(Controllers::new(
        api,
        dashboard,
        bridge,
        Arc::new(SystemClock),
        config.clone(),
    ));
    run(controllers, &config, subscriber::events(client, namespace), cancel).await
}

async fn worker<A: KubeApi, D: DashboardClient>(
    id: usize,
    controllers: Arc<Controllers<A, D>>,
    queue: WorkQueue<ResourceKey>,
    deadline: Duration,
) {
    while let Some(key) = queue.next().await {
        let outcome = tokio::time::timeout(deadline, controllers.reconcile(&key))
            .await
            .unwrap_or(Err(Error::Timeout(deadline)));

        match outcome {
            Ok(Action::Requeue(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Ok(Action::AwaitChange) => queue.forget(&key),
            Err(err) if err.is_permanent() => {
                log::warn!("worker {id}: {key} needs a spec change: {err}");
                queue.forget(&key);
            }
            Err(err) => {
                let delay = queue.add_rate_limited(key.clone());
                log::warn!(
                    "worker {id}: reconciling {key} failed, retrying in {}ms: {err}",
                    delay.as_millis()
                );
            }
        }
        queue.done(&key);
    }
    log::debug!("worker {id} stopped");
}
