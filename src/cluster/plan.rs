//! Pure desired-vs-observed diff for one cluster.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::HEAD_GROUP;
use crate::autoscaler::GroupTarget;
use crate::clock::elapsed;
use crate::config::ClusterTuning;
use crate::resource::cluster::head_service_name;
use crate::resource::{
    content_hash, ClusterObservedState, ClusterSpec, ClusterState, ClusterStatus, FailureRecord,
    HeadInfo, ObservedPod, QualifiedName, Role,
};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// The pod died.
    Failed,
    /// The head died and workers hold state that depends on it.
    HeadRestart,
    ExtraHead,
    ScaleDown,
    /// The autoscaler named this worker for removal.
    AutoscalerRequest,
    /// The pod's group is no longer declared.
    OrphanGroup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodAction {
    CreateHead,
    CreateWorker { group: String },
    DeletePod { pod: String, reason: DeleteReason },
    CreateHeadService,
}

impl PodAction {
    fn delete(pod: &ObservedPod, reason: DeleteReason) -> Self {
        Self::DeletePod {
            pod: pod.name.clone(),
            reason,
        }
    }
}

/// Everything one reconcile pass needs, read up front.
pub struct PlanInput<'a> {
    pub cluster: &'a QualifiedName,
    pub spec: &'a ClusterSpec,
    pub observed: &'a ClusterObservedState,
    pub prior: &'a ClusterStatus,
    /// Effective target per worker group; groups missing here keep their declared size.
    pub targets: &'a BTreeMap<String, GroupTarget>,
    pub tuning: &'a ClusterTuning,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub actions: Vec<PodAction>,
    pub status: ClusterStatus,
    /// Autoscaler deletion requests handled by this plan, per group.
    pub acknowledged: BTreeMap<String, Vec<String>>,
}

/// An action the API refused while a plan was applied.
#[derive(Debug)]
pub struct Rejection {
    pub action: PodAction,
    pub error: Error,
}

impl Rejection {
    /// The failure counter a refused create counts against.
    fn group(&self) -> Option<&str> {
        match &self.action {
            PodAction::CreateHead => Some(HEAD_GROUP),
            PodAction::CreateWorker { group } => Some(group),
            PodAction::DeletePod { .. } | PodAction::CreateHeadService => None,
        }
    }

    fn reason(&self) -> String {
        match &self.action {
            PodAction::CreateHead | PodAction::CreateWorker { .. } => Error::PodScheduling {
                group: self.group().unwrap_or(HEAD_GROUP).to_string(),
                reason: format!("pod creation rejected: {}", self.error),
            }
            .to_string(),
            PodAction::DeletePod { pod, .. } => {
                format!("could not delete pod {pod}: {}", self.error)
            }
            PodAction::CreateHeadService => {
                format!("could not create head service: {}", self.error)
            }
        }
    }

    /// The error a reconcile pass reports for this rejection.
    ///
    /// Never permanent: the pass is retried with backoff even when the API
    /// rejected the object itself.
    pub fn into_error(self) -> Error {
        let group = self.group().unwrap_or("cluster").to_string();
        let reason = self.reason();
        match self.error {
            err @ (Error::TransientApi(_) | Error::Timeout(_)) => err,
            _ => Error::PodScheduling { group, reason },
        }
    }
}

fn budget_reason(group: &str, record: &FailureRecord) -> String {
    if record.last_pod.is_empty() {
        format!("{group}: {} pods failed", record.count)
    } else {
        format!("{group}: {} pods failed, most recently {}", record.count, record.last_pod)
    }
}

/// Folds actions the API refused into a planned status.
///
/// Each refused create counts against its group's failure budget, so a
/// template the API keeps rejecting ends in [`ClusterState::Failed`].
pub fn record_rejections(
    status: &mut ClusterStatus,
    rejections: &[Rejection],
    tuning: &ClusterTuning,
    now: DateTime<Utc>,
) {
    for rejection in rejections {
        let reason = rejection.reason();
        if !status.reasons.contains(&reason) {
            status.reasons.push(reason);
        }
        let Some(group) = rejection.group() else {
            continue;
        };
        let record = status.failures.entry(group.to_string()).or_default();
        let stale = budget_reason(group, record);
        record.count += 1;
        if record.count > tuning.failure_budget {
            status.reasons.retain(|reason| *reason != stale);
            status.reasons.push(budget_reason(group, record));
            if status.state != ClusterState::Failed {
                status.state = ClusterState::Failed;
                status.last_transition = Some(now);
            }
        }
    }
}

fn record_failure(failures: &mut BTreeMap<String, FailureRecord>, group: &str, pod: &str) {
    let record = failures.entry(group.to_string()).or_default();
    if record.last_pod != pod {
        record.count += 1;
        record.last_pod = pod.to_string();
    }
}

/// Ready first, then oldest, then by name.
fn keep_order(pod: &&ObservedPod) -> (bool, DateTime<Utc>, String) {
    (!pod.is_running_ready(), pod.created, pod.name.clone())
}

/// Not ready first, then oldest, then by name.
fn removal_order(pod: &&ObservedPod) -> (bool, DateTime<Utc>, String) {
    (pod.is_running_ready(), pod.created, pod.name.clone())
}

/// Computes the mutations that move `observed` toward `spec`, and the status
/// the cluster will have once they are issued.
///
/// Running the plan again against the state it produces yields no actions
/// and the same status.
pub fn plan(input: &PlanInput<'_>) -> Result<Plan, Error> {
    let PlanInput {
        cluster,
        spec,
        observed,
        prior,
        targets,
        tuning,
        now,
    } = *input;

    spec.validate()?;
    let spec_hash = content_hash(spec)?;
    let mut failures = if prior.spec_hash.as_deref() == Some(spec_hash.as_str()) {
        prior.failures.clone()
    } else {
        BTreeMap::new()
    };

    let mut actions = Vec::new();
    let mut acknowledged = BTreeMap::new();

    let mut heads: Vec<&ObservedPod> = observed.heads().collect();
    heads.sort_by_key(keep_order);
    let mut head = None;
    let mut head_restart = false;
    match heads.split_first() {
        None => actions.push(PodAction::CreateHead),
        Some((keep, extra)) => {
            for pod in extra {
                actions.push(PodAction::delete(pod, DeleteReason::ExtraHead));
            }
            if keep.is_dead() {
                record_failure(&mut failures, HEAD_GROUP, &keep.name);
                actions.push(PodAction::delete(keep, DeleteReason::Failed));
                if spec.external_store.is_none() {
                    head_restart = true;
                    for worker in observed.live().filter(|pod| pod.role == Role::Worker) {
                        actions.push(PodAction::delete(worker, DeleteReason::HeadRestart));
                    }
                }
            } else {
                head = Some(*keep);
            }
        }
    }
    if !observed.head_service {
        actions.push(PodAction::CreateHeadService);
    }

    let mut groups_ready = true;
    let mut desired_workers = 0;
    let mut ready_workers = 0;
    for group in &spec.worker_groups {
        let target = targets.get(&group.name).cloned().unwrap_or_else(|| GroupTarget {
            replicas: group.replicas,
            workers_to_delete: Vec::new(),
        });
        desired_workers += target.replicas;
        if head_restart {
            groups_ready = false;
            continue;
        }

        let (dead, mut alive): (Vec<&ObservedPod>, Vec<&ObservedPod>) =
            observed.workers(&group.name).partition(|pod| pod.is_dead());
        for pod in &dead {
            record_failure(&mut failures, &group.name, &pod.name);
            actions.push(PodAction::delete(pod, DeleteReason::Failed));
        }

        if spec.enable_autoscaling && !target.workers_to_delete.is_empty() {
            alive.retain(|pod| {
                let requested = target.workers_to_delete.contains(&pod.name);
                if requested {
                    actions.push(PodAction::delete(pod, DeleteReason::AutoscalerRequest));
                }
                !requested
            });
            acknowledged.insert(group.name.clone(), target.workers_to_delete.clone());
        }

        let count = alive.len() as i32;
        if count < target.replicas {
            for _ in count..target.replicas {
                actions.push(PodAction::CreateWorker {
                    group: group.name.clone(),
                });
            }
        } else if count > target.replicas {
            alive.sort_by_key(removal_order);
            let excess = (count - target.replicas) as usize;
            for pod in alive.drain(..excess) {
                actions.push(PodAction::delete(pod, DeleteReason::ScaleDown));
            }
        }

        let ready = alive.iter().filter(|pod| pod.is_running_ready()).count() as i32;
        ready_workers += ready;
        if ready < target.replicas {
            groups_ready = false;
        } else if dead.is_empty() {
            failures.remove(&group.name);
        }
    }

    for pod in observed.live() {
        let declared = pod
            .group
            .as_deref()
            .is_some_and(|group| spec.group(group).is_some());
        if pod.role == Role::Worker && !declared && !head_restart {
            actions.push(PodAction::delete(pod, DeleteReason::OrphanGroup));
        }
    }

    let head_ready = head.is_some_and(|pod| pod.is_running_ready());
    if head_ready {
        failures.remove(HEAD_GROUP);
    }

    let mut failed = false;
    let mut reasons = Vec::new();
    for (group, record) in &failures {
        if record.count > tuning.failure_budget {
            failed = true;
            reasons.push(budget_reason(group, record));
        }
    }
    for pod in observed.live() {
        let Some(failure) = &pod.start_failure else {
            continue;
        };
        if elapsed(failure.since, now) >= tuning.pod_start_timeout {
            failed = true;
            reasons.push(format!(
                "pod {} did not start within {}s: {}",
                pod.name,
                tuning.pod_start_timeout.as_secs(),
                failure.reason
            ));
        } else {
            let scheduling = Error::PodScheduling {
                group: pod.group.clone().unwrap_or_else(|| HEAD_GROUP.to_string()),
                reason: format!("pod {} waiting to start: {}", pod.name, failure.reason),
            };
            reasons.push(scheduling.to_string());
        }
    }

    let state = if failed {
        ClusterState::Failed
    } else if head_ready && groups_ready {
        ClusterState::Ready
    } else {
        ClusterState::Waiting
    };
    let last_transition = if state == prior.state && prior.last_transition.is_some() {
        prior.last_transition
    } else {
        Some(now)
    };

    Ok(Plan {
        actions,
        status: ClusterStatus {
            state,
            last_transition,
            reasons,
            desired_workers,
            ready_workers,
            head: head.map(|pod| HeadInfo {
                pod_name: pod.name.clone(),
                pod_ip: pod.address.clone(),
                service_name: head_service_name(&cluster.name),
            }),
            failures,
            spec_hash: Some(spec_hash),
        },
        acknowledged,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::after;
    use crate::resource::cluster::fixtures::{group, spec};
    use crate::resource::{PodPhase, StartFailure};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn pod(name: &str, role: Role, group: Option<&str>, ready: bool, age: i64) -> ObservedPod {
        ObservedPod {
            name: name.into(),
            role,
            group: group.map(Into::into),
            phase: if ready { PodPhase::Running } else { PodPhase::Pending },
            ready,
            address: ready.then(|| format!("10.0.0.{}", name.len())),
            created: t0() - chrono::Duration::seconds(age),
            terminating: false,
            start_failure: None,
        }
    }

    fn head(ready: bool) -> ObservedPod {
        pod("c-head-1", Role::Head, None, ready, 100)
    }

    fn worker(name: &str, ready: bool, age: i64) -> ObservedPod {
        pod(name, Role::Worker, Some("small"), ready, age)
    }

    fn observed(pods: Vec<ObservedPod>) -> ClusterObservedState {
        ClusterObservedState {
            pods,
            head_service: true,
        }
    }

    struct Fixture {
        name: QualifiedName,
        spec: ClusterSpec,
        tuning: ClusterTuning,
        targets: BTreeMap<String, GroupTarget>,
        prior: ClusterStatus,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new(spec: ClusterSpec) -> Self {
            Self {
                name: QualifiedName::new("ml", "c"),
                spec,
                tuning: ClusterTuning::default(),
                targets: BTreeMap::new(),
                prior: ClusterStatus::default(),
                now: t0(),
            }
        }

        fn run(&self, observed: &ClusterObservedState) -> Plan {
            plan(&PlanInput {
                cluster: &self.name,
                spec: &self.spec,
                observed,
                prior: &self.prior,
                targets: &self.targets,
                tuning: &self.tuning,
                now: self.now,
            })
            .unwrap()
        }
    }

    fn creates(plan: &Plan, group: &str) -> usize {
        plan.actions
            .iter()
            .filter(|action| matches!(action, PodAction::CreateWorker { group: g } if g == group))
            .count()
    }

    fn deleted(plan: &Plan) -> Vec<(String, DeleteReason)> {
        plan.actions
            .iter()
            .filter_map(|action| match action {
                PodAction::DeletePod { pod, reason } => Some((pod.clone(), *reason)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_cluster_creates_head_service_and_workers() {
        let fixture = Fixture::new(spec(vec![group("small", 3, 0, 5)]));
        let plan = fixture.run(&ClusterObservedState::default());

        assert_eq!(plan.actions[0], PodAction::CreateHead);
        assert!(plan.actions.contains(&PodAction::CreateHeadService));
        assert_eq!(creates(&plan, "small"), 3);
        assert_eq!(plan.status.state, ClusterState::Waiting);
        assert_eq!(plan.status.desired_workers, 3);
        assert_eq!(plan.status.last_transition, Some(t0()));
    }

    #[test]
    fn converged_cluster_is_ready_and_quiet() {
        let mut fixture = Fixture::new(spec(vec![group("small", 2, 0, 5)]));
        let state = observed(vec![head(true), worker("w-a", true, 50), worker("w-b", true, 40)]);

        let first = fixture.run(&state);
        assert!(first.actions.is_empty());
        assert_eq!(first.status.state, ClusterState::Ready);
        assert_eq!(first.status.head.as_ref().unwrap().service_name, "c-head-svc");

        fixture.prior = first.status.clone();
        fixture.now = after(t0(), Duration::from_secs(30));
        let second = fixture.run(&state);
        assert!(second.actions.is_empty());
        assert_eq!(second.status, first.status);
    }

    #[test]
    fn unready_worker_degrades_to_waiting() {
        let mut fixture = Fixture::new(spec(vec![group("small", 2, 0, 5)]));
        fixture.prior = ClusterStatus {
            state: ClusterState::Ready,
            last_transition: Some(t0()),
            ..Default::default()
        };
        let plan = fixture.run(&observed(vec![
            head(true),
            worker("w-a", true, 50),
            worker("w-b", false, 40),
        ]));
        assert!(plan.actions.is_empty());
        assert_eq!(plan.status.state, ClusterState::Waiting);
    }

    #[test]
    fn scale_down_removes_unready_then_oldest() {
        let fixture = Fixture::new(spec(vec![group("small", 2, 0, 5)]));
        let plan = fixture.run(&observed(vec![
            head(true),
            worker("w-young", true, 10),
            worker("w-old", true, 90),
            worker("w-mid", true, 50),
            worker("w-unready", false, 5),
        ]));

        assert_eq!(
            deleted(&plan),
            vec![
                ("w-unready".to_string(), DeleteReason::ScaleDown),
                ("w-old".to_string(), DeleteReason::ScaleDown),
            ]
        );
        assert_eq!(plan.status.state, ClusterState::Ready);
    }

    #[test]
    fn scale_down_ties_break_by_name() {
        let fixture = Fixture::new(spec(vec![group("small", 1, 0, 5)]));
        let plan = fixture.run(&observed(vec![
            head(true),
            worker("w-b", true, 10),
            worker("w-a", true, 10),
        ]));
        assert_eq!(deleted(&plan), vec![("w-a".to_string(), DeleteReason::ScaleDown)]);
    }

    #[test]
    fn failed_head_restarts_whole_cluster_without_external_store() {
        let fixture = Fixture::new(spec(vec![group("small", 1, 0, 5)]));
        let mut dead = head(false);
        dead.phase = PodPhase::Failed;
        let plan = fixture.run(&observed(vec![dead, worker("w-a", true, 10)]));

        assert_eq!(
            deleted(&plan),
            vec![
                ("c-head-1".to_string(), DeleteReason::Failed),
                ("w-a".to_string(), DeleteReason::HeadRestart),
            ]
        );
        assert_eq!(creates(&plan, "small"), 0);
        assert_eq!(plan.status.failures[HEAD_GROUP].count, 1);
        assert!(plan.status.head.is_none());
    }

    #[test]
    fn failed_head_alone_is_replaced_with_external_store() {
        let mut cluster = spec(vec![group("small", 1, 0, 5)]);
        cluster.external_store = Some("redis:6379".into());
        let fixture = Fixture::new(cluster);
        let mut dead = head(false);
        dead.phase = PodPhase::Failed;
        let plan = fixture.run(&observed(vec![dead, worker("w-a", true, 10)]));

        assert_eq!(deleted(&plan), vec![("c-head-1".to_string(), DeleteReason::Failed)]);
    }

    #[test]
    fn extra_heads_are_removed_keeping_the_ready_one() {
        let fixture = Fixture::new(spec(vec![]));
        let mut second = pod("c-head-2", Role::Head, None, false, 10);
        second.phase = PodPhase::Running;
        let plan = fixture.run(&observed(vec![second, head(true)]));
        assert_eq!(deleted(&plan), vec![("c-head-2".to_string(), DeleteReason::ExtraHead)]);
        assert_eq!(plan.status.state, ClusterState::Ready);
    }

    #[test]
    fn autoscaler_target_drives_group_size() {
        let mut fixture = Fixture::new(spec(vec![group("small", 3, 0, 10)]));
        fixture.spec.enable_autoscaling = true;
        fixture.targets.insert(
            "small".into(),
            GroupTarget {
                replicas: 5,
                workers_to_delete: vec![],
            },
        );
        let plan = fixture.run(&observed(vec![
            head(true),
            worker("w-a", true, 3),
            worker("w-b", true, 2),
            worker("w-c", true, 1),
        ]));
        assert_eq!(creates(&plan, "small"), 2);
        assert_eq!(plan.status.desired_workers, 5);
        assert_eq!(plan.status.state, ClusterState::Waiting);
    }

    #[test]
    fn autoscaler_named_workers_are_removed_first() {
        let mut fixture = Fixture::new(spec(vec![group("small", 3, 0, 10)]));
        fixture.spec.enable_autoscaling = true;
        fixture.targets.insert(
            "small".into(),
            GroupTarget {
                replicas: 2,
                workers_to_delete: vec!["w-young".into()],
            },
        );
        let plan = fixture.run(&observed(vec![
            head(true),
            worker("w-old", true, 90),
            worker("w-mid", true, 50),
            worker("w-young", true, 10),
        ]));
        assert_eq!(
            deleted(&plan),
            vec![("w-young".to_string(), DeleteReason::AutoscalerRequest)]
        );
        assert_eq!(plan.acknowledged["small"], vec!["w-young".to_string()]);
    }

    #[test]
    fn dead_worker_is_replaced_and_counted() {
        let fixture = Fixture::new(spec(vec![group("small", 1, 0, 5)]));
        let mut dead = worker("w-a", false, 10);
        dead.phase = PodPhase::Failed;
        let plan = fixture.run(&observed(vec![head(true), dead]));

        assert_eq!(deleted(&plan), vec![("w-a".to_string(), DeleteReason::Failed)]);
        assert_eq!(creates(&plan, "small"), 1);
        assert_eq!(plan.status.failures["small"].count, 1);
        assert_eq!(plan.status.state, ClusterState::Waiting);
    }

    #[test]
    fn repeated_failures_past_budget_mark_cluster_failed() {
        let mut fixture = Fixture::new(spec(vec![group("small", 1, 0, 5)]));
        fixture.tuning.failure_budget = 2;
        let first = fixture.run(&observed(vec![head(true)]));
        fixture.prior = first.status;

        for n in 0..3 {
            let mut dead = worker(&format!("w-{n}"), false, 1);
            dead.phase = PodPhase::Failed;
            let plan = fixture.run(&observed(vec![head(true), dead]));
            fixture.prior = plan.status;
        }

        assert_eq!(fixture.prior.state, ClusterState::Failed);
        assert_eq!(fixture.prior.failures["small"].count, 3);
        assert!(fixture.prior.reasons[0].contains("3 pods failed"));

        // Recovery: the replacement comes up healthy.
        let plan = fixture.run(&observed(vec![head(true), worker("w-3", true, 1)]));
        assert_eq!(plan.status.state, ClusterState::Ready);
        assert!(plan.status.failures.is_empty());
    }

    #[test]
    fn same_dead_pod_is_counted_once() {
        let mut fixture = Fixture::new(spec(vec![group("small", 1, 0, 5)]));
        let mut dead = worker("w-a", false, 10);
        dead.phase = PodPhase::Failed;
        let state = observed(vec![head(true), dead]);
        fixture.prior = fixture.run(&state).status;
        assert_eq!(fixture.run(&state).status.failures["small"].count, 1);
    }

    #[test]
    fn spec_edit_resets_failure_counters() {
        let mut fixture = Fixture::new(spec(vec![group("small", 1, 0, 5)]));
        fixture.prior = ClusterStatus {
            state: ClusterState::Failed,
            failures: BTreeMap::from([(
                "small".to_string(),
                FailureRecord {
                    count: 9,
                    last_pod: "w-x".into(),
                },
            )]),
            spec_hash: Some("stale".into()),
            ..Default::default()
        };
        let plan = fixture.run(&observed(vec![head(true), worker("w-b", false, 1)]));
        assert_eq!(plan.status.state, ClusterState::Waiting);
        assert!(plan.status.failures.is_empty());
    }

    #[test]
    fn unschedulable_pod_fails_cluster_after_timeout() {
        let mut fixture = Fixture::new(spec(vec![group("small", 1, 0, 5)]));
        let mut stuck = worker("w-a", false, 10);
        stuck.start_failure = Some(StartFailure {
            reason: "0/3 nodes are available".into(),
            since: t0(),
        });
        let state = observed(vec![head(true), stuck]);

        let early = fixture.run(&state);
        assert_eq!(early.status.state, ClusterState::Waiting);
        assert!(early.status.reasons[0].contains("waiting to start"));
        assert!(early.actions.is_empty());

        fixture.now = after(t0(), fixture.tuning.pod_start_timeout);
        let late = fixture.run(&state);
        assert_eq!(late.status.state, ClusterState::Failed);
        assert!(late.status.reasons[0].contains("did not start"));
    }

    #[test]
    fn undeclared_group_pods_are_removed() {
        let fixture = Fixture::new(spec(vec![]));
        let stray = pod("w-gpu", Role::Worker, Some("gpu"), true, 10);
        let plan = fixture.run(&observed(vec![head(true), stray]));
        assert_eq!(deleted(&plan), vec![("w-gpu".to_string(), DeleteReason::OrphanGroup)]);
    }

    #[test]
    fn terminating_pods_are_neither_counted_nor_deleted_again() {
        let fixture = Fixture::new(spec(vec![group("small", 1, 0, 5)]));
        let mut leaving = worker("w-a", true, 10);
        leaving.terminating = true;
        let plan = fixture.run(&observed(vec![head(true), leaving]));
        assert!(deleted(&plan).is_empty());
        assert_eq!(creates(&plan, "small"), 1);
    }

    #[test]
    fn invalid_spec_is_rejected_before_any_action() {
        let fixture = Fixture::new(spec(vec![group("small", 1, 0, 5), group("small", 1, 0, 5)]));
        let err = plan(&PlanInput {
            cluster: &fixture.name,
            spec: &fixture.spec,
            observed: &ClusterObservedState::default(),
            prior: &fixture.prior,
            targets: &fixture.targets,
            tuning: &fixture.tuning,
            now: fixture.now,
        })
        .unwrap_err();
        assert!(err.is_permanent());
    }

    fn rejected_worker(error: Error) -> Rejection {
        Rejection {
            action: PodAction::CreateWorker {
                group: "small".into(),
            },
            error,
        }
    }

    #[test]
    fn rejected_creates_are_reported_and_counted() {
        let fixture = Fixture::new(spec(vec![group("small", 2, 0, 5)]));
        let mut status = fixture.run(&observed(vec![head(true)])).status;

        record_rejections(
            &mut status,
            &[
                rejected_worker(Error::validation("securityContext is forbidden")),
                rejected_worker(Error::validation("securityContext is forbidden")),
            ],
            &fixture.tuning,
            fixture.now,
        );

        assert_eq!(status.state, ClusterState::Waiting);
        assert_eq!(status.failures["small"].count, 2);
        assert_eq!(status.reasons.len(), 1);
        assert!(status.reasons[0].contains("pod creation rejected"));
        assert!(status.reasons[0].contains("securityContext"));
    }

    #[test]
    fn rejected_creates_past_budget_fail_the_cluster() {
        let mut fixture = Fixture::new(spec(vec![group("small", 1, 0, 5)]));
        fixture.tuning.failure_budget = 2;
        let state = observed(vec![head(true)]);

        for _ in 0..3 {
            let mut status = fixture.run(&state).status;
            record_rejections(
                &mut status,
                &[rejected_worker(Error::transient("admission webhook timed out"))],
                &fixture.tuning,
                fixture.now,
            );
            fixture.prior = status;
        }

        assert_eq!(fixture.prior.state, ClusterState::Failed);
        assert_eq!(fixture.prior.last_transition, Some(t0()));
        let budget: Vec<_> = fixture
            .prior
            .reasons
            .iter()
            .filter(|reason| reason.contains("pods failed"))
            .collect();
        assert_eq!(budget, vec!["small: 3 pods failed"]);

        // The next plan keeps the cluster failed from the carried counter.
        assert_eq!(fixture.run(&state).status.state, ClusterState::Failed);
    }

    #[test]
    fn rejected_objects_never_surface_as_permanent() {
        let err = rejected_worker(Error::validation("field is immutable")).into_error();
        assert!(!err.is_permanent());
        assert!(matches!(err, Error::PodScheduling { ref group, .. } if group == "small"));

        let err = rejected_worker(Error::transient("etcd leader changed")).into_error();
        assert!(err.is_transient());
    }
}
