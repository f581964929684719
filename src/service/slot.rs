//! Health bookkeeping for one cluster slot of a service.

use chrono::{DateTime, Utc};

use crate::clock::elapsed;
use crate::config::UpgradeTuning;
use crate::dashboard::ServeStatus;
use crate::resource::{AppPhase, ClusterSlot, ClusterState};

/// What one pass learned about a slot's cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotView {
    /// The cluster object no longer exists.
    Missing,
    /// The cluster was synced; `serve` is `None` until its dashboard answers.
    Polled { serve: Option<ServeStatus> },
}

/// Ready cluster, every application RUNNING and at least one endpoint.
pub fn is_serving(slot: &ClusterSlot, serve: Option<&ServeStatus>) -> bool {
    slot.cluster_state == ClusterState::Ready
        && serve.is_some_and(|serve| serve.all_apps_running() && serve.endpoints > 0)
}

/// Folds one poll into the slot's consecutive-health counters.
///
/// An unreachable dashboard breaks a healthy streak but does not count as
/// an unhealthy poll.
pub fn record_poll(slot: &mut ClusterSlot, serve: Option<&ServeStatus>, now: DateTime<Utc>) {
    if is_serving(slot, serve) {
        slot.healthy_polls += 1;
        slot.healthy_since.get_or_insert(now);
    } else {
        slot.healthy_polls = 0;
        slot.healthy_since = None;
    }

    match serve {
        Some(serve) if serve.any_in(AppPhase::Unhealthy) => slot.unhealthy_polls += 1,
        Some(_) => slot.unhealthy_polls = 0,
        None => {}
    }
}

/// Whether the slot has been serving for the whole stability window.
pub fn is_promotable(slot: &ClusterSlot, tuning: &UpgradeTuning, now: DateTime<Utc>) -> bool {
    slot.healthy_polls >= tuning.stability_polls
        && slot
            .healthy_since
            .is_some_and(|since| elapsed(since, now) >= tuning.stability_window)
}

/// Why a pending slot should be abandoned, if it should.
pub fn failure(
    slot: &ClusterSlot,
    serve: Option<&ServeStatus>,
    tuning: &UpgradeTuning,
    now: DateTime<Utc>,
) -> Option<String> {
    if slot.cluster_state == ClusterState::Failed {
        return Some(format!("cluster {} failed", slot.cluster_name));
    }
    if let Some(app) = serve.and_then(|serve| {
        serve
            .applications
            .values()
            .find(|app| app.phase == AppPhase::DeployFailed)
    }) {
        return Some(format!(
            "application {} failed to deploy on {}: {}",
            app.name, slot.cluster_name, app.message
        ));
    }
    if slot.unhealthy_polls >= tuning.unhealthy_threshold {
        return Some(format!(
            "applications on {} unhealthy for {} consecutive polls",
            slot.cluster_name, slot.unhealthy_polls
        ));
    }
    if elapsed(slot.created_at, now) > tuning.pending_timeout {
        return Some(format!(
            "cluster {} did not become healthy within {}s",
            slot.cluster_name,
            tuning.pending_timeout.as_secs()
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::after;
    use crate::resource::ApplicationStatus;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn slot(state: ClusterState) -> ClusterSlot {
        let mut slot = ClusterSlot::new("fruit-bbbb".into(), "bbbb".into(), t0());
        slot.cluster_state = state;
        slot
    }

    fn serve(phase: AppPhase, endpoints: i32) -> ServeStatus {
        ServeStatus {
            applications: BTreeMap::from([(
                "fruit".to_string(),
                ApplicationStatus {
                    name: "fruit".into(),
                    phase,
                    message: "boom".into(),
                    endpoints,
                },
            )]),
            endpoints,
        }
    }

    #[test]
    fn promotion_needs_polls_and_duration() {
        let tuning = UpgradeTuning::default();
        let mut pending = slot(ClusterState::Ready);
        let healthy = serve(AppPhase::Running, 2);

        let mut now = t0();
        for _ in 0..tuning.stability_polls {
            record_poll(&mut pending, Some(&healthy), now);
            now = after(now, Duration::from_secs(1));
        }
        assert!(!is_promotable(&pending, &tuning, now));

        now = after(t0(), tuning.stability_window);
        assert!(is_promotable(&pending, &tuning, now));
    }

    #[test]
    fn any_unhealthy_poll_restarts_the_window() {
        let tuning = UpgradeTuning::default();
        let mut pending = slot(ClusterState::Ready);
        for _ in 0..5 {
            record_poll(&mut pending, Some(&serve(AppPhase::Running, 1)), t0());
        }
        record_poll(&mut pending, Some(&serve(AppPhase::Running, 0)), t0());
        assert_eq!(pending.healthy_polls, 0);
        assert!(!is_promotable(&pending, &tuning, after(t0(), Duration::from_secs(3600))));
    }

    #[test]
    fn unreachable_dashboard_is_not_unhealthy() {
        let mut pending = slot(ClusterState::Ready);
        record_poll(&mut pending, Some(&serve(AppPhase::Unhealthy, 1)), t0());
        record_poll(&mut pending, None, t0());
        assert_eq!(pending.unhealthy_polls, 1);
        assert_eq!(pending.healthy_polls, 0);
    }

    #[test]
    fn failure_reasons() {
        let tuning = UpgradeTuning::default();
        assert!(failure(&slot(ClusterState::Failed), None, &tuning, t0())
            .unwrap()
            .contains("failed"));

        let deploy_failed = serve(AppPhase::DeployFailed, 0);
        assert!(failure(&slot(ClusterState::Ready), Some(&deploy_failed), &tuning, t0())
            .unwrap()
            .contains("failed to deploy"));

        let mut flapping = slot(ClusterState::Ready);
        flapping.unhealthy_polls = tuning.unhealthy_threshold;
        assert!(failure(&flapping, None, &tuning, t0()).unwrap().contains("unhealthy"));

        let late = after(t0(), tuning.pending_timeout + Duration::from_secs(1));
        assert!(failure(&slot(ClusterState::Waiting), None, &tuning, late)
            .unwrap()
            .contains("did not become healthy"));

        assert!(failure(&slot(ClusterState::Waiting), None, &tuning, t0()).is_none());
    }
}
