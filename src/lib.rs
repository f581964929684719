//! kube-ray-controller keeps Ray clusters and Ray Serve deployments
//! converged on their declared shape.
//!
//! Two reconcilers share one work queue.
//! The cluster reconciler owns a cluster's pods: one head, worker groups
//! sized by the declared or autoscaler-requested replica counts, and the
//! routing object in front of the head.
//! The service reconciler owns a serving deployment: it keeps an active
//! cluster serving, builds a pending cluster when the declared config
//! changes, and swaps traffic over once the pending cluster has been
//! healthy for a stability window.
//!
//! Keys come from watch streams over clusters, services and pods
//! ([`subscriber::events`]) and are processed by a bounded worker pool
//! ([`run`]); no key is reconciled by two workers at once.

pub mod api;
pub mod autoscaler;
pub mod clock;
pub mod cluster;
pub mod config;
pub use config::Config;
pub mod dashboard;
pub mod error;
pub use error::Error;
mod queue;
pub mod resource;
mod retry;
pub mod router;
mod runner;
pub use runner::{run, run_in_cluster, Action, Controllers, ResourceKey, ResourceKind, RunError};
pub mod service;
pub mod subscriber;
pub mod tooling;
