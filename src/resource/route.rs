use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use super::{labels, QualifiedName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePort {
    pub name: String,
    pub port: i32,
}

impl RoutePort {
    pub fn new(name: impl Into<String>, port: i32) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

/// A service-style routing object whose label selector picks backend pods.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub name: QualifiedName,
    pub resource_version: Option<String>,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<RoutePort>,
    pub owners: Vec<OwnerReference>,
}

impl Route {
    pub fn new(
        name: QualifiedName,
        selector: BTreeMap<String, String>,
        ports: Vec<RoutePort>,
    ) -> Self {
        Self {
            name,
            resource_version: None,
            selector,
            ports,
            owners: Vec::new(),
        }
    }

    pub fn owned_by(mut self, owner: Option<OwnerReference>) -> Self {
        self.owners.extend(owner);
        self
    }

    /// The cluster whose pods the selector currently picks.
    pub fn target_cluster(&self) -> Option<&str> {
        self.selector.get(labels::CLUSTER).map(String::as_str)
    }
}

/// Selector for the serving pods of `cluster`.
pub fn serve_selector(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::CLUSTER.to_string(), cluster.to_string()),
        (labels::SERVE.to_string(), "true".to_string()),
    ])
}

/// Selector for the head pod of `cluster`.
pub fn head_selector(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::CLUSTER.to_string(), cluster.to_string()),
        (labels::NODE_TYPE.to_string(), "head".to_string()),
    ])
}

pub const GCS_PORT: i32 = 6379;
pub const DASHBOARD_PORT: i32 = 8265;
pub const CLIENT_PORT: i32 = 10001;
pub const SERVE_PORT: i32 = 8000;
