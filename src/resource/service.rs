use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};

use super::{
    content_hash, controller_reference, ClusterSpec, ClusterState, QualifiedName, SERVICE_KIND,
};
use crate::Error;

/// Declared serving deployment: a cluster template plus the serve config run on it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "rayClusterConfig")]
    pub cluster: ClusterSpec,
    /// Serve application config, submitted verbatim to the dashboard.
    #[serde(rename = "serveConfigV2")]
    pub serve_config: String,
}

impl ServiceSpec {
    /// Digest identifying the cluster this spec needs; any change means an upgrade.
    pub fn config_hash(&self) -> Result<String, Error> {
        Ok(content_hash(self)?)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.serve_config.trim().is_empty() {
            return Err(Error::validation("serve config must not be empty"));
        }
        serde_yaml::from_str::<serde_yaml::Value>(&self.serve_config)
            .map_err(|err| Error::validation(format!("serve config is not valid YAML: {err}")))?;
        self.cluster.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceState {
    #[default]
    Initializing,
    WaitingForActiveCluster,
    Serving,
    Upgrading,
    Swapping,
    RecoveringFromPendingFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppPhase {
    Deploying,
    Running,
    DeployFailed,
    Unhealthy,
    /// Any phase the dashboard reports that this controller does not act on.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    pub name: String,
    pub phase: AppPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub endpoints: i32,
}

/// One of the two cluster slots a service owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSlot {
    pub cluster_name: String,
    pub config_hash: String,
    /// Snapshot of the cluster's own status at the last poll.
    pub cluster_state: ClusterState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub healthy_polls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unhealthy_polls: u32,
    /// Head pod the serve config was last submitted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_submitted_to: Option<String>,
}

impl ClusterSlot {
    pub fn new(cluster_name: String, config_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            cluster_name,
            config_hash,
            cluster_state: ClusterState::Uninitialized,
            created_at: now,
            healthy_polls: 0,
            healthy_since: None,
            unhealthy_polls: 0,
            config_submitted_to: None,
        }
    }
}

/// A former active cluster waiting out the drain grace period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetiringCluster {
    pub cluster_name: String,
    pub delete_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<ClusterSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<ClusterSlot>,
    #[serde(default)]
    pub num_serve_endpoints: i32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub applications: BTreeMap<String, ApplicationStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retiring: Vec<RetiringCluster>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    #[serde(default)]
    pub failed_upgrades: u32,
    /// Earliest time a failed upgrade may be attempted again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

impl ServiceStatus {
    /// Names of every cluster this service currently owns.
    pub fn owned_clusters(&self) -> Vec<&str> {
        self.active
            .iter()
            .chain(self.pending.iter())
            .map(|slot| slot.cluster_name.as_str())
            .chain(self.retiring.iter().map(|retiring| retiring.cluster_name.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RayService {
    pub name: QualifiedName,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub spec: ServiceSpec,
    pub status: Option<ServiceStatus>,
}

impl RayService {
    pub fn new(name: QualifiedName, spec: ServiceSpec) -> Self {
        Self {
            name,
            uid: None,
            resource_version: None,
            spec,
            status: None,
        }
    }

    /// Reference placed on the clusters and serve route this service owns.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let uid = self.uid.as_deref()?;
        Some(controller_reference(SERVICE_KIND, &self.name.name, uid))
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Content-addressed name of the cluster serving `config_hash`.
    pub fn cluster_name(&self, config_hash: &str) -> String {
        let short = &config_hash[..config_hash.len().min(8)];
        format!("{}-{short}", self.name.name)
    }

    pub fn serve_route(&self) -> QualifiedName {
        self.name.sibling(format!("{}-serve-svc", self.name.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::cluster::fixtures;

    fn spec(config: &str) -> ServiceSpec {
        ServiceSpec {
            cluster: fixtures::spec(vec![fixtures::group("small", 1, 0, 4)]),
            serve_config: config.into(),
        }
    }

    #[test]
    fn hash_tracks_serve_config() {
        let a = spec("applications: [{name: fruit}]");
        let b = spec("applications: [{name: veg}]");
        assert_eq!(a.config_hash().unwrap(), a.clone().config_hash().unwrap());
        assert_ne!(a.config_hash().unwrap(), b.config_hash().unwrap());
    }

    #[test]
    fn hash_tracks_cluster_template() {
        let a = spec("applications: []");
        let mut b = a.clone();
        b.cluster.worker_groups[0].template = fixtures::template("rayproject/ray:2.10.0");
        assert_ne!(a.config_hash().unwrap(), b.config_hash().unwrap());
    }

    #[test]
    fn cluster_names_are_content_addressed() {
        let service = RayService::new(QualifiedName::new("ml", "fruit"), spec("x"));
        assert_eq!(service.cluster_name("0123456789abcdef"), "fruit-01234567");
        assert_eq!(service.serve_route().name, "fruit-serve-svc");
    }

    #[test]
    fn unknown_app_phases_are_tolerated() {
        let phase: AppPhase = serde_json::from_str("\"NOT_STARTED\"").unwrap();
        assert_eq!(phase, AppPhase::Unknown);
        let phase: AppPhase = serde_json::from_str("\"DEPLOY_FAILED\"").unwrap();
        assert_eq!(phase, AppPhase::DeployFailed);
    }

    #[test]
    fn empty_serve_config_is_invalid() {
        assert!(spec("  ").validate().unwrap_err().is_permanent());
    }

    #[test]
    fn malformed_serve_config_is_invalid() {
        let err = spec("applications: [{name: fruit").validate().unwrap_err();
        assert!(matches!(err, Error::SpecValidation(msg) if msg.contains("YAML")));
    }
}
