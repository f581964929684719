//! Client for the serve endpoints of a cluster's dashboard.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::DashboardConfig;
use crate::resource::{AppPhase, ApplicationStatus};
use crate::Error;

const APPLICATIONS_PATH: &str = "/api/serve/applications/";

/// Application health of one cluster, as of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeStatus {
    pub applications: BTreeMap<String, ApplicationStatus>,
    pub endpoints: i32,
}

impl ServeStatus {
    /// True iff at least one application is reported and all of them are RUNNING.
    pub fn all_apps_running(&self) -> bool {
        all_apps_running(&self.applications)
    }

    pub fn any_in(&self, phase: AppPhase) -> bool {
        self.applications.values().any(|app| app.phase == phase)
    }
}

pub fn all_apps_running(applications: &BTreeMap<String, ApplicationStatus>) -> bool {
    !applications.is_empty()
        && applications
            .values()
            .all(|app| app.phase == AppPhase::Running)
}

#[async_trait]
pub trait DashboardClient: Send + Sync + 'static {
    /// Any network failure or non-2xx answer is [`Error::DashboardUnreachable`].
    async fn application_statuses(&self, head_address: &str) -> Result<ServeStatus, Error>;

    /// Submits the serve config (YAML or JSON) to be deployed on the cluster.
    async fn deploy_config(&self, head_address: &str, serve_config: &str) -> Result<(), Error>;
}

#[derive(Debug, Deserialize)]
struct ApplicationsResponse {
    #[serde(default)]
    applications: BTreeMap<String, ApplicationDetails>,
}

#[derive(Debug, Deserialize)]
struct ApplicationDetails {
    status: AppPhase,
    #[serde(default)]
    message: String,
    /// Route endpoint count, when the dashboard reports it directly.
    #[serde(default)]
    endpoints: Option<i32>,
    #[serde(default)]
    deployments: BTreeMap<String, DeploymentDetails>,
}

#[derive(Debug, Deserialize)]
struct DeploymentDetails {
    #[serde(default)]
    replica_states: BTreeMap<String, i32>,
}

impl ApplicationDetails {
    fn endpoints(&self) -> i32 {
        self.endpoints.unwrap_or_else(|| {
            self.deployments
                .values()
                .filter_map(|deployment| deployment.replica_states.get("RUNNING"))
                .sum()
        })
    }
}

/// Parses a `GET /api/serve/applications/` body.
pub fn parse_applications(body: &[u8]) -> Result<ServeStatus, serde_json::Error> {
    let response: ApplicationsResponse = serde_json::from_slice(body)?;
    let mut status = ServeStatus::default();
    for (name, details) in response.applications {
        let endpoints = details.endpoints();
        status.endpoints += endpoints;
        status.applications.insert(
            name.clone(),
            ApplicationStatus {
                name,
                phase: details.status,
                message: details.message,
                endpoints,
            },
        );
    }
    Ok(status)
}

/// [`DashboardClient`] speaking HTTP to the head pod.
#[derive(Debug, Clone)]
pub struct HttpDashboardClient {
    http: reqwest::Client,
}

impl HttpDashboardClient {
    pub fn new(config: &DashboardConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| Error::transient(format!("building dashboard client: {err}")))?;
        Ok(Self { http })
    }

    fn url(head_address: &str) -> String {
        format!("http://{head_address}{APPLICATIONS_PATH}")
    }
}

#[async_trait]
impl DashboardClient for HttpDashboardClient {
    async fn application_statuses(&self, head_address: &str) -> Result<ServeStatus, Error> {
        let response = self
            .http
            .get(Self::url(head_address))
            .send()
            .await
            .map_err(|err| Error::dashboard(head_address, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::dashboard(head_address, format!("HTTP {status}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| Error::dashboard(head_address, err))?;
        parse_applications(&body).map_err(|err| Error::dashboard(head_address, err))
    }

    async fn deploy_config(&self, head_address: &str, serve_config: &str) -> Result<(), Error> {
        let config: serde_json::Value = serde_yaml::from_str(serve_config)
            .map_err(|err| Error::validation(format!("serve config is not valid YAML: {err}")))?;
        let response = self
            .http
            .put(Self::url(head_address))
            .json(&config)
            .send()
            .await
            .map_err(|err| Error::dashboard(head_address, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::dashboard(head_address, format!("HTTP {status}")));
        }
        Ok(())
    }
}
