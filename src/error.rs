//! Error taxonomy shared by both reconcilers.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while reconciling a single resource key.
///
/// Every variant is scoped to the key being reconciled; the runner decides
/// between requeueing with backoff and waiting for a spec change through
/// [`Error::is_permanent`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Network failure, rate limiting or a server-side error from the orchestration API.
    #[error("transient api error: {0}")]
    TransientApi(String),

    /// Optimistic-concurrency version mismatch; retried with a fresh read.
    #[error("resource conflict: {0}")]
    Conflict(String),

    /// The declared spec is malformed or contradictory.
    #[error("spec validation error: {0}")]
    SpecValidation(String),

    /// The cluster's dashboard could not be reached or returned a non-2xx status.
    #[error("dashboard unreachable at {address}: {reason}")]
    DashboardUnreachable { address: String, reason: String },

    /// A pod keeps failing to schedule or start.
    #[error("pod scheduling failure in {group}: {reason}")]
    PodScheduling { group: String, reason: String },

    /// Object (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A single call or the whole reconcile pass ran past its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientApi(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::SpecValidation(msg.into())
    }

    pub fn dashboard(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::DashboardUnreachable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors worth retrying in place with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientApi(_) | Self::DashboardUnreachable { .. } | Self::Timeout(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Errors that no amount of retrying fixes until the declared spec changes.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::SpecValidation(_) | Self::Serialization(_))
    }
}

impl From<kube_client::Error> for Error {
    fn from(err: kube_client::Error) -> Self {
        match &err {
            kube_client::Error::Api(response) => match response.code {
                409 => Self::Conflict(response.message.clone()),
                400 | 422 => Self::SpecValidation(response.message.clone()),
                _ => Self::TransientApi(err.to_string()),
            },
            _ => Self::TransientApi(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use kube_core::ErrorResponse;

    use super::*;

    fn api_error(code: u16) -> kube_client::Error {
        kube_client::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn version_mismatch_maps_to_conflict() {
        let err = Error::from(api_error(409));
        assert!(err.is_conflict());
        assert!(!err.is_transient());
    }

    #[test]
    fn rejected_objects_are_permanent() {
        assert!(Error::from(api_error(422)).is_permanent());
        assert!(Error::from(api_error(400)).is_permanent());
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(Error::from(api_error(500)).is_transient());
        assert!(Error::from(api_error(429)).is_transient());
    }

    #[test]
    fn unreachable_dashboard_is_retried_not_escalated() {
        let err = Error::dashboard("10.0.0.1:8265", "connection refused");
        assert!(err.is_transient());
        assert!(!err.is_permanent());
        assert!(err.to_string().contains("10.0.0.1:8265"));
    }
}
