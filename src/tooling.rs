//! Support for operator tooling: port forwarding and log collection.
//!
//! These helpers resolve names and paths only; moving bytes is left to the
//! command-line front end.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::api::KubeApi;
use crate::resource::cluster::head_service_name;
use crate::resource::{QualifiedName, Role, CLIENT_PORT, DASHBOARD_PORT, SERVE_PORT};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Cluster,
    Service,
}

/// A `TYPE/NAME` or bare `NAME` reference typed by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: RefKind,
    pub name: String,
}

impl FromStr for ResourceRef {
    type Err = Error;

    /// A bare name refers to a cluster.
    fn from_str(s: &str) -> Result<Self, Error> {
        let (kind, name) = match s.split_once('/') {
            None => (RefKind::Cluster, s),
            Some((kind, name)) => {
                let kind = match kind.to_ascii_lowercase().as_str() {
                    "raycluster" | "rayclusters" => RefKind::Cluster,
                    "rayservice" | "rayservices" => RefKind::Service,
                    other => {
                        return Err(Error::validation(format!("unsupported resource type: {other}")))
                    }
                };
                (kind, name)
            }
        };
        if name.is_empty() || name.contains('/') {
            return Err(Error::validation(format!("invalid resource reference: {s:?}")));
        }
        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }
}

impl ResourceRef {
    pub fn parse(s: &str) -> Result<Self, Error> {
        s.parse()
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RefKind::Cluster => "raycluster",
            RefKind::Service => "rayservice",
        };
        write!(f, "{kind}/{}", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardPort {
    pub name: &'static str,
    pub port: i32,
}

/// The routing object to forward to and the ports to open locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardPlan {
    pub service: QualifiedName,
    pub ports: Vec<ForwardPort>,
}

const DASHBOARD: ForwardPort = ForwardPort {
    name: "Ray Dashboard",
    port: DASHBOARD_PORT,
};
const CLIENT: ForwardPort = ForwardPort {
    name: "Ray Interactive Client",
    port: CLIENT_PORT,
};
const SERVE: ForwardPort = ForwardPort {
    name: "Ray Serve",
    port: SERVE_PORT,
};

/// Resolves the head routing object behind `target`.
///
/// A service resolves to the head of its active cluster.
pub async fn port_forward_plan<A: KubeApi + ?Sized>(
    api: &A,
    namespace: &str,
    target: &ResourceRef,
) -> Result<PortForwardPlan, Error> {
    let name = QualifiedName::new(namespace, target.name.clone());
    match target.kind {
        RefKind::Cluster => {
            if api.get_cluster(&name).await?.is_none() {
                return Err(Error::validation(format!("raycluster {name} not found")));
            }
            Ok(PortForwardPlan {
                service: name.sibling(head_service_name(&name.name)),
                ports: vec![DASHBOARD, CLIENT],
            })
        }
        RefKind::Service => {
            let service = api
                .get_service(&name)
                .await?
                .ok_or_else(|| Error::validation(format!("rayservice {name} not found")))?;
            let active = service
                .status
                .and_then(|status| status.active)
                .ok_or_else(|| {
                    Error::transient(format!("rayservice {name} has no active cluster yet"))
                })?;
            Ok(PortForwardPlan {
                service: name.sibling(head_service_name(&active.cluster_name)),
                ports: vec![DASHBOARD, SERVE],
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeFilter {
    #[default]
    Head,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    pub pod: String,
    /// Where the pod's stdout lands, relative to the output directory.
    pub path: PathBuf,
}

/// Pods of `cluster` whose logs should be collected, sorted by name.
pub async fn log_targets<A: KubeApi + ?Sized>(
    api: &A,
    cluster: &QualifiedName,
    filter: NodeFilter,
) -> Result<Vec<LogTarget>, Error> {
    let mut pods = api.list_pods(cluster).await?;
    pods.retain(|pod| filter == NodeFilter::All || pod.role == Role::Head);
    pods.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(pods
        .into_iter()
        .map(|pod| LogTarget {
            path: Path::new(&pod.name).join("stdout.log"),
            pod: pod.name,
        })
        .collect())
}

/// Where an entry of a pod's log archive is unpacked.
///
/// Entries that would land outside the pod's directory are rejected.
pub fn archive_entry_path(pod: &str, entry: &str) -> Result<PathBuf, Error> {
    let mut path = PathBuf::from(pod);
    for component in Path::new(entry).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::validation(format!(
                    "archive entry {entry:?} escapes the pod directory"
                )));
            }
        }
    }
    Ok(path)
}
