//! Ephemeral cluster lifecycle
//!
//! - [`ClusterHandle`] records everything a run allocated: the network, the
//!   cluster container, images loaded into it, manifests applied, and the
//!   credentials used to reach its API server.
//! - [`Provisioner`] fills a handle in: start k3s, load the subject image,
//!   apply bootstrap manifests in order, wait for the subject to be ready.
//! - [`ScopedCluster`] owns the handle for the duration of a run and
//!   guarantees its resources are released exactly once.

mod api;
mod kubeconfig;
mod provisioner;
mod scope;

pub use api::{ClusterApi, ClusterConnector, DeploymentReadiness, KubeClusterApi, KubeConnector};
pub use kubeconfig::rewrite_server;
pub use provisioner::{Provisioner, ProvisionerConfig, DEFAULT_K3S_IMAGE};
pub use scope::ScopedCluster;

#[cfg(test)]
pub(crate) use api::{MockClusterApi, MockClusterConnector};
#[cfg(test)]
pub(crate) use provisioner::tests as fixtures;

use std::fmt;

use crate::{Error, Result};

/// Connection material for the cluster API server
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// API server URL reachable from the host
    pub server: String,
    /// Kubeconfig YAML pointing at `server`
    pub kubeconfig: String,
}

// Keep client certificates out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server", &self.server)
            .field("kubeconfig", &"<redacted>")
            .finish()
    }
}

/// The subject's deployment inside the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectDeployment {
    /// Namespace of the deployment
    pub namespace: String,
    /// Deployment name
    pub name: String,
}

impl fmt::Display for SubjectDeployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One ephemeral cluster instance.
///
/// Fields are filled in as provisioning progresses, so a handle from a failed
/// provision still names whatever was allocated before the failure.
#[derive(Debug, Clone, Default)]
pub struct ClusterHandle {
    /// Unique name for this run's resources
    pub name: String,
    /// Network created for the cluster
    pub network: Option<String>,
    /// Cluster container id (its name until the runtime reports the id)
    pub container: Option<String>,
    /// Cluster container address on its network
    pub node_ip: Option<String>,
    /// Images imported into the cluster image store
    pub loaded_images: Vec<String>,
    /// Applied manifest references, in apply order
    pub applied_manifests: Vec<String>,
    /// API server credentials, once the API server is up
    pub credentials: Option<Credentials>,
}

impl ClusterHandle {
    /// Create an empty handle for a run
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Credentials, or an error if the API server never came up
    pub fn credentials(&self) -> Result<&Credentials> {
        self.credentials.as_ref().ok_or_else(|| {
            Error::provision("credentials", format!("cluster {} has no credentials", self.name))
        })
    }

    /// Address at which the subject accepts traffic on `port`
    pub fn subject_endpoint(&self, port: u16) -> Result<SubjectEndpoint> {
        let host = self.node_ip.clone().ok_or_else(|| {
            Error::provision("network", format!("cluster {} has no node address", self.name))
        })?;
        Ok(SubjectEndpoint { host, port })
    }

    /// Whether any runtime resource is still held
    pub fn holds_resources(&self) -> bool {
        self.network.is_some() || self.container.is_some()
    }
}

/// Externally reachable address of the deployed subject
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectEndpoint {
    /// Host or IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl SubjectEndpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `http://host:port` followed by `path`
    pub fn http_url(&self, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("http://{}{}", self, path)
    }
}

impl fmt::Display for SubjectEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
