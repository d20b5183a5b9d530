//! Cluster API operations used during provisioning
//!
//! Provisioning needs three things from the API server: apply a document,
//! wait for a CRD to be established, and read the subject deployment's
//! availability. They sit behind [`ClusterApi`] so the provisioner can be
//! exercised without a cluster.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::Credentials;
use crate::client::rest_config;
use crate::manifest::ManifestDoc;
use crate::retry::{poll_until, retry_with_backoff, Probe, RetryConfig};
use crate::{Error, Result, FIELD_MANAGER};

const CONDITION_AVAILABLE: &str = "Available";
const CONDITION_ESTABLISHED: &str = "Established";
const CRD_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Availability of the subject deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentReadiness {
    /// `Available=True`
    Available,
    /// Present but not available; carries the condition reason and message
    Unavailable(String),
    /// Not created yet
    Missing,
}

/// API server operations needed by the provisioner.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Server-side apply a single document
    async fn apply(&self, doc: &ManifestDoc) -> Result<()>;

    /// Wait until a CRD reports `Established=True`
    async fn wait_for_crd(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Read the availability of a deployment
    async fn deployment_readiness(&self, namespace: &str, name: &str)
        -> Result<DeploymentReadiness>;
}

/// Opens a [`ClusterApi`] once credentials exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to the API server described by `credentials`
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ClusterApi>>;
}

/// Connector producing [`KubeClusterApi`] instances
#[derive(Debug, Clone, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ClusterApi>> {
        let config = rest_config(credentials).await?;
        let client = Client::try_from(config)?;
        Ok(Arc::new(KubeClusterApi::new(client)))
    }
}

/// [`ClusterApi`] over a kube-rs client.
///
/// Resource types are resolved through API discovery. The discovery snapshot
/// is cached and refreshed when a kind is not found, which is what happens
/// right after a CRD is applied.
pub struct KubeClusterApi {
    client: Client,
    discovery: Mutex<Option<Discovery>>,
}

impl KubeClusterApi {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: Mutex::new(None),
        }
    }

    async fn run_discovery(&self) -> Result<Discovery> {
        let client = self.client.clone();
        retry_with_backoff(&RetryConfig::default(), "api-discovery", || {
            let client = client.clone();
            async move { Discovery::new(client).run().await }
        })
        .await
        .map_err(Error::from)
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities)> {
        let mut cached = self.discovery.lock().await;

        if let Some(found) = cached.as_ref().and_then(|d| d.resolve_gvk(gvk)) {
            return Ok(found);
        }

        trace!(kind = %gvk.kind, "refreshing API discovery");
        let discovery = self.run_discovery().await?;
        let found = discovery.resolve_gvk(gvk);
        *cached = Some(discovery);

        found.ok_or_else(|| {
            Error::provision(
                "manifest",
                format!(
                    "unknown resource type {}/{} {}",
                    gvk.group, gvk.version, gvk.kind
                ),
            )
        })
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn apply(&self, doc: &ManifestDoc) -> Result<()> {
        let (group, version) = doc.group_version();
        let gvk = GroupVersionKind::gvk(&group, &version, &doc.kind);
        let (resource, caps) = self.resolve(&gvk).await?;

        let api: Api<DynamicObject> = match caps.scope {
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                doc.namespace.as_deref().unwrap_or("default"),
                &resource,
            ),
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        };

        api.patch(
            &doc.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&doc.value),
        )
        .await
        .map_err(|e| {
            Error::provision(
                "manifest",
                format!("failed to apply {}: {}", doc.reference(), e),
            )
        })?;

        debug!(manifest = %doc.reference(), "applied");
        Ok(())
    }

    async fn wait_for_crd(&self, name: &str, timeout: Duration) -> Result<()> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());

        poll_until(timeout, CRD_POLL_INTERVAL, name, || {
            let crds = crds.clone();
            async move {
                match crds.get_opt(name).await {
                    Ok(Some(crd)) => {
                        let established = crd
                            .status
                            .as_ref()
                            .and_then(|s| s.conditions.as_ref())
                            .is_some_and(|conditions| {
                                conditions.iter().any(|c| {
                                    c.type_ == CONDITION_ESTABLISHED && c.status == "True"
                                })
                            });
                        if established {
                            Ok(Probe::Ready(()))
                        } else {
                            Ok(Probe::Pending(Some("not established".into())))
                        }
                    }
                    Ok(None) => Ok(Probe::Pending(Some("not found".into()))),
                    Err(e) => Ok(Probe::Pending(Some(e.to_string()))),
                }
            }
        })
        .await
        .map_err(|e| Error::provision("manifest", format!("CRD {} not established: {}", name, e)))
    }

    async fn deployment_readiness(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentReadiness> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let Some(deployment) = deployments.get_opt(name).await? else {
            return Ok(DeploymentReadiness::Missing);
        };
        Ok(readiness_of(&deployment))
    }
}

/// Derive readiness from a deployment's `Available` condition
pub(crate) fn readiness_of(deployment: &Deployment) -> DeploymentReadiness {
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == CONDITION_AVAILABLE));

    match available {
        Some(c) if c.status == "True" => DeploymentReadiness::Available,
        Some(c) => {
            let reason = c.reason.as_deref().unwrap_or("Unknown");
            let detail = match c.message.as_deref() {
                Some(message) => format!("{}: {}", reason, message),
                None => reason.to_string(),
            };
            DeploymentReadiness::Unavailable(detail)
        }
        None => DeploymentReadiness::Unavailable("no Available condition reported".to_string()),
    }
}
