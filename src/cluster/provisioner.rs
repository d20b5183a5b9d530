//! Cluster provisioner
//!
//! Brings up a single-node k3s cluster in a container and deploys the subject:
//!
//! 1. Create a dedicated bridge network
//! 2. Start the k3s server container (API port published on loopback)
//! 3. Wait for the API server to report `/readyz`
//! 4. Read the kubeconfig and point it at the published port
//! 5. Import the subject image into the cluster's containerd store
//! 6. Apply bootstrap manifests in order, waiting on each CRD
//! 7. Wait for the subject deployment to become Available
//!
//! Every resource is recorded on the [`ClusterHandle`] as soon as it exists.
//! Failures abort immediately and leave the partial state in place for
//! diagnostics; releasing it is the job of [`ScopedCluster`](super::ScopedCluster).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use super::api::{ClusterConnector, DeploymentReadiness};
use super::kubeconfig::rewrite_server;
use super::{ClusterHandle, Credentials, SubjectDeployment};
use crate::manifest::BootstrapManifest;
use crate::retry::{poll_until, retry_with_backoff, Probe, RetryConfig, WaitError};
use crate::runtime::{command, ContainerRuntime, ContainerSpec};
use crate::{Error, Result, RUN_LABEL};

/// Default k3s image
pub const DEFAULT_K3S_IMAGE: &str = "docker.io/rancher/k3s:v1.29.3-k3s1";

const K3S_API_PORT: u16 = 6443;
const K3S_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";
const IMAGE_ARCHIVE_IN_CONTAINER: &str = "/tmp/subject-image.tar";

/// Provisioner settings
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// k3s server image
    pub cluster_image: String,
    /// Subject deployment to wait for
    pub subject: SubjectDeployment,
    /// Bound on API server startup
    pub api_ready_timeout: Duration,
    /// Bound on each CRD becoming established
    pub crd_timeout: Duration,
    /// Bound on the subject deployment becoming Available
    pub subject_ready_timeout: Duration,
    /// Fixed interval between readiness polls
    pub poll_interval: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            cluster_image: DEFAULT_K3S_IMAGE.to_string(),
            subject: SubjectDeployment {
                namespace: "traefik".to_string(),
                name: "traefik".to_string(),
            },
            api_ready_timeout: Duration::from_secs(120),
            crd_timeout: Duration::from_secs(60),
            subject_ready_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Provisions ephemeral k3s clusters through a [`ContainerRuntime`]
pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    connector: Arc<dyn ClusterConnector>,
    config: ProvisionerConfig,
}

impl Provisioner {
    /// Create a provisioner
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        connector: Arc<dyn ClusterConnector>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            runtime,
            connector,
            config,
        }
    }

    /// Provisioner settings
    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Provision a cluster into `handle` and deploy the subject.
    #[instrument(skip_all, fields(cluster = %handle.name, image = %subject_image))]
    pub async fn provision(
        &self,
        handle: &mut ClusterHandle,
        manifests: &[BootstrapManifest],
        subject_image: &str,
    ) -> Result<()> {
        self.start_cluster(handle).await?;
        self.wait_for_api_server(handle).await?;
        self.fetch_credentials(handle).await?;
        self.load_image(handle, subject_image).await?;
        self.apply_manifests(handle, manifests).await?;
        self.wait_for_subject(handle).await?;
        info!("cluster provisioned and subject ready");
        Ok(())
    }

    fn labels(&self, handle: &ClusterHandle) -> BTreeMap<String, String> {
        BTreeMap::from([(RUN_LABEL.to_string(), handle.name.clone())])
    }

    async fn start_cluster(&self, handle: &mut ClusterHandle) -> Result<()> {
        let labels = self.labels(handle);

        let network = self
            .runtime
            .create_network(&handle.name, &labels)
            .await
            .map_err(|e| Error::provision("network", e.to_string()))?;
        handle.network = Some(network);

        let spec = ContainerSpec {
            name: handle.name.clone(),
            image: self.config.cluster_image.clone(),
            network: Some(handle.name.clone()),
            privileged: true,
            cgroupns_host: true,
            tmpfs: vec!["/run".to_string(), "/var/run".to_string()],
            published_ports: vec![K3S_API_PORT],
            labels,
            args: vec![
                "server".to_string(),
                "--disable=traefik".to_string(),
                "--tls-san=127.0.0.1".to_string(),
            ],
        };
        // Recorded by name first: a failed or interrupted `docker run` may
        // still have created the container
        handle.container = Some(spec.name.clone());
        let container = self
            .runtime
            .run_container(&spec)
            .await
            .map_err(|e| Error::provision("container", e.to_string()))?;
        info!(container = %container, "cluster container started");
        handle.container = Some(container.clone());

        let ip = self
            .runtime
            .container_ip(&container, &handle.name)
            .await
            .map_err(|e| Error::provision("network", e.to_string()))?;
        handle.node_ip = Some(ip);
        Ok(())
    }

    async fn wait_for_api_server(&self, handle: &ClusterHandle) -> Result<()> {
        let container = container_of(handle)?;
        let readyz = command(&["kubectl", "get", "--raw", "/readyz", "--request-timeout=5s"]);

        poll_until(
            self.config.api_ready_timeout,
            self.config.poll_interval,
            "API server",
            || {
                let readyz = readyz.clone();
                async move {
                    match self.runtime.exec(container, &readyz).await {
                        Ok(out) if out.success() => Ok(Probe::Ready(())),
                        Ok(out) => Ok(Probe::Pending(Some(out.stderr.trim().to_string()))),
                        Err(e) => Ok(Probe::Pending(Some(e.to_string()))),
                    }
                }
            },
        )
        .await
        .map_err(|e| Error::provision("api-server", format!("API server not ready: {}", e)))
    }

    async fn fetch_credentials(&self, handle: &mut ClusterHandle) -> Result<()> {
        let container = container_of(handle)?.to_string();
        let cat = command(&["cat", K3S_KUBECONFIG]);

        let raw = retry_with_backoff(&RetryConfig::default(), "read-kubeconfig", || {
            let cat = cat.clone();
            let container = container.clone();
            async move {
                let out = self.runtime.exec(&container, &cat).await?;
                if out.success() && !out.stdout.trim().is_empty() {
                    Ok(out.stdout)
                } else {
                    Err(Error::runtime(format!("kubeconfig unavailable: {}", out.stderr.trim())))
                }
            }
        })
        .await
        .map_err(|e| Error::provision("credentials", e.to_string()))?;

        let port = self
            .runtime
            .host_port(&container, K3S_API_PORT)
            .await
            .map_err(|e| Error::provision("credentials", e.to_string()))?;
        let server = format!("https://127.0.0.1:{}", port);
        let kubeconfig = rewrite_server(&raw, &server)?;

        handle.credentials = Some(Credentials { server, kubeconfig });
        Ok(())
    }

    async fn load_image(&self, handle: &mut ClusterHandle, image: &str) -> Result<()> {
        let container = container_of(handle)?.to_string();
        let staging = tempfile::tempdir()
            .map_err(|e| Error::provision("image-load", format!("no staging dir: {}", e)))?;
        let archive = staging.path().join("subject-image.tar");

        self.runtime
            .save_image(image, &archive)
            .await
            .map_err(|e| Error::provision("image-load", e.to_string()))?;
        self.runtime
            .copy_to_container(&container, &archive, IMAGE_ARCHIVE_IN_CONTAINER)
            .await
            .map_err(|e| Error::provision("image-load", e.to_string()))?;

        let import = command(&["ctr", "-n", "k8s.io", "images", "import", IMAGE_ARCHIVE_IN_CONTAINER]);
        let out = self
            .runtime
            .exec(&container, &import)
            .await
            .map_err(|e| Error::provision("image-load", e.to_string()))?;
        if !out.success() {
            return Err(Error::provision(
                "image-load",
                format!("ctr import of {} exited {}: {}", image, out.exit_code, out.stderr.trim()),
            ));
        }

        handle.loaded_images.push(image.to_string());
        info!(image = %image, "subject image loaded into cluster");
        Ok(())
    }

    async fn apply_manifests(
        &self,
        handle: &mut ClusterHandle,
        manifests: &[BootstrapManifest],
    ) -> Result<()> {
        let api = self.connector.connect(handle.credentials()?).await?;

        for manifest in manifests {
            for doc in &manifest.documents {
                api.apply(doc).await.map_err(|e| match e {
                    Error::Provision { .. } => e,
                    other => Error::provision(
                        "manifest",
                        format!("{}: {}: {}", manifest.source, doc.reference(), other),
                    ),
                })?;
                handle
                    .applied_manifests
                    .push(format!("{}: {}", manifest.source, doc.reference()));

                if doc.is_crd() {
                    api.wait_for_crd(&doc.name, self.config.crd_timeout).await?;
                }
            }
            info!(manifest = %manifest.source, documents = manifest.documents.len(), "bootstrap manifest applied");
        }
        Ok(())
    }

    async fn wait_for_subject(&self, handle: &ClusterHandle) -> Result<()> {
        let api = self.connector.connect(handle.credentials()?).await?;
        let subject = &self.config.subject;

        poll_until(
            self.config.subject_ready_timeout,
            self.config.poll_interval,
            "subject deployment",
            || {
                let api = api.clone();
                async move {
                    match api.deployment_readiness(&subject.namespace, &subject.name).await {
                        Ok(DeploymentReadiness::Available) => Ok(Probe::Ready(())),
                        Ok(DeploymentReadiness::Unavailable(reason)) => {
                            Ok(Probe::Pending(Some(reason)))
                        }
                        Ok(DeploymentReadiness::Missing) => {
                            Ok(Probe::Pending(Some("deployment not found".to_string())))
                        }
                        Err(e) => Ok(Probe::Pending(Some(e.to_string()))),
                    }
                }
            },
        )
        .await
        .map_err(|e| Error::SubjectNotReady {
            deployment: subject.to_string(),
            reason: match e {
                WaitError::Timeout {
                    last: Some(last), ..
                } => last,
                other => other.to_string(),
            },
        })
    }
}

fn container_of(handle: &ClusterHandle) -> Result<&str> {
    handle
        .container
        .as_deref()
        .ok_or_else(|| Error::provision("container", "cluster container not started"))
}
