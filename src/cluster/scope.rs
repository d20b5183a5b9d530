//! Scoped ownership of an ephemeral cluster
//!
//! A [`ScopedCluster`] is created before anything is allocated and owns the
//! [`ClusterHandle`] for the rest of the run. [`ScopedCluster::finalize`]
//! captures diagnostics when asked and releases the network and container.
//! Release happens exactly once: ids are taken out of the handle as they are
//! released. If the scope is dropped without being finalized (panic, cancelled
//! future) the `Drop` impl schedules the release on the current runtime.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::{ClusterHandle, SubjectDeployment};
use crate::diagnostics::DiagnosticsBundle;
use crate::runtime::ContainerRuntime;

/// Owner of one run's cluster resources
pub struct ScopedCluster {
    runtime: Arc<dyn ContainerRuntime>,
    handle: ClusterHandle,
    subject: SubjectDeployment,
}

impl ScopedCluster {
    /// Take ownership of an (empty) handle
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        handle: ClusterHandle,
        subject: SubjectDeployment,
    ) -> Self {
        Self {
            runtime,
            handle,
            subject,
        }
    }

    /// The owned handle
    pub fn handle(&self) -> &ClusterHandle {
        &self.handle
    }

    /// Mutable access for the provisioner
    pub fn handle_mut(&mut self) -> &mut ClusterHandle {
        &mut self.handle
    }

    /// Capture diagnostics if requested, then release every resource.
    ///
    /// Diagnostics are best effort and never prevent release. Returns the
    /// bundle so the caller can surface it; it is `None` when not captured.
    pub async fn finalize(mut self, run_failed: bool, verbose: bool) -> Option<DiagnosticsBundle> {
        let bundle = if run_failed || verbose {
            let bundle =
                DiagnosticsBundle::capture(self.runtime.as_ref(), &self.handle, &self.subject)
                    .await;
            bundle.emit();
            Some(bundle)
        } else {
            None
        };

        self.release().await;
        bundle
    }

    /// Release the container then the network; each id is released at most once
    async fn release(&mut self) {
        if let Some(container) = self.handle.container.take() {
            match self.runtime.remove_container(&container).await {
                Ok(()) => info!(container = %container, "cluster container removed"),
                Err(e) => error!(container = %container, error = %e, "failed to remove cluster container"),
            }
        }
        if let Some(network) = self.handle.network.take() {
            match self.runtime.remove_network(&network).await {
                Ok(()) => info!(network = %network, "cluster network removed"),
                Err(e) => error!(network = %network, error = %e, "failed to remove cluster network"),
            }
        }
        self.handle.credentials = None;
    }
}

impl Drop for ScopedCluster {
    fn drop(&mut self) {
        if !self.handle.holds_resources() {
            return;
        }

        let container = self.handle.container.take();
        let network = self.handle.network.take();
        let runtime = self.runtime.clone();
        warn!(cluster = %self.handle.name, "cluster scope dropped without finalize; releasing");

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Some(container) = container {
                        if let Err(e) = runtime.remove_container(&container).await {
                            error!(container = %container, error = %e, "failed to remove cluster container");
                        }
                    }
                    if let Some(network) = network {
                        if let Err(e) = runtime.remove_network(&network).await {
                            error!(network = %network, error = %e, "failed to remove cluster network");
                        }
                    }
                });
            }
            Err(_) => error!(
                container = ?container,
                network = ?network,
                "no async runtime available; cluster resources leaked"
            ),
        }
    }
}
