//! Post-mortem diagnostics
//!
//! Collected on failure (or when the operator always wants logs) right before
//! teardown: the k3s server log and the subject deployment's log. Capture is
//! best effort; whatever cannot be read is logged and skipped.

use tracing::{info, warn};

use crate::cluster::{ClusterHandle, SubjectDeployment};
use crate::runtime::{command, ContainerRuntime};

/// Log text captured from a cluster and its subject
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsBundle {
    /// Name of the cluster the logs came from
    pub cluster: String,
    /// Cluster container log
    pub cluster_logs: Option<String>,
    /// Subject deployment log
    pub subject_logs: Option<String>,
}

impl DiagnosticsBundle {
    /// Capture cluster and subject logs; never fails
    pub async fn capture<R>(
        runtime: &R,
        handle: &ClusterHandle,
        subject: &SubjectDeployment,
    ) -> Self
    where
        R: ContainerRuntime + ?Sized,
    {
        let mut bundle = Self {
            cluster: handle.name.clone(),
            ..Default::default()
        };

        let Some(container) = handle.container.as_deref() else {
            warn!(cluster = %handle.name, "no cluster container; skipping diagnostics");
            return bundle;
        };

        match runtime.logs(container).await {
            Ok(logs) => bundle.cluster_logs = Some(logs),
            Err(e) => warn!(cluster = %handle.name, error = %e, "failed to capture cluster logs"),
        }

        let deployment = format!("deployments/{}", subject.name);
        let cmd = command(&["kubectl", "logs", "-n", &subject.namespace, &deployment]);
        match runtime.exec(container, &cmd).await {
            Ok(out) if out.success() => bundle.subject_logs = Some(out.stdout),
            Ok(out) => warn!(
                subject = %subject,
                exit_code = out.exit_code,
                stderr = %out.stderr.trim(),
                "failed to capture subject logs"
            ),
            Err(e) => warn!(subject = %subject, error = %e, "failed to capture subject logs"),
        }

        bundle
    }

    /// Whether nothing was captured
    pub fn is_empty(&self) -> bool {
        self.cluster_logs.is_none() && self.subject_logs.is_none()
    }

    /// Surface the captured text to the operator
    pub fn emit(&self) {
        if let Some(logs) = &self.cluster_logs {
            info!(cluster = %self.cluster, "cluster logs:\n{}", logs);
        }
        if let Some(logs) = &self.subject_logs {
            info!(cluster = %self.cluster, "subject logs:\n{}", logs);
        }
    }
}
