//! Pre-flight readiness probe against the subject's HTTP endpoint

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::cluster::SubjectEndpoint;
use crate::retry::{poll_until, Probe};
use crate::{Error, Result};

/// Port the subject serves its readiness endpoint on
pub const DEFAULT_PROBE_PORT: u16 = 9000;
/// Readiness endpoint path
pub const DEFAULT_PROBE_PATH: &str = "/api/entrypoints";
/// Body substring that marks the subject ready
pub const DEFAULT_READY_MARKER: &str = r#""name":"web""#;

/// Readiness probe settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Path requested on the endpoint
    pub path: String,
    /// Substring the body must contain
    pub ready_marker: String,
    /// Total time allowed
    pub timeout: Duration,
    /// Delay between attempts
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PROBE_PATH.to_string(),
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(500),
        }
    }
}

/// Waits until the subject accepts traffic
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SubjectProbe: Send + Sync {
    /// Resolve once the endpoint is ready, or fail with `SubjectUnreachable`
    async fn wait_ready(&self, endpoint: &SubjectEndpoint) -> Result<()>;
}

/// HTTP GET probe
#[derive(Debug, Clone)]
pub struct HttpProbe {
    config: ProbeConfig,
    http: reqwest::Client,
}

impl HttpProbe {
    /// Build a probe with the given settings
    pub fn new(config: ProbeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.interval.max(Duration::from_secs(1)))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    /// Probe settings
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }
}

#[async_trait]
impl SubjectProbe for HttpProbe {
    async fn wait_ready(&self, endpoint: &SubjectEndpoint) -> Result<()> {
        let url = endpoint.http_url(&self.config.path);
        let marker = self.config.ready_marker.as_str();
        info!(url = %url, "probing subject endpoint");

        poll_until(
            self.config.timeout,
            self.config.interval,
            "subject endpoint",
            || {
                let request = self.http.get(&url);
                async move {
                    let response = match request.send().await {
                        Ok(response) => response,
                        Err(e) => return Ok(Probe::Pending(Some(e.to_string()))),
                    };
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if status.is_success() && body.contains(marker) {
                        Ok(Probe::Ready(()))
                    } else {
                        debug!(status = %status, "subject endpoint not ready");
                        Ok(Probe::Pending(Some(format!(
                            "status {}, body missing {}",
                            status, marker
                        ))))
                    }
                }
            },
        )
        .await
        .map_err(|e| Error::subject_unreachable(endpoint.to_string(), e.to_string()))?;

        info!(endpoint = %endpoint, "subject endpoint ready");
        Ok(())
    }
}
