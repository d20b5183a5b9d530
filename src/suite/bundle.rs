//! Filesystem-backed test registry
//!
//! A bundle is a directory with a `registry.yaml` index:
//!
//! ```yaml
//! apiVersion: v1.3.0
//! channel: experimental
//! baseManifests:
//!   - base/infra.yaml
//! schemas:
//!   - group: gateway.networking.k8s.io
//!     version: v1alpha3
//!     kind: BackendTLSPolicy
//! tests:
//!   - name: HTTPRouteSimpleSameNamespace
//!     profiles: [GATEWAY-HTTP]
//!     features: [Gateway, HTTPRoute]
//!     manifests: [tests/httproute-simple-same-namespace.yaml]
//!     expect:
//!       port: 80
//!       path: /
//!       host: example.com
//!       status: 200
//! ```
//!
//! Every test applies its manifests, polls one HTTP request against the
//! subject until the expectation holds, then deletes what it applied.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ConformanceTest, Feature, ProfileName, RegistryVersion, TestContext, TestRegistry};
use crate::client::{Schema, SchemaRegistry};
use crate::cluster::SubjectEndpoint;
use crate::manifest::{BootstrapManifest, ManifestDoc};
use crate::retry::{poll_until, Probe};
use crate::{Error, Result};

/// Name of the index file inside a bundle directory
pub const INDEX_FILE: &str = "registry.yaml";

/// Per-request timeout for expectation checks
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryIndex {
    api_version: String,
    channel: String,
    #[serde(default)]
    schemas: Vec<Schema>,
    #[serde(default)]
    base_manifests: Vec<PathBuf>,
    tests: Vec<TestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestEntry {
    name: String,
    #[serde(default)]
    description: String,
    profiles: BTreeSet<ProfileName>,
    #[serde(default)]
    features: BTreeSet<Feature>,
    #[serde(default)]
    manifests: Vec<PathBuf>,
    expect: HttpExpectation,
}

/// One HTTP request and the response it must eventually produce
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpExpectation {
    /// Port to send the request to; defaults to the subject endpoint's port
    #[serde(default)]
    pub port: Option<u16>,
    /// Request path
    #[serde(default = "default_path")]
    pub path: String,
    /// `Host` header override
    #[serde(default)]
    pub host: Option<String>,
    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Expected status code
    #[serde(default = "default_status")]
    pub status: u16,
    /// Substring the response body must contain
    #[serde(default)]
    pub body_contains: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_status() -> u16 {
    200
}

impl HttpExpectation {
    /// Compare an observed response; `Err` describes the mismatch
    pub fn check(&self, status: u16, body: &str) -> std::result::Result<(), String> {
        if status != self.status {
            return Err(format!("expected status {}, got {}", self.status, status));
        }
        if let Some(needle) = &self.body_contains {
            if !body.contains(needle.as_str()) {
                return Err(format!("response body does not contain {:?}", needle));
            }
        }
        Ok(())
    }
}

/// A declarative test: apply manifests, then poll one HTTP expectation
#[derive(Debug, Clone)]
pub struct HttpExpectationTest {
    name: String,
    description: String,
    profiles: BTreeSet<ProfileName>,
    features: BTreeSet<Feature>,
    manifests: Vec<ManifestDoc>,
    expectation: HttpExpectation,
    http: reqwest::Client,
}

impl HttpExpectationTest {
    /// Build a test from its parts
    pub fn new(
        name: impl Into<String>,
        profiles: BTreeSet<ProfileName>,
        features: BTreeSet<Feature>,
        manifests: Vec<ManifestDoc>,
        expectation: HttpExpectation,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::registry(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            description: String::new(),
            profiles,
            features,
            manifests,
            expectation,
            http,
        })
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Manifests applied before the expectation is checked
    pub fn manifests(&self) -> &[ManifestDoc] {
        &self.manifests
    }

    /// The expectation this test polls for
    pub fn expectation(&self) -> &HttpExpectation {
        &self.expectation
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.get(url);
        if let Some(host) = &self.expectation.host {
            request = request.header(reqwest::header::HOST, host);
        }
        for (name, value) in &self.expectation.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    async fn await_expectation(&self, ctx: &TestContext) -> std::result::Result<(), String> {
        let url = match self.expectation.port {
            Some(port) => SubjectEndpoint::new(ctx.endpoint.host.clone(), port),
            None => ctx.endpoint.clone(),
        }
        .http_url(&self.expectation.path);
        let description = format!("{} to answer {}", url, self.expectation.status);

        poll_until(ctx.timeout, ctx.poll_interval, &description, || {
            let request = self.request(&url);
            async move {
                let response = match request.send().await {
                    Ok(response) => response,
                    Err(e) => return Ok(Probe::Pending(Some(e.to_string()))),
                };
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Ok(match self.expectation.check(status, &body) {
                    Ok(()) => Probe::Ready(()),
                    Err(mismatch) => Probe::Pending(Some(mismatch)),
                })
            }
        })
        .await
        .map_err(|e| format!("GET {}: {}", url, e))
    }
}

#[async_trait]
impl ConformanceTest for HttpExpectationTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn profiles(&self) -> &BTreeSet<ProfileName> {
        &self.profiles
    }

    fn features(&self) -> &BTreeSet<Feature> {
        &self.features
    }

    async fn run(&self, ctx: &TestContext) -> std::result::Result<(), String> {
        let mut applied = 0;
        let mut result = Ok(());
        for doc in &self.manifests {
            if let Err(e) = ctx.client.apply(doc).await {
                result = Err(format!("failed to apply {}: {}", doc.reference(), e));
                break;
            }
            applied += 1;
        }

        if result.is_ok() {
            result = self.await_expectation(ctx).await;
        }

        for doc in self.manifests[..applied].iter().rev() {
            if let Err(e) = ctx.client.delete(doc).await {
                warn!(test = %self.name, manifest = %doc.reference(), error = %e, "cleanup failed");
            }
        }

        result
    }
}

/// Registry loaded from a bundle directory
#[derive(Debug, Clone)]
pub struct BundleRegistry {
    root: PathBuf,
    version: RegistryVersion,
    schemas: SchemaRegistry,
    base: Vec<ManifestDoc>,
    tests: Vec<Arc<HttpExpectationTest>>,
}

impl BundleRegistry {
    /// Load `<dir>/registry.yaml` and every manifest it references
    pub fn load(dir: &Path) -> Result<Self> {
        let index_path = dir.join(INDEX_FILE);
        let content = std::fs::read_to_string(&index_path).map_err(|e| {
            Error::registry(format!("failed to read {}: {}", index_path.display(), e))
        })?;
        let index: RegistryIndex = serde_yaml::from_str(&content)
            .map_err(|e| Error::registry(format!("{}: {}", index_path.display(), e)))?;

        let mut schemas = SchemaRegistry::gateway_api();
        schemas.register_all(index.schemas);

        let base = load_documents(dir, &index.base_manifests)?;

        let mut seen = BTreeSet::new();
        let mut tests = Vec::with_capacity(index.tests.len());
        for entry in index.tests {
            if !seen.insert(entry.name.clone()) {
                return Err(Error::registry(format!("duplicate test name {}", entry.name)));
            }
            if entry.profiles.is_empty() {
                return Err(Error::registry(format!(
                    "test {} belongs to no profile",
                    entry.name
                )));
            }
            let manifests = load_documents(dir, &entry.manifests)?;
            let test = HttpExpectationTest::new(
                entry.name,
                entry.profiles,
                entry.features,
                manifests,
                entry.expect,
            )?
            .with_description(entry.description);
            tests.push(Arc::new(test));
        }

        let version = RegistryVersion {
            api_version: index.api_version,
            channel: index.channel,
        };
        info!(
            bundle = %dir.display(),
            api_version = %version.api_version,
            channel = %version.channel,
            tests = tests.len(),
            "loaded test registry"
        );

        Ok(Self {
            root: dir.to_path_buf(),
            version,
            schemas,
            base,
            tests,
        })
    }

    /// Directory the bundle was loaded from
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn load_documents(dir: &Path, files: &[PathBuf]) -> Result<Vec<ManifestDoc>> {
    let mut docs = Vec::new();
    for file in files {
        let path = dir.join(file);
        let manifest = BootstrapManifest::load(&path)
            .map_err(|e| Error::registry(format!("{}: {}", path.display(), e)))?;
        debug!(manifest = %path.display(), documents = manifest.documents.len(), "loaded");
        docs.extend(manifest.documents);
    }
    Ok(docs)
}

impl TestRegistry for BundleRegistry {
    fn version(&self) -> RegistryVersion {
        self.version.clone()
    }

    fn required_schemas(&self) -> SchemaRegistry {
        self.schemas.clone()
    }

    fn base_manifests(&self) -> Vec<ManifestDoc> {
        self.base.clone()
    }

    fn tests(&self) -> Vec<Arc<dyn ConformanceTest>> {
        self.tests
            .iter()
            .map(|t| t.clone() as Arc<dyn ConformanceTest>)
            .collect()
    }
}
