//! Test registry plug-in surface
//!
//! Conformance tests are defined outside the harness. The harness sees them
//! only through two narrow traits:
//!
//! - [`TestRegistry`]: a versioned bundle that names its tests, the schemas
//!   they need and the shared fixtures to install before any test runs.
//! - [`ConformanceTest`]: one black-box test. It declares which profiles it
//!   belongs to and which features it needs, and runs against a
//!   [`TestContext`]. The harness never interprets what a test checks.
//!
//! [`BundleRegistry`] is a filesystem-backed registry of declarative HTTP
//! expectation tests.

mod bundle;

pub use bundle::{BundleRegistry, HttpExpectation, HttpExpectationTest};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::{ApiClient, SchemaRegistry};
use crate::cluster::SubjectEndpoint;
use crate::manifest::ManifestDoc;

/// Name of a conformance profile (e.g. `GATEWAY-HTTP`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileName(pub String);

impl ProfileName {
    /// Create a profile name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of an optional feature a test may require (e.g. `HTTPRouteQueryParamMatching`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Feature(pub String);

impl Feature {
    /// Create a feature name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Feature {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Version of the API the registry targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryVersion {
    /// API version (e.g. `v1.3.0`)
    pub api_version: String,
    /// Release channel (`standard` or `experimental`)
    pub channel: String,
}

/// Identity of the implementation under test
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    /// Organization publishing the implementation
    pub organization: String,
    /// Project name
    pub project: String,
    /// Project URL
    pub url: String,
    /// Version under test
    pub version: String,
    /// Maintainer contacts
    pub contact: Vec<String>,
}

/// Everything a test may use while running
#[derive(Debug, Clone)]
pub struct TestContext {
    /// API client with every required schema registered
    pub client: ApiClient,
    /// Where the subject accepts traffic
    pub endpoint: SubjectEndpoint,
    /// Implementation under test
    pub implementation: Implementation,
    /// Bound on any single readiness wait inside a test
    pub timeout: Duration,
    /// Interval for polls inside a test
    pub poll_interval: Duration,
}

/// One black-box conformance test
#[async_trait]
pub trait ConformanceTest: Send + Sync {
    /// Unique test name
    fn name(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str {
        ""
    }

    /// Profiles this test belongs to
    fn profiles(&self) -> &BTreeSet<ProfileName>;

    /// Features the subject must support for this test to be meaningful
    fn features(&self) -> &BTreeSet<Feature>;

    /// Whether the test only touches its own resources (safe to run alongside others)
    fn parallel(&self) -> bool {
        false
    }

    /// Exercise the subject; `Err` carries the failure diagnostic
    async fn run(&self, ctx: &TestContext) -> Result<(), String>;
}

/// A versioned, externally supplied set of conformance tests
pub trait TestRegistry: Send + Sync {
    /// API version and channel these tests target
    fn version(&self) -> RegistryVersion;

    /// Schemas the tests read or write
    fn required_schemas(&self) -> SchemaRegistry;

    /// Shared fixtures installed before any test runs
    fn base_manifests(&self) -> Vec<ManifestDoc>;

    /// All tests, in registry order
    fn tests(&self) -> Vec<Arc<dyn ConformanceTest>>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    type TestFn = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

    /// In-memory test whose behavior is a closure
    pub(crate) struct FnTest {
        pub name: String,
        pub profiles: BTreeSet<ProfileName>,
        pub features: BTreeSet<Feature>,
        pub body: TestFn,
    }

    impl FnTest {
        pub(crate) fn new(
            name: &str,
            profiles: &[&str],
            features: &[&str],
            body: impl Fn() -> Result<(), String> + Send + Sync + 'static,
        ) -> Arc<dyn ConformanceTest> {
            Arc::new(Self {
                name: name.to_string(),
                profiles: profiles.iter().map(|p| ProfileName::from(*p)).collect(),
                features: features.iter().map(|f| Feature::from(*f)).collect(),
                body: Arc::new(body),
            })
        }

        pub(crate) fn passing(name: &str, profiles: &[&str]) -> Arc<dyn ConformanceTest> {
            Self::new(name, profiles, &[], || Ok(()))
        }
    }

    #[async_trait]
    impl ConformanceTest for FnTest {
        fn name(&self) -> &str {
            &self.name
        }

        fn profiles(&self) -> &BTreeSet<ProfileName> {
            &self.profiles
        }

        fn features(&self) -> &BTreeSet<Feature> {
            &self.features
        }

        async fn run(&self, _ctx: &TestContext) -> Result<(), String> {
            (self.body)()
        }
    }

    /// In-memory registry
    pub(crate) struct StaticRegistry {
        pub tests: Vec<Arc<dyn ConformanceTest>>,
        pub base: Vec<ManifestDoc>,
    }

    impl StaticRegistry {
        pub(crate) fn new(tests: Vec<Arc<dyn ConformanceTest>>) -> Self {
            Self {
                tests,
                base: Vec::new(),
            }
        }
    }

    impl TestRegistry for StaticRegistry {
        fn version(&self) -> RegistryVersion {
            RegistryVersion {
                api_version: "v1.3.0".into(),
                channel: "experimental".into(),
            }
        }

        fn required_schemas(&self) -> SchemaRegistry {
            SchemaRegistry::core()
        }

        fn base_manifests(&self) -> Vec<ManifestDoc> {
            self.base.clone()
        }

        fn tests(&self) -> Vec<Arc<dyn ConformanceTest>> {
            self.tests.clone()
        }
    }

    #[test]
    fn names_order_lexicographically() {
        let mut profiles = vec![
            ProfileName::from("GATEWAY-TLS"),
            ProfileName::from("GATEWAY-GRPC"),
            ProfileName::from("GATEWAY-HTTP"),
        ];
        profiles.sort();
        assert_eq!(
            profiles.iter().map(ProfileName::as_str).collect::<Vec<_>>(),
            vec!["GATEWAY-GRPC", "GATEWAY-HTTP", "GATEWAY-TLS"]
        );
    }

    #[test]
    fn implementation_serializes_camel_case() {
        let implementation = Implementation {
            organization: "traefik".into(),
            project: "traefik".into(),
            url: "https://traefik.io/".into(),
            version: "v3.4".into(),
            contact: vec!["@traefik/maintainers".into()],
        };
        let json = serde_json::to_value(&implementation).unwrap();
        assert_eq!(json["url"], "https://traefik.io/");
        assert_eq!(json["contact"][0], "@traefik/maintainers");
    }
}
