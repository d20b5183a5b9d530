//! Command-line and environment configuration
//!
//! Every knob is a flag with an environment fallback so CI jobs can drive the
//! harness without a wrapper script. [`RunArgs::into_config`] validates the raw
//! arguments into a plain [`HarnessConfig`].

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::cluster::{ProvisionerConfig, SubjectDeployment};
use crate::report::{ReportFormat, DEFAULT_MODE};
use crate::runner::{ProbeConfig, RunnerConfig, TestSelection, DEFAULT_PROBE_PORT};
use crate::suite::{Feature, Implementation, ProfileName};
use crate::{Error, Result};

/// Features the default subject implements
pub const DEFAULT_SUPPORTED_FEATURES: &[&str] = &[
    "Gateway",
    "GatewayPort8080",
    "GatewayHTTPListenerIsolation",
    "ReferenceGrant",
    "HTTPRoute",
    "HTTPRouteBackendProtocolH2C",
    "HTTPRouteBackendProtocolWebSocket",
    "HTTPRouteDestinationPortMatching",
    "HTTPRouteHostRewrite",
    "HTTPRouteMethodMatching",
    "HTTPRoutePathRedirect",
    "HTTPRoutePathRewrite",
    "HTTPRoutePortRedirect",
    "HTTPRouteQueryParamMatching",
    "HTTPRouteResponseHeaderModification",
    "HTTPRouteSchemeRedirect",
    "GRPCRoute",
    "TLSRoute",
];

/// Gateway API conformance harness
#[derive(Parser, Debug)]
#[command(name = "gateway-conformance")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Run settings
    #[command(flatten)]
    pub run: RunArgs,
}

/// Settings for one conformance run
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Opt in to the run; without it the harness exits without provisioning
    #[arg(long, env = "CONFORMANCE_ENABLED")]
    pub enabled: bool,

    /// Run only the test with this exact name
    #[arg(long, env = "CONFORMANCE_RUN_TEST")]
    pub run_test: Option<String>,

    /// Version of the implementation under test, recorded in the report
    #[arg(long, env = "CONFORMANCE_SUBJECT_VERSION", default_value = "dev")]
    pub subject_version: String,

    /// Always print cluster and subject logs at teardown
    #[arg(long, env = "CONFORMANCE_SHOW_LOGS")]
    pub show_logs: bool,

    /// Subject image; must already exist in the local runtime
    #[arg(
        long,
        env = "CONFORMANCE_SUBJECT_IMAGE",
        default_value = "traefik/traefik:latest"
    )]
    pub subject_image: String,

    /// k3s server image
    #[arg(
        long,
        env = "CONFORMANCE_K3S_IMAGE",
        default_value = crate::cluster::DEFAULT_K3S_IMAGE
    )]
    pub k3s_image: String,

    /// Bootstrap manifests, applied in the given order
    #[arg(
        long = "manifest",
        env = "CONFORMANCE_MANIFESTS",
        value_delimiter = ',',
        default_values = [
            "fixtures/k8s-conformance/00-experimental-v1.3.0.yml",
            "fixtures/k8s-conformance/01-rbac.yml",
            "fixtures/k8s-conformance/02-traefik.yml",
        ]
    )]
    pub manifests: Vec<PathBuf>,

    /// Test registry bundle directory (holds registry.yaml)
    #[arg(
        long,
        env = "CONFORMANCE_REGISTRY",
        default_value = "fixtures/k8s-conformance/registry"
    )]
    pub registry: PathBuf,

    /// Namespace of the subject deployment
    #[arg(long, env = "CONFORMANCE_SUBJECT_NAMESPACE", default_value = "traefik")]
    pub subject_namespace: String,

    /// Name of the subject deployment
    #[arg(long, env = "CONFORMANCE_SUBJECT_DEPLOYMENT", default_value = "traefik")]
    pub subject_deployment: String,

    /// Port the subject serves its readiness endpoint on
    #[arg(long, env = "CONFORMANCE_PROBE_PORT", default_value_t = DEFAULT_PROBE_PORT)]
    pub probe_port: u16,

    /// Conformance profiles to run
    #[arg(
        long = "profile",
        env = "CONFORMANCE_PROFILES",
        value_delimiter = ',',
        default_values = ["GATEWAY-HTTP", "GATEWAY-GRPC", "GATEWAY-TLS"]
    )]
    pub profiles: Vec<String>,

    /// Features the subject supports (defaults to the built-in list)
    #[arg(long = "supported-feature", env = "CONFORMANCE_SUPPORTED_FEATURES", value_delimiter = ',')]
    pub supported_features: Vec<String>,

    /// Treat every feature of the selected profiles as supported
    #[arg(long, env = "CONFORMANCE_ALL_FEATURES")]
    pub enable_all_supported_features: bool,

    /// Tests to skip
    #[arg(long = "skip-test", env = "CONFORMANCE_SKIP_TESTS", value_delimiter = ',')]
    pub skip_tests: Vec<String>,

    /// Keep the registry's shared fixtures after the run
    #[arg(long)]
    pub keep_base_resources: bool,

    /// Directory reports are written under
    #[arg(long, env = "CONFORMANCE_REPORT_DIR", default_value = "conformance-reports")]
    pub report_dir: PathBuf,

    /// Report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Yaml)]
    pub report_format: ReportFormat,

    /// Run mode recorded in the report
    #[arg(long, default_value = DEFAULT_MODE)]
    pub mode: String,

    /// Implementation organization
    #[arg(long, default_value = "traefik")]
    pub organization: String,

    /// Implementation project
    #[arg(long, default_value = "traefik")]
    pub project: String,

    /// Implementation URL
    #[arg(long, default_value = "https://traefik.io/")]
    pub url: String,

    /// Implementation maintainer contacts
    #[arg(long = "contact", value_delimiter = ',', default_values = ["@traefik/maintainers"])]
    pub contacts: Vec<String>,

    /// Seconds to wait for the subject deployment to become Available
    #[arg(long, env = "CONFORMANCE_SUBJECT_TIMEOUT", default_value_t = 30)]
    pub subject_timeout_secs: u64,

    /// Seconds to wait for the subject endpoint probe
    #[arg(long, env = "CONFORMANCE_PROBE_TIMEOUT", default_value_t = 10)]
    pub probe_timeout_secs: u64,

    /// Seconds a test may wait on any single condition
    #[arg(long, env = "CONFORMANCE_TEST_TIMEOUT", default_value_t = 60)]
    pub test_timeout_secs: u64,
}

/// Validated settings consumed by the harness
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Opt-in gate
    pub enabled: bool,
    /// Subject image reference
    pub subject_image: String,
    /// Bootstrap manifest files, in apply order
    pub manifests: Vec<PathBuf>,
    /// Test registry bundle directory
    pub registry_dir: PathBuf,
    /// Cluster provisioning settings
    pub provisioner: ProvisionerConfig,
    /// Port the subject is probed on
    pub probe_port: u16,
    /// Readiness probe settings
    pub probe: ProbeConfig,
    /// Runner settings
    pub runner: RunnerConfig,
    /// Which tests to run
    pub selection: TestSelection,
    /// Identity of the implementation under test
    pub implementation: Implementation,
    /// Report base directory
    pub report_dir: PathBuf,
    /// Report format
    pub report_format: ReportFormat,
    /// Run mode
    pub mode: String,
    /// Capture logs even when the run succeeds
    pub show_logs: bool,
}

impl RunArgs {
    /// Validate into a [`HarnessConfig`]
    pub fn into_config(self) -> Result<HarnessConfig> {
        if self.profiles.is_empty() {
            return Err(Error::config("at least one profile must be selected"));
        }
        if self.manifests.is_empty() {
            return Err(Error::config("at least one bootstrap manifest is required"));
        }
        // Both end up in the report file name
        for (name, value) in [("subject version", &self.subject_version), ("mode", &self.mode)] {
            if value.is_empty() || value.contains(['/', '\\']) || value == ".." {
                return Err(Error::config(format!(
                    "{} {:?} must be a non-empty name without path separators",
                    name, value
                )));
            }
        }
        for (name, secs) in [
            ("subject timeout", self.subject_timeout_secs),
            ("probe timeout", self.probe_timeout_secs),
            ("test timeout", self.test_timeout_secs),
        ] {
            if secs == 0 {
                return Err(Error::config(format!("{} must be positive", name)));
            }
        }

        let supported_features = if self.supported_features.is_empty() {
            DEFAULT_SUPPORTED_FEATURES
                .iter()
                .map(|f| Feature::from(*f))
                .collect()
        } else {
            self.supported_features.into_iter().map(Feature::new).collect()
        };

        let provisioner = ProvisionerConfig {
            cluster_image: self.k3s_image,
            subject: SubjectDeployment {
                namespace: self.subject_namespace,
                name: self.subject_deployment,
            },
            subject_ready_timeout: Duration::from_secs(self.subject_timeout_secs),
            ..Default::default()
        };

        Ok(HarnessConfig {
            enabled: self.enabled,
            subject_image: self.subject_image,
            manifests: self.manifests,
            registry_dir: self.registry,
            provisioner,
            probe_port: self.probe_port,
            probe: ProbeConfig {
                timeout: Duration::from_secs(self.probe_timeout_secs),
                ..Default::default()
            },
            runner: RunnerConfig {
                test_timeout: Duration::from_secs(self.test_timeout_secs),
                cleanup_base_resources: !self.keep_base_resources,
                ..Default::default()
            },
            selection: TestSelection {
                profiles: self.profiles.into_iter().map(ProfileName::new).collect(),
                supported_features,
                enable_all_supported_features: self.enable_all_supported_features,
                run_test: self.run_test.filter(|t| !t.is_empty()),
                skip_tests: self.skip_tests.into_iter().collect(),
            },
            implementation: Implementation {
                organization: self.organization,
                project: self.project,
                url: self.url,
                version: self.subject_version,
                contact: self.contacts,
            },
            report_dir: self.report_dir,
            report_format: self.report_format,
            mode: self.mode,
            show_logs: self.show_logs,
        })
    }
}
