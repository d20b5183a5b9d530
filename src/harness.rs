//! End-to-end orchestration of one conformance run
//!
//! Image check → provision → client → runner → report, with diagnostics and
//! teardown always last. The run body is raced against a cancellation token
//! and guarded against panics; whichever way it ends, the scoped cluster is
//! finalized before the result is returned.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::client::{ClientBuilder, ClientFactory};
use crate::cluster::{
    ClusterConnector, ClusterHandle, KubeConnector, Provisioner, ScopedCluster,
};
use crate::config::HarnessConfig;
use crate::image::ensure_image_present;
use crate::manifest::BootstrapManifest;
use crate::report::{ReportDocument, ReportMetadata};
use crate::runner::{ConformanceRunner, HttpProbe, OutcomeSet, SubjectProbe};
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::suite::TestRegistry;
use crate::{Error, Result};

/// Prefix of every run's cluster name
pub const CLUSTER_NAME_PREFIX: &str = "gateway-conformance";

/// How a run ended
#[derive(Debug)]
pub enum RunStatus {
    /// The opt-in gate was off; nothing was provisioned
    Disabled,
    /// The run reached the report stage
    Completed(RunReport),
}

/// Result of a completed run
#[derive(Debug)]
pub struct RunReport {
    /// Where the report was written
    pub path: PathBuf,
    /// The report as written
    pub document: ReportDocument,
    /// Raw outcomes
    pub outcomes: OutcomeSet,
}

/// Wires the harness components together
pub struct Harness {
    config: HarnessConfig,
    runtime: Arc<dyn ContainerRuntime>,
    connector: Arc<dyn ClusterConnector>,
    clients: Arc<dyn ClientBuilder>,
    probe: Arc<dyn SubjectProbe>,
}

impl Harness {
    /// Harness backed by the docker CLI and a live API server
    pub fn new(config: HarnessConfig) -> Result<Self> {
        let probe = HttpProbe::new(config.probe.clone())?;
        Ok(Self::with_parts(
            config,
            Arc::new(DockerCli::default()),
            Arc::new(KubeConnector),
            Arc::new(ClientFactory::new()),
            Arc::new(probe),
        ))
    }

    /// Harness over explicit components
    pub fn with_parts(
        config: HarnessConfig,
        runtime: Arc<dyn ContainerRuntime>,
        connector: Arc<dyn ClusterConnector>,
        clients: Arc<dyn ClientBuilder>,
        probe: Arc<dyn SubjectProbe>,
    ) -> Self {
        Self {
            config,
            runtime,
            connector,
            clients,
            probe,
        }
    }

    /// Harness settings
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run `registry` against the configured subject.
    ///
    /// Returns [`RunStatus::Disabled`] without touching the runtime when the
    /// opt-in gate is off. Every other path that allocated resources releases
    /// them before returning, including panics in the run body and
    /// cancellation through `cancel`.
    pub async fn run(
        &self,
        registry: Arc<dyn TestRegistry>,
        cancel: CancellationToken,
    ) -> Result<RunStatus> {
        if !self.config.enabled {
            info!("conformance run disabled; pass --enabled or set CONFORMANCE_ENABLED=true");
            return Ok(RunStatus::Disabled);
        }

        ensure_image_present(self.runtime.as_ref(), &self.config.subject_image).await?;
        let manifests = BootstrapManifest::load_all(&self.config.manifests)?;

        let mut scope = ScopedCluster::new(
            self.runtime.clone(),
            ClusterHandle::new(cluster_name()),
            self.config.provisioner.subject.clone(),
        );

        let result = tokio::select! {
            outcome = AssertUnwindSafe(self.execute(scope.handle_mut(), &manifests, &registry)).catch_unwind() => {
                match outcome {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = panic_message(panic.as_ref());
                        error!(panic = %msg, "conformance run panicked");
                        Err(Error::runtime(format!("run panicked: {}", msg)))
                    }
                }
            }
            _ = cancel.cancelled() => {
                warn!("conformance run cancelled");
                Err(Error::Cancelled)
            }
        };

        let failed = match &result {
            Ok(report) => report.document.has_failures(),
            Err(e) => {
                error!(error = %e, "conformance run failed");
                true
            }
        };
        scope.finalize(failed, self.config.show_logs).await;

        result.map(RunStatus::Completed)
    }

    #[instrument(skip_all, fields(cluster = %handle.name))]
    async fn execute(
        &self,
        handle: &mut ClusterHandle,
        manifests: &[BootstrapManifest],
        registry: &Arc<dyn TestRegistry>,
    ) -> Result<RunReport> {
        let provisioner = Provisioner::new(
            self.runtime.clone(),
            self.connector.clone(),
            self.config.provisioner.clone(),
        );
        provisioner
            .provision(handle, manifests, &self.config.subject_image)
            .await?;

        let client = self
            .clients
            .build(handle, &registry.required_schemas())
            .await?;
        let endpoint = handle.subject_endpoint(self.config.probe_port)?;

        let runner = ConformanceRunner::new(
            registry.clone(),
            self.probe.clone(),
            self.config.runner.clone(),
        );
        let outcomes = runner
            .run(
                &client,
                &endpoint,
                &self.config.selection,
                &self.config.implementation,
            )
            .await?;

        let version = registry.version();
        let metadata = ReportMetadata {
            implementation: self.config.implementation.clone(),
            gateway_api_version: version.api_version,
            gateway_api_channel: version.channel,
            mode: self.config.mode.clone(),
        };
        let document = ReportDocument::generate(&outcomes, &metadata);
        let path = document.persist(&self.config.report_dir, self.config.report_format)?;

        Ok(RunReport {
            path,
            document,
            outcomes,
        })
    }
}

/// Unique name for one run's cluster resources
fn cluster_name() -> String {
    let id: u32 = rand::thread_rng().gen();
    format!("{}-{:06x}", CLUSTER_NAME_PREFIX, id & 0xFF_FFFF)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::offline_client;
    use crate::client::MockClientBuilder;
    use crate::cluster::fixtures::{connector_for, fast_config, healthy_runtime};
    use crate::cluster::{DeploymentReadiness, MockClusterApi, MockClusterConnector};
    use crate::report::ReportFormat;
    use crate::runner::{MockSubjectProbe, Outcome, ProbeConfig, RunnerConfig, TestSelection};
    use crate::runtime::{ExecOutput, ImageInfo, MockContainerRuntime};
    use crate::suite::tests::{FnTest, StaticRegistry};
    use crate::suite::{ConformanceTest, Implementation};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SUBJECT_IMAGE: &str = "traefik/traefik:latest";

    const MANIFEST: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: traefik\n  namespace: traefik\n";

    struct Fixture {
        dir: tempfile::TempDir,
        config: HarnessConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("02-traefik.yml");
        std::fs::write(&manifest, MANIFEST).unwrap();

        let config = HarnessConfig {
            enabled: true,
            subject_image: SUBJECT_IMAGE.into(),
            manifests: vec![manifest],
            registry_dir: dir.path().join("registry"),
            provisioner: fast_config(),
            probe_port: 9000,
            probe: ProbeConfig::default(),
            runner: RunnerConfig::default(),
            selection: TestSelection::for_profiles(["GATEWAY-HTTP"]),
            implementation: Implementation {
                organization: "traefik".into(),
                project: "traefik".into(),
                url: "https://traefik.io/".into(),
                version: "v3.4".into(),
                contact: vec!["@traefik/maintainers".into()],
            },
            report_dir: dir.path().join("reports"),
            report_format: ReportFormat::Yaml,
            mode: "default".into(),
            show_logs: false,
        };
        Fixture { dir, config }
    }

    fn with_image(mut runtime: MockContainerRuntime) -> MockContainerRuntime {
        runtime.expect_list_images().returning(|| {
            Ok(vec![ImageInfo {
                name: "docker.io/traefik/traefik:latest".into(),
            }])
        });
        runtime
    }

    /// Runtime that counts releases and answers log capture
    fn counted_runtime(base: MockContainerRuntime, releases: &Arc<AtomicUsize>) -> MockContainerRuntime {
        let mut runtime = with_image(base);
        let c = releases.clone();
        runtime.expect_remove_container().times(1).returning(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        runtime.expect_remove_network().times(1).returning(|_| Ok(()));
        runtime.expect_logs().returning(|_| Ok("k3s log".into()));
        runtime
    }

    fn ready_api() -> MockClusterApi {
        let mut api = MockClusterApi::new();
        api.expect_apply().returning(|_| Ok(()));
        api.expect_wait_for_crd().returning(|_, _| Ok(()));
        api.expect_deployment_readiness()
            .returning(|_, _| Ok(DeploymentReadiness::Available));
        api
    }

    fn never_built() -> Arc<dyn ClientBuilder> {
        let mut clients = MockClientBuilder::new();
        clients.expect_build().never();
        Arc::new(clients)
    }

    fn never_probed() -> Arc<dyn SubjectProbe> {
        let mut probe = MockSubjectProbe::new();
        probe.expect_wait_ready().never();
        Arc::new(probe)
    }

    fn registry(tests: Vec<Arc<dyn ConformanceTest>>) -> Arc<dyn TestRegistry> {
        Arc::new(StaticRegistry::new(tests))
    }

    /// Story: with the gate off nothing is provisioned and the run succeeds
    #[tokio::test]
    async fn story_disabled_gate_touches_nothing() {
        let mut fx = fixture();
        fx.config.enabled = false;

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_images().never();
        runtime.expect_create_network().never();

        let harness = Harness::with_parts(
            fx.config,
            Arc::new(runtime),
            Arc::new(MockClusterConnector::new()),
            never_built(),
            never_probed(),
        );
        let status = harness
            .run(registry(Vec::new()), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(status, RunStatus::Disabled));
    }

    #[tokio::test]
    async fn missing_image_fails_before_provisioning() {
        let fx = fixture();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_images().returning(|| Ok(Vec::new()));
        runtime.expect_create_network().never();

        let harness = Harness::with_parts(
            fx.config,
            Arc::new(runtime),
            Arc::new(MockClusterConnector::new()),
            never_built(),
            never_probed(),
        );
        let err = harness
            .run(registry(Vec::new()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { .. }));
    }

    /// Story: a manifest that fails to apply still releases everything exactly once
    #[tokio::test]
    async fn story_manifest_failure_releases_once() {
        let fx = fixture();
        let releases = Arc::new(AtomicUsize::new(0));
        let runtime = counted_runtime(healthy_runtime(), &releases);

        let mut api = MockClusterApi::new();
        api.expect_apply()
            .times(1)
            .returning(|_| Err(Error::provision("manifest", "forbidden")));

        let harness = Harness::with_parts(
            fx.config,
            Arc::new(runtime),
            Arc::new(connector_for(api)),
            never_built(),
            never_probed(),
        );
        let err = harness
            .run(registry(Vec::new()), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provision { ref stage, .. } if stage == "manifest"));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(!fx.dir.path().join("reports").exists());
    }

    /// Story: a subject that never becomes ready stops the run before any test
    #[tokio::test]
    async fn story_subject_never_ready_skips_runner() {
        let fx = fixture();
        let releases = Arc::new(AtomicUsize::new(0));
        let runtime = counted_runtime(healthy_runtime(), &releases);

        let mut api = MockClusterApi::new();
        api.expect_apply().returning(|_| Ok(()));
        api.expect_deployment_readiness().returning(|_, _| {
            Ok(DeploymentReadiness::Unavailable(
                "MinimumReplicasUnavailable: Deployment does not have minimum availability.".into(),
            ))
        });

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let tests = vec![FnTest::new("HTTPRouteSimple", &["GATEWAY-HTTP"], &[], move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })];

        let harness = Harness::with_parts(
            fx.config,
            Arc::new(runtime),
            Arc::new(connector_for(api)),
            never_built(),
            never_probed(),
        );
        let err = harness
            .run(registry(tests), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SubjectNotReady { .. }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    /// Story: a full run writes a report with only the selected profile
    #[tokio::test]
    async fn story_completed_run_writes_selected_profile() {
        let fx = fixture();
        let releases = Arc::new(AtomicUsize::new(0));
        let runtime = counted_runtime(healthy_runtime(), &releases);

        let mut clients = MockClientBuilder::new();
        clients
            .expect_build()
            .times(1)
            .returning(|_, _| Ok(offline_client()));
        let mut probe = MockSubjectProbe::new();
        probe
            .expect_wait_ready()
            .withf(|ep| ep.to_string() == "172.20.0.2:9000")
            .times(1)
            .returning(|_| Ok(()));

        let tests = vec![
            FnTest::passing("HTTPRouteSimple", &["GATEWAY-HTTP"]),
            FnTest::passing("HTTPRouteHeaders", &["GATEWAY-HTTP"]),
            FnTest::passing("HTTPRouteRedirect", &["GATEWAY-HTTP"]),
            FnTest::passing("TLSRouteSimple", &["GATEWAY-TLS"]),
            FnTest::passing("TLSRouteInvalid", &["GATEWAY-TLS"]),
        ];

        let harness = Harness::with_parts(
            fx.config,
            Arc::new(runtime),
            Arc::new(connector_for(ready_api())),
            Arc::new(clients),
            Arc::new(probe),
        );
        let status = harness
            .run(registry(tests), CancellationToken::new())
            .await
            .unwrap();

        let RunStatus::Completed(report) = status else {
            panic!("run did not complete");
        };
        assert_eq!(report.document.profiles.len(), 1);
        assert_eq!(report.document.profiles[0].name.as_str(), "GATEWAY-HTTP");
        assert_eq!(report.document.profiles[0].results.len(), 3);
        assert_eq!(report.outcomes.count(Outcome::Passed), 3);
        assert_eq!(
            report.path,
            fx.dir
                .path()
                .join("reports/v1.3.0/experimental-v3.4-default-report.yaml")
        );
        assert!(report.path.exists());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    /// Story: cancelling mid-provision still tears the cluster down
    #[tokio::test]
    async fn story_cancellation_releases_resources() {
        let mut fx = fixture();
        fx.config.provisioner.api_ready_timeout = Duration::from_secs(30);

        let releases = Arc::new(AtomicUsize::new(0));
        let mut base = MockContainerRuntime::new();
        base.expect_create_network().returning(|_, _| Ok("net".into()));
        base.expect_run_container().returning(|_| Ok("ctr".into()));
        base.expect_container_ip()
            .returning(|_, _| Ok("172.20.0.2".into()));
        base.expect_exec().returning(|_, _| {
            Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "The connection to the server was refused".into(),
            })
        });
        let runtime = counted_runtime(base, &releases);

        let harness = Harness::with_parts(
            fx.config,
            Arc::new(runtime),
            Arc::new(MockClusterConnector::new()),
            never_built(),
            never_probed(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = harness.run(registry(Vec::new()), cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    struct PanickingProbe;

    #[async_trait::async_trait]
    impl SubjectProbe for PanickingProbe {
        async fn wait_ready(&self, _endpoint: &crate::cluster::SubjectEndpoint) -> Result<()> {
            panic!("probe exploded")
        }
    }

    /// Story: a panic inside the run body is contained and resources are released
    #[tokio::test]
    async fn story_panic_in_run_body_releases_resources() {
        let fx = fixture();
        let releases = Arc::new(AtomicUsize::new(0));
        let runtime = counted_runtime(healthy_runtime(), &releases);

        let mut clients = MockClientBuilder::new();
        clients.expect_build().returning(|_, _| Ok(offline_client()));

        let harness = Harness::with_parts(
            fx.config,
            Arc::new(runtime),
            Arc::new(connector_for(ready_api())),
            Arc::new(clients),
            Arc::new(PanickingProbe),
        );
        let err = harness
            .run(registry(Vec::new()), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("probe exploded"), "{}", err);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cluster_names_are_prefixed_and_short() {
        let name = cluster_name();
        assert!(name.starts_with("gateway-conformance-"));
        assert_eq!(name.len(), "gateway-conformance-".len() + 6);
    }
}
