//! Integration test for a full conformance run
//!
//! Runs the bundled registry against the bundled subject and checks the
//! report lands where the naming convention says it does.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use gateway_conformance::report::ReportFormat;
use gateway_conformance::suite::{BundleRegistry, ProfileName};
use gateway_conformance::harness::CLUSTER_NAME_PREFIX;
use gateway_conformance::{Cli, Harness, RunStatus};

use super::helpers::{docker_available, fixture, image_present, labelled_runs_with_prefix};

/// Story: The bundled HTTP tests run against the subject and produce a report
///
/// Only the HTTP profile is selected, so the report carries exactly that
/// profile. Every container and network the run created is gone afterwards.
#[tokio::test]
#[ignore = "requires docker and the subject image - run with: cargo test --test kind -- --ignored"]
async fn story_bundled_registry_produces_report() {
    assert!(docker_available(), "docker daemon is required");
    assert!(
        image_present("traefik/traefik:latest"),
        "build or pull traefik/traefik:latest first"
    );
    assert!(
        fixture("00-experimental-v1.3.0.yml").exists(),
        "download the Gateway API CRDs first (see fixtures/k8s-conformance/README.md)"
    );

    let reports = tempfile::tempdir().unwrap();
    let manifests = [
        fixture("00-experimental-v1.3.0.yml"),
        fixture("01-rbac.yml"),
        fixture("02-traefik.yml"),
    ]
    .iter()
    .map(|p| p.display().to_string())
    .collect::<Vec<_>>()
    .join(",");
    let report_dir = reports.path().display().to_string();

    let cli = Cli::try_parse_from([
        "gateway-conformance",
        "--enabled",
        "--profile",
        "GATEWAY-HTTP",
        "--manifest",
        manifests.as_str(),
        "--report-dir",
        report_dir.as_str(),
        "--report-format",
        "yaml",
        "--subject-version",
        "e2e",
    ])
    .unwrap();
    let config = cli.run.into_config().unwrap();

    let registry = Arc::new(BundleRegistry::load(&fixture("registry")).unwrap());
    let harness = Harness::new(config).unwrap();

    let status = harness
        .run(registry, CancellationToken::new())
        .await
        .expect("run should reach the report stage");
    let RunStatus::Completed(report) = status else {
        panic!("run was enabled");
    };

    assert_eq!(
        report.path,
        reports
            .path()
            .join("v1.3.0")
            .join("experimental-e2e-default-report.yaml")
    );
    assert!(report.path.exists());
    assert_eq!(
        report.path,
        report.document.path(reports.path(), ReportFormat::Yaml)
    );

    let profiles: Vec<_> = report.document.profiles.iter().map(|p| &p.name).collect();
    assert_eq!(profiles, vec![&ProfileName::from("GATEWAY-HTTP")]);
    assert_eq!(report.document.date, "-");

    let written = std::fs::read_to_string(&report.path).unwrap();
    assert!(written.contains("kind: ConformanceReport"));
    assert!(written.contains("HTTPRouteSimpleSameNamespace"));

    assert!(labelled_runs_with_prefix(CLUSTER_NAME_PREFIX).is_empty());
}
