//! Conformance report
//!
//! A [`ReportDocument`] is the canonical form of a run's outcomes: profiles
//! sorted by name, results sorted by test name, feature lists sorted, and the
//! date replaced by [`DATE_SENTINEL`]. Two reports built from the same outcomes
//! serialize to the same bytes.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::runner::{Outcome, OutcomeSet};
use crate::suite::{Feature, Implementation, ProfileName};
use crate::{Error, Result};

/// `apiVersion` of the report document
pub const REPORT_API_VERSION: &str = "gateway.networking.k8s.io/v1";
/// `kind` of the report document
pub const REPORT_KIND: &str = "ConformanceReport";
/// Placeholder written instead of the generation date
pub const DATE_SENTINEL: &str = "-";
/// Default run mode
pub const DEFAULT_MODE: &str = "default";

/// Serialization format of a persisted report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    /// YAML
    #[default]
    Yaml,
    /// Pretty-printed JSON
    Json,
}

impl ReportFormat {
    /// File extension for the format
    pub fn extension(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Context a report is generated for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportMetadata {
    /// Implementation under test
    pub implementation: Implementation,
    /// Gateway API version the registry targets
    pub gateway_api_version: String,
    /// Gateway API release channel
    pub gateway_api_channel: String,
    /// Run mode
    pub mode: String,
}

/// Overall result of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileResult {
    /// Every test passed
    Success,
    /// No failures, but some tests were skipped
    Partial,
    /// At least one test failed
    Failure,
}

/// Outcome counts for a profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Tests that passed
    pub passed: usize,
    /// Tests that failed
    pub failed: usize,
    /// Tests that were skipped
    pub skipped: usize,
}

/// One test line in a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Test name
    pub name: String,
    /// Outcome
    pub result: Outcome,
    /// Failure diagnostic or skip reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Results for one conformance profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileReport {
    /// Profile name
    pub name: ProfileName,
    /// Aggregate result
    pub result: ProfileResult,
    /// Outcome counts
    pub statistics: Statistics,
    /// Per-test results, sorted by name
    pub results: Vec<TestResult>,
    /// Supported features, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_features: Vec<Feature>,
    /// Unsupported features, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsupported_features: Vec<Feature>,
}

/// The full report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDocument {
    /// Report schema version
    pub api_version: String,
    /// Report kind
    pub kind: String,
    /// Generation date; always [`DATE_SENTINEL`]
    pub date: String,
    /// Implementation under test
    pub implementation: Implementation,
    /// Gateway API version
    #[serde(rename = "gatewayAPIVersion")]
    pub gateway_api_version: String,
    /// Gateway API channel
    #[serde(rename = "gatewayAPIChannel")]
    pub gateway_api_channel: String,
    /// Run mode
    pub mode: String,
    /// Profiles, sorted by name
    pub profiles: Vec<ProfileReport>,
}

impl ReportDocument {
    /// Normalize outcomes into a report
    pub fn generate(outcomes: &OutcomeSet, metadata: &ReportMetadata) -> Self {
        let profiles = outcomes
            .profiles()
            .map(|(profile, features)| {
                let mut statistics = Statistics::default();
                let results: Vec<_> = outcomes
                    .for_profile(profile)
                    .map(|(name, outcome)| {
                        match outcome.outcome {
                            Outcome::Passed => statistics.passed += 1,
                            Outcome::Failed => statistics.failed += 1,
                            Outcome::Skipped => statistics.skipped += 1,
                        }
                        TestResult {
                            name: name.to_string(),
                            result: outcome.outcome,
                            message: outcome.diagnostic.clone(),
                        }
                    })
                    .collect();

                ProfileReport {
                    name: profile.clone(),
                    result: profile_result(&statistics),
                    statistics,
                    results,
                    supported_features: features.supported.iter().cloned().collect(),
                    unsupported_features: features.unsupported.iter().cloned().collect(),
                }
            })
            .collect();

        Self {
            api_version: REPORT_API_VERSION.to_string(),
            kind: REPORT_KIND.to_string(),
            date: DATE_SENTINEL.to_string(),
            implementation: metadata.implementation.clone(),
            gateway_api_version: metadata.gateway_api_version.clone(),
            gateway_api_channel: metadata.gateway_api_channel.clone(),
            mode: metadata.mode.clone(),
            profiles,
        }
    }

    /// Serialize in the given format
    pub fn render(&self, format: ReportFormat) -> Result<String> {
        Ok(match format {
            ReportFormat::Yaml => serde_yaml::to_string(self)?,
            ReportFormat::Json => {
                let mut json = serde_json::to_string_pretty(self)?;
                json.push('\n');
                json
            }
        })
    }

    /// `<base>/<gatewayAPIVersion>/<channel>-<version>-<mode>-report.<ext>`
    pub fn path(&self, base: &Path, format: ReportFormat) -> PathBuf {
        base.join(&self.gateway_api_version).join(format!(
            "{}-{}-{}-report.{}",
            self.gateway_api_channel,
            self.implementation.version,
            self.mode,
            format.extension()
        ))
    }

    /// Log the report, then write it under `base`; returns the file path
    pub fn persist(&self, base: &Path, format: ReportFormat) -> Result<PathBuf> {
        let rendered = self.render(format)?;
        info!("conformance report:\n{}", rendered);

        let path = self.path(base, format);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| Error::Persist {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, rendered).map_err(|source| Error::Persist {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), "report written");
        Ok(path)
    }

    /// Whether any profile failed
    pub fn has_failures(&self) -> bool {
        self.profiles
            .iter()
            .any(|p| p.result == ProfileResult::Failure)
    }
}

fn profile_result(statistics: &Statistics) -> ProfileResult {
    if statistics.failed > 0 {
        ProfileResult::Failure
    } else if statistics.skipped > 0 {
        ProfileResult::Partial
    } else {
        ProfileResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{OutcomeRecorder, ProfileFeatures};
    use std::collections::BTreeSet;

    fn profiles(names: &[&str]) -> BTreeSet<ProfileName> {
        names.iter().map(|p| ProfileName::from(*p)).collect()
    }

    fn metadata() -> ReportMetadata {
        ReportMetadata {
            implementation: Implementation {
                organization: "traefik".into(),
                project: "traefik".into(),
                url: "https://traefik.io/".into(),
                version: "v3.4".into(),
                contact: vec!["@traefik/maintainers".into()],
            },
            gateway_api_version: "v1.3.0".into(),
            gateway_api_channel: "experimental".into(),
            mode: DEFAULT_MODE.into(),
        }
    }

    /// Records TLS before HTTP and tests out of name order
    fn outcomes() -> OutcomeSet {
        let mut recorder = OutcomeRecorder::new();
        recorder.declare_profile(
            ProfileName::from("GATEWAY-TLS"),
            ProfileFeatures {
                supported: [Feature::from("TLSRoute")].into(),
                unsupported: BTreeSet::new(),
            },
        );
        recorder.declare_profile(
            ProfileName::from("GATEWAY-HTTP"),
            ProfileFeatures {
                supported: [Feature::from("HTTPRoute"), Feature::from("Gateway")].into(),
                unsupported: [Feature::from("HTTPRouteQueryParamMatching")].into(),
            },
        );
        recorder.record("TLSRouteSimple", profiles(&["GATEWAY-TLS"]), Outcome::Passed, None);
        recorder.record("HTTPRouteWeight", profiles(&["GATEWAY-HTTP"]), Outcome::Passed, None);
        recorder.record(
            "HTTPRouteQueryParams",
            profiles(&["GATEWAY-HTTP"]),
            Outcome::Skipped,
            Some("unsupported features: HTTPRouteQueryParamMatching".into()),
        );
        recorder.record("HTTPRouteHeaders", profiles(&["GATEWAY-HTTP"]), Outcome::Passed, None);
        recorder.finish()
    }

    #[test]
    fn profiles_and_results_are_sorted() {
        let report = ReportDocument::generate(&outcomes(), &metadata());

        let names: Vec<_> = report.profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["GATEWAY-HTTP", "GATEWAY-TLS"]);

        let http = &report.profiles[0];
        let tests: Vec<_> = http.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            tests,
            vec!["HTTPRouteHeaders", "HTTPRouteQueryParams", "HTTPRouteWeight"]
        );
        assert_eq!(
            http.supported_features,
            vec![Feature::from("Gateway"), Feature::from("HTTPRoute")]
        );
    }

    #[test]
    fn profile_results_follow_statistics() {
        let report = ReportDocument::generate(&outcomes(), &metadata());
        assert_eq!(report.profiles[0].result, ProfileResult::Partial);
        assert_eq!(
            report.profiles[0].statistics,
            Statistics {
                passed: 2,
                failed: 0,
                skipped: 1
            }
        );
        assert_eq!(report.profiles[1].result, ProfileResult::Success);
        assert!(!report.has_failures());

        let failed = Statistics {
            passed: 5,
            failed: 1,
            skipped: 2,
        };
        assert_eq!(profile_result(&failed), ProfileResult::Failure);
    }

    #[test]
    fn date_is_elided() {
        let report = ReportDocument::generate(&outcomes(), &metadata());
        assert_eq!(report.date, "-");
        let yaml = report.render(ReportFormat::Yaml).unwrap();
        assert!(yaml.contains("date: '-'") || yaml.contains("date: \"-\""), "{}", yaml);
        assert!(yaml.contains("gatewayAPIVersion: v1.3.0"));
        assert!(yaml.contains("gatewayAPIChannel: experimental"));
    }

    /// Story: persisting the same outcomes twice yields identical bytes
    #[test]
    fn story_persist_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let report = ReportDocument::generate(&outcomes(), &metadata());

        let first = report.persist(dir.path(), ReportFormat::Yaml).unwrap();
        let first_bytes = std::fs::read(&first).unwrap();

        let again = ReportDocument::generate(&outcomes(), &metadata());
        let second = again.persist(dir.path(), ReportFormat::Yaml).unwrap();
        assert_eq!(first, second);
        assert_eq!(first_bytes, std::fs::read(&second).unwrap());
        assert_eq!(
            first,
            dir.path().join("v1.3.0").join("experimental-v3.4-default-report.yaml")
        );
    }

    #[test]
    fn json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let report = ReportDocument::generate(&outcomes(), &metadata());
        let path = report.persist(dir.path(), ReportFormat::Json).unwrap();
        assert!(path.to_string_lossy().ends_with("-report.json"));

        let parsed: ReportDocument =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn unwritable_base_is_a_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let report = ReportDocument::generate(&outcomes(), &metadata());
        let err = report.persist(&blocker, ReportFormat::Yaml).unwrap_err();
        assert!(matches!(err, Error::Persist { .. }));
        assert!(err.is_fatal());
    }
}
