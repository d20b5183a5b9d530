//! Conformance runner
//!
//! Wraps a [`TestRegistry`] and drives one run against a ready subject:
//!
//! 1. Probe the subject endpoint until it answers (bounded).
//! 2. Install the registry's shared fixtures.
//! 3. Walk the selected profiles in lexicographic order and run their tests in
//!    registry order, one at a time. A test shared by several profiles runs
//!    once. A test that errors or panics is recorded as failed; the rest still
//!    run.
//! 4. Optionally remove the shared fixtures.

mod outcome;
mod probe;
mod selection;

pub use outcome::{Outcome, OutcomeRecorder, OutcomeSet, ProfileFeatures, TestOutcome};
pub use probe::{
    HttpProbe, ProbeConfig, SubjectProbe, DEFAULT_PROBE_PATH, DEFAULT_PROBE_PORT,
    DEFAULT_READY_MARKER,
};
#[cfg(test)]
pub use probe::MockSubjectProbe;
pub use selection::{Decision, ProfilePlan, SelectionPlan, TestSelection};

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{error, info, instrument, warn};

use crate::client::ApiClient;
use crate::cluster::SubjectEndpoint;
use crate::manifest::ManifestDoc;
use crate::suite::{ConformanceTest, Implementation, TestContext, TestRegistry};
use crate::{Error, Result};

/// Runner settings
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Bound on readiness waits inside a test
    pub test_timeout: Duration,
    /// Poll interval inside a test
    pub poll_interval: Duration,
    /// Hard limit on one test's total run time
    pub test_deadline: Duration,
    /// Delete the registry's shared fixtures after the run
    pub cleanup_base_resources: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            test_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            test_deadline: Duration::from_secs(300),
            cleanup_base_resources: true,
        }
    }
}

/// Executes a test registry against a subject
pub struct ConformanceRunner {
    registry: Arc<dyn TestRegistry>,
    probe: Arc<dyn SubjectProbe>,
    config: RunnerConfig,
}

impl ConformanceRunner {
    /// Create a runner
    pub fn new(
        registry: Arc<dyn TestRegistry>,
        probe: Arc<dyn SubjectProbe>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
        }
    }

    /// The wrapped registry
    pub fn registry(&self) -> &Arc<dyn TestRegistry> {
        &self.registry
    }

    /// Run the selected tests and collect their outcomes.
    ///
    /// Fails only when the run cannot be evaluated (unreachable subject,
    /// fixtures that do not apply). Per-test failures are outcomes.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn run(
        &self,
        client: &ApiClient,
        endpoint: &SubjectEndpoint,
        selection: &TestSelection,
        implementation: &Implementation,
    ) -> Result<OutcomeSet> {
        self.probe.wait_ready(endpoint).await?;

        let base = self.registry.base_manifests();
        for (applied, doc) in base.iter().enumerate() {
            if let Err(e) = client.apply(doc).await {
                error!(manifest = %doc.reference(), error = %e, "failed to apply shared fixture");
                self.remove_fixtures(client, &base[..applied]).await;
                return Err(e);
            }
        }
        info!(count = base.len(), "shared fixtures applied");

        let ctx = TestContext {
            client: client.clone(),
            endpoint: endpoint.clone(),
            implementation: implementation.clone(),
            timeout: self.config.test_timeout,
            poll_interval: self.config.poll_interval,
        };

        let tests = self.registry.tests();
        let plan = selection.plan(&tests);
        let mut recorder = OutcomeRecorder::new();

        for profile in &plan.profiles {
            info!(profile = %profile.name, tests = profile.tests.len(), "running profile");
            recorder.declare_profile(
                profile.name.clone(),
                ProfileFeatures {
                    supported: profile.supported_features.clone(),
                    unsupported: profile.unsupported_features.clone(),
                },
            );

            for test in &profile.tests {
                if recorder.contains(test.name()) {
                    continue;
                }
                let profiles: BTreeSet<_> = test
                    .profiles()
                    .intersection(&selection.profiles)
                    .cloned()
                    .collect();

                match selection.decide(test.as_ref(), &plan.effective_features) {
                    Decision::Skip(reason) => {
                        info!(test = %test.name(), reason = %reason, "SKIP");
                        recorder.record(test.name(), profiles, Outcome::Skipped, Some(reason));
                    }
                    Decision::Run => {
                        let (outcome, diagnostic) = self.execute(test.as_ref(), &ctx).await;
                        recorder.record(test.name(), profiles, outcome, diagnostic);
                    }
                }
            }
        }

        self.remove_fixtures(client, &base).await;

        let outcomes = recorder.finish();
        info!(
            passed = outcomes.count(Outcome::Passed),
            failed = outcomes.count(Outcome::Failed),
            skipped = outcomes.count(Outcome::Skipped),
            "conformance run complete"
        );
        Ok(outcomes)
    }

    /// Delete shared fixtures in reverse apply order, unless configured to keep them
    async fn remove_fixtures(&self, client: &ApiClient, applied: &[ManifestDoc]) {
        if !self.config.cleanup_base_resources {
            return;
        }
        for doc in applied.iter().rev() {
            if let Err(e) = client.delete(doc).await {
                warn!(manifest = %doc.reference(), error = %e, "failed to remove shared fixture");
            }
        }
    }

    /// Run one test with panic isolation and a hard deadline
    async fn execute(
        &self,
        test: &dyn ConformanceTest,
        ctx: &TestContext,
    ) -> (Outcome, Option<String>) {
        let start = Instant::now();
        let guarded = tokio::time::timeout(
            self.config.test_deadline,
            AssertUnwindSafe(test.run(ctx)).catch_unwind(),
        )
        .await;

        let (outcome, diagnostic) = match guarded {
            Ok(Ok(Ok(()))) => (Outcome::Passed, None),
            Ok(Ok(Err(e))) if e.trim().is_empty() => (
                Outcome::Failed,
                Some("test failed without a diagnostic".to_string()),
            ),
            Ok(Ok(Err(e))) => (Outcome::Failed, Some(e)),
            Ok(Err(panic)) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                (Outcome::Failed, Some(format!("PANIC: {msg}")))
            }
            Err(_) => (
                Outcome::Failed,
                Some(format!(
                    "exceeded deadline of {:?}",
                    self.config.test_deadline
                )),
            ),
        };

        let elapsed = start.elapsed().as_secs_f64();
        match (&outcome, &diagnostic) {
            (Outcome::Passed, _) => info!(test = %test.name(), elapsed, "PASS"),
            (_, Some(d)) => {
                let err = Error::test_execution(test.name(), d.as_str());
                warn!(elapsed, error = %err, "FAIL");
            }
            _ => warn!(test = %test.name(), elapsed, "FAIL"),
        }
        (outcome, diagnostic)
    }
}
