//! Per-test outcomes
//!
//! Outcomes accumulate in an [`OutcomeRecorder`] while the runner executes and
//! become an immutable [`OutcomeSet`] once the run finishes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::suite::{Feature, ProfileName};

/// Result of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The test ran and passed
    Passed,
    /// The test ran and failed (or panicked)
    Failed,
    /// The test was not run
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// What happened to one test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    /// Passed, failed or skipped
    pub outcome: Outcome,
    /// Failure diagnostic or skip reason
    pub diagnostic: Option<String>,
    /// Selected profiles the test counted toward
    pub profiles: BTreeSet<ProfileName>,
}

/// Feature support recorded for a profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileFeatures {
    /// Features exercised in this profile
    pub supported: BTreeSet<Feature>,
    /// Features declared by the profile's tests but not supported
    pub unsupported: BTreeSet<Feature>,
}

/// Mutable accumulator used while a run is in progress
#[derive(Debug, Default)]
pub struct OutcomeRecorder {
    results: BTreeMap<String, TestOutcome>,
    profiles: BTreeMap<ProfileName, ProfileFeatures>,
}

impl OutcomeRecorder {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a profile that takes part in the run
    pub fn declare_profile(&mut self, profile: ProfileName, features: ProfileFeatures) {
        self.profiles.insert(profile, features);
    }

    /// Whether an outcome for `test` exists
    pub fn contains(&self, test: &str) -> bool {
        self.results.contains_key(test)
    }

    /// Record a test's outcome; the first record for a name wins
    pub fn record(
        &mut self,
        test: impl Into<String>,
        profiles: BTreeSet<ProfileName>,
        outcome: Outcome,
        diagnostic: Option<String>,
    ) {
        self.results.entry(test.into()).or_insert(TestOutcome {
            outcome,
            diagnostic,
            profiles,
        });
    }

    /// Freeze into a read-only set
    pub fn finish(self) -> OutcomeSet {
        OutcomeSet {
            results: self.results,
            profiles: self.profiles,
        }
    }
}

/// Outcomes of a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeSet {
    results: BTreeMap<String, TestOutcome>,
    profiles: BTreeMap<ProfileName, ProfileFeatures>,
}

impl OutcomeSet {
    /// Outcome for a test
    pub fn get(&self, test: &str) -> Option<&TestOutcome> {
        self.results.get(test)
    }

    /// All outcomes, ordered by test name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TestOutcome)> {
        self.results.iter().map(|(name, o)| (name.as_str(), o))
    }

    /// Profiles that took part, ordered by name
    pub fn profiles(&self) -> impl Iterator<Item = (&ProfileName, &ProfileFeatures)> {
        self.profiles.iter()
    }

    /// Outcomes counted toward `profile`, ordered by test name
    pub fn for_profile<'a>(
        &'a self,
        profile: &'a ProfileName,
    ) -> impl Iterator<Item = (&'a str, &'a TestOutcome)> + 'a {
        self.iter().filter(move |(_, o)| o.profiles.contains(profile))
    }

    /// Number of outcomes
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of outcomes of the given kind
    pub fn count(&self, outcome: Outcome) -> usize {
        self.results.values().filter(|o| o.outcome == outcome).count()
    }

    /// Whether any test failed
    pub fn has_failures(&self) -> bool {
        self.count(Outcome::Failed) > 0
    }
}
