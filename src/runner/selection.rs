//! Which tests run, which are skipped, and why

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::suite::{ConformanceTest, Feature, ProfileName};

/// Operator's choice of what to exercise
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSelection {
    /// Profiles to run
    pub profiles: BTreeSet<ProfileName>,
    /// Features the subject claims to support
    pub supported_features: BTreeSet<Feature>,
    /// Treat every feature declared by the selected profiles as supported
    pub enable_all_supported_features: bool,
    /// Run only the test with exactly this name
    pub run_test: Option<String>,
    /// Tests to skip by name
    pub skip_tests: BTreeSet<String>,
}

/// What happens to a selected test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Execute the test
    Run,
    /// Record the test as skipped with the given reason
    Skip(String),
}

/// Tests grouped by profile, in execution order
pub struct SelectionPlan {
    /// Profiles in lexicographic order
    pub profiles: Vec<ProfilePlan>,
    /// Features considered supported for this run
    pub effective_features: BTreeSet<Feature>,
}

/// One profile's share of the plan
pub struct ProfilePlan {
    /// Profile name
    pub name: ProfileName,
    /// Included tests, in registry order
    pub tests: Vec<Arc<dyn ConformanceTest>>,
    /// Features declared by this profile's tests that are supported
    pub supported_features: BTreeSet<Feature>,
    /// Features declared by this profile's tests that are not supported
    pub unsupported_features: BTreeSet<Feature>,
}

impl TestSelection {
    /// Select the given profiles with nothing else configured
    pub fn for_profiles<I, P>(profiles: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProfileName>,
    {
        Self {
            profiles: profiles.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Whether the test belongs to a selected profile and matches the name filter
    pub fn includes(&self, test: &dyn ConformanceTest) -> bool {
        let in_profile = test.profiles().iter().any(|p| self.profiles.contains(p));
        let name_matches = self
            .run_test
            .as_deref()
            .map_or(true, |name| name == test.name());
        in_profile && name_matches
    }

    /// Features treated as supported given the full test list
    pub fn effective_features(&self, tests: &[Arc<dyn ConformanceTest>]) -> BTreeSet<Feature> {
        if !self.enable_all_supported_features {
            return self.supported_features.clone();
        }
        tests
            .iter()
            .filter(|t| t.profiles().iter().any(|p| self.profiles.contains(p)))
            .flat_map(|t| t.features().iter().cloned())
            .chain(self.supported_features.iter().cloned())
            .collect()
    }

    /// Run or skip an included test
    pub fn decide(&self, test: &dyn ConformanceTest, effective: &BTreeSet<Feature>) -> Decision {
        if self.skip_tests.contains(test.name()) {
            return Decision::Skip("skipped by configuration".to_string());
        }
        let missing: Vec<_> = test
            .features()
            .iter()
            .filter(|f| !effective.contains(f))
            .map(Feature::to_string)
            .collect();
        if missing.is_empty() {
            Decision::Run
        } else {
            Decision::Skip(format!("unsupported features: {}", missing.join(", ")))
        }
    }

    /// Group included tests by selected profile
    pub fn plan(&self, tests: &[Arc<dyn ConformanceTest>]) -> SelectionPlan {
        let effective_features = self.effective_features(tests);

        let profiles = self
            .profiles
            .iter()
            .map(|profile| {
                let members: Vec<_> = tests
                    .iter()
                    .filter(|t| t.profiles().contains(profile))
                    .collect();
                let declared: BTreeSet<Feature> = members
                    .iter()
                    .flat_map(|t| t.features().iter().cloned())
                    .collect();
                let (supported_features, unsupported_features) = declared
                    .into_iter()
                    .partition(|f| effective_features.contains(f));

                ProfilePlan {
                    name: profile.clone(),
                    tests: members
                        .into_iter()
                        .filter(|t| self.includes(t.as_ref()))
                        .cloned()
                        .collect(),
                    supported_features,
                    unsupported_features,
                }
            })
            .collect();

        SelectionPlan {
            profiles,
            effective_features,
        }
    }
}
