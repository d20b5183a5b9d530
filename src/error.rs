//! Error types for the conformance harness
//!
//! Errors carry the context an operator needs to understand why a run stopped:
//! the provisioning stage that broke, the schema that was never registered,
//! the endpoint that never answered. Per-test failures are not errors at this
//! level; they are recorded into the [`OutcomeSet`](crate::runner::OutcomeSet).

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for harness operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The subject image is not present in the local container runtime
    #[error("image {image} is not present locally; build or pull it before running")]
    ImageNotFound {
        /// The image reference that was looked up
        image: String,
    },

    /// Cluster provisioning failed (container start, image load, manifest apply)
    #[error("provision error [{stage}]: {message}")]
    Provision {
        /// Provisioning stage that failed (e.g. "network", "image-load", "manifest")
        stage: String,
        /// Description of what failed
        message: String,
    },

    /// The subject deployment never reported ready within its timeout
    #[error("subject {deployment} not ready: {reason}")]
    SubjectNotReady {
        /// `namespace/name` of the subject deployment
        deployment: String,
        /// Unavailability reason reported by the cluster, if any
        reason: String,
    },

    /// A resource kind was used without being registered in the schema registry
    #[error("schema not registered: {kind} ({group})")]
    SchemaNotRegistered {
        /// API group of the missing schema ("" for core)
        group: String,
        /// Kind of the missing schema
        kind: String,
    },

    /// The subject endpoint never passed the pre-flight probe
    #[error("subject unreachable at {endpoint}: {message}")]
    SubjectUnreachable {
        /// The endpoint that was probed
        endpoint: String,
        /// Last observed failure
        message: String,
    },

    /// An individual test could not be evaluated
    #[error("test {test} failed: {message}")]
    TestExecution {
        /// Test name
        test: String,
        /// Diagnostic text
        message: String,
    },

    /// The report could not be written to storage
    #[error("failed to persist report to {}: {source}", path.display())]
    Persist {
        /// Destination path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The test registry could not be loaded or is inconsistent
    #[error("registry error: {0}")]
    Registry(String),

    /// A container runtime command failed
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Invalid harness configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The run was cancelled before it completed
    #[error("run cancelled")]
    Cancelled,

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Local I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a provisioning error for the given stage
    pub fn provision(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provision {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a schema-not-registered error
    pub fn schema_not_registered(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::SchemaNotRegistered {
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// Create a subject-unreachable error
    pub fn subject_unreachable(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SubjectUnreachable {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a test execution error
    pub fn test_execution(test: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TestExecution {
            test: test.into(),
            message: msg.into(),
        }
    }

    /// Create a registry error with the given message
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a container runtime error with the given message
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error terminates the run.
    ///
    /// Only per-test execution errors are isolated; everything else ends the
    /// run after diagnostics and teardown.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TestExecution { .. })
    }
}
