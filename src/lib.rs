//! Gateway API conformance harness
//!
//! Provisions an ephemeral k3s cluster in a container, deploys a locally built
//! Gateway API implementation into it, runs an externally supplied conformance
//! registry against it and writes a deterministic, versioned report.
//!
//! # Flow
//!
//! 1. [`image`] checks the subject image exists in the local runtime
//! 2. [`cluster`] starts k3s, loads the image, applies bootstrap manifests and
//!    waits for the subject deployment
//! 3. [`client`] builds an API client with every schema the registry needs
//! 4. [`runner`] probes the subject and executes the selected tests
//! 5. [`report`] normalizes outcomes and persists the report
//! 6. [`diagnostics`] and [`cluster::ScopedCluster`] capture logs and release
//!    every resource, whatever happened before
//!
//! [`harness`] wires the stages together.
//!
//! # Modules
//!
//! - [`runtime`] - Container runtime abstraction (docker CLI)
//! - [`manifest`] - Multi-document bootstrap manifests
//! - [`suite`] - Test registry plug-in surface and the bundled filesystem registry
//! - [`config`] - Command-line and environment configuration
//! - [`retry`] - Backoff and bounded polling helpers
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod client;
pub mod cluster;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod harness;
pub mod image;
pub mod manifest;
pub mod report;
pub mod retry;
pub mod runner;
pub mod runtime;
pub mod suite;

pub use config::{Cli, HarnessConfig, RunArgs};
pub use error::Error;
pub use harness::{Harness, RunReport, RunStatus};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "gateway-conformance";

/// Label put on every container and network a run creates
pub const RUN_LABEL: &str = "io.gateway-conformance.run";
