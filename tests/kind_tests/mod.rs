//! Integration tests for the conformance harness
//!
//! These tests drive the harness against a real docker daemon and tell the
//! story of how a run behaves end to end.
//!
//! # Test Organization
//!
//! - `cluster_lifecycle`: Stories about provisioning and releasing the
//!   ephemeral k3s cluster, including failure paths that must not leak
//!   containers or networks
//!
//! - `conformance_run`: The full flow with the bundled registry, from image
//!   check to the persisted report (slow, several minutes)
//!
//! # Running These Tests
//!
//! ```bash
//! # Lifecycle stories only (~1min)
//! cargo test --test kind cluster_lifecycle -- --ignored --nocapture
//!
//! # Full conformance run
//! cargo test --test kind conformance_run -- --ignored --nocapture
//! ```

mod cluster_lifecycle;
mod conformance_run;
mod helpers;
