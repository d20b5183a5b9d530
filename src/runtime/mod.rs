//! Container runtime abstraction
//!
//! The harness never links against a container engine. Everything it needs
//! (image inventory, networks, the cluster container, exec, logs) goes through
//! [`ContainerRuntime`], which the production build backs with the docker CLI
//! and unit tests replace with a mock.

mod docker;

pub use docker::DockerCli;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::Result;

/// An image known to the local runtime, as `repository:tag`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image reference as reported by the runtime
    pub name: String,
}

/// Everything needed to start a long-running container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name (also used as hostname)
    pub name: String,
    /// Image reference
    pub image: String,
    /// Network to attach the container to
    pub network: Option<String>,
    /// Run with extended privileges (required by k3s)
    pub privileged: bool,
    /// Share the host cgroup namespace (required by k3s on cgroup v2)
    pub cgroupns_host: bool,
    /// Paths mounted as tmpfs
    pub tmpfs: Vec<String>,
    /// Container ports published on an ephemeral loopback port
    pub published_ports: Vec<u16>,
    /// Labels attached to the container
    pub labels: BTreeMap<String, String>,
    /// Arguments passed to the image entrypoint
    pub args: Vec<String>,
}

/// Result of running a command inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Operations the harness needs from a container engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List images present in the local store
    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Create a bridge network and return its id
    async fn create_network(&self, name: &str, labels: &BTreeMap<String, String>)
        -> Result<String>;

    /// Remove a network
    async fn remove_network(&self, id: &str) -> Result<()>;

    /// Start a detached container and return its id
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Force-remove a container and its anonymous volumes
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// IP address of a container on the given network
    async fn container_ip(&self, id: &str, network: &str) -> Result<String>;

    /// Host port bound to a published container port
    async fn host_port(&self, id: &str, container_port: u16) -> Result<u16>;

    /// Run a command inside a container; a non-zero exit is not an error
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Combined stdout/stderr of a container
    async fn logs(&self, id: &str) -> Result<String>;

    /// Export an image to a tar archive on the host
    async fn save_image(&self, image: &str, dest: &Path) -> Result<()>;

    /// Copy a host file into a container
    async fn copy_to_container(&self, id: &str, src: &Path, dest: &str) -> Result<()>;
}

/// Build an exec command line from string slices
pub fn command(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
