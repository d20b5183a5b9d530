//! [`ContainerRuntime`] backed by the docker CLI

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use super::{ContainerRuntime, ContainerSpec, ExecOutput, ImageInfo};
use crate::{Error, Result};

/// Docker CLI runtime.
///
/// Shells out to `docker` (or the binary named at construction, e.g. a
/// docker-compatible `podman`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// Create a runtime that invokes `binary`
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn output(&self, args: &[String]) -> Result<std::process::Output> {
        trace!(binary = %self.binary, ?args, "running container runtime command");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::runtime(format!("failed to spawn {}: {}", self.binary, e)))
    }

    /// Run a command and return trimmed stdout, failing on non-zero exit
    async fn run(&self, args: &[String]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(Error::runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Build the `docker run` argument list for a [`ContainerSpec`]
fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut out = args(&["run", "--detach", "--name", &spec.name, "--hostname", &spec.name]);

    if let Some(network) = &spec.network {
        out.push("--network".into());
        out.push(network.clone());
    }
    if spec.privileged {
        out.push("--privileged".into());
    }
    if spec.cgroupns_host {
        out.push("--cgroupns=host".into());
    }
    for path in &spec.tmpfs {
        out.push("--tmpfs".into());
        out.push(path.clone());
    }
    for port in &spec.published_ports {
        out.push("--publish".into());
        out.push(format!("127.0.0.1::{}", port));
    }
    for (key, value) in &spec.labels {
        out.push("--label".into());
        out.push(format!("{}={}", key, value));
    }

    out.push(spec.image.clone());
    out.extend(spec.args.iter().cloned());
    out
}

/// Whether `docker rm` failed only because the container never existed
fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container")
}

/// Parse `docker port` output (`127.0.0.1:49153`, possibly one line per family)
fn parse_host_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|port| port.parse().ok())
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let out = self
            .run(&args(&["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"]))
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.contains("<none>"))
            .map(|name| ImageInfo {
                name: name.to_string(),
            })
            .collect())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut cmd = args(&["network", "create", "--driver", "bridge"]);
        for (key, value) in labels {
            cmd.push("--label".into());
            cmd.push(format!("{}={}", key, value));
        }
        cmd.push(name.to_string());
        self.run(&cmd).await
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        self.run(&args(&["network", "rm", id])).await.map(|_| ())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.run(&run_args(spec)).await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let output = self
            .output(&args(&["rm", "--force", "--volumes", id]))
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || is_missing_container(&stderr) {
            return Ok(());
        }
        Err(Error::runtime(format!(
            "{} rm failed: {}",
            self.binary,
            stderr.trim()
        )))
    }

    async fn container_ip(&self, id: &str, network: &str) -> Result<String> {
        let format = format!(
            "{{{{(index .NetworkSettings.Networks \"{}\").IPAddress}}}}",
            network
        );
        let ip = self.run(&args(&["inspect", "--format", &format, id])).await?;
        if ip.is_empty() {
            return Err(Error::runtime(format!(
                "container {} has no address on network {}",
                id, network
            )));
        }
        Ok(ip)
    }

    async fn host_port(&self, id: &str, container_port: u16) -> Result<u16> {
        let out = self
            .run(&args(&["port", id, &format!("{}/tcp", container_port)]))
            .await?;
        parse_host_port(&out).ok_or_else(|| {
            Error::runtime(format!(
                "container {} does not publish port {}: {:?}",
                id, container_port, out
            ))
        })
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let mut full = args(&["exec", id]);
        full.extend(cmd.iter().cloned());
        let output = self.output(&full).await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn logs(&self, id: &str) -> Result<String> {
        let output = self.output(&args(&["logs", id])).await?;
        if !output.status.success() {
            return Err(Error::runtime(format!(
                "{} logs failed: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        // k3s writes most of its log to stderr
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    async fn save_image(&self, image: &str, dest: &Path) -> Result<()> {
        let dest = dest
            .to_str()
            .ok_or_else(|| Error::runtime("image archive path contains invalid UTF-8"))?;
        self.run(&args(&["save", "--output", dest, image]))
            .await
            .map(|_| ())
    }

    async fn copy_to_container(&self, id: &str, src: &Path, dest: &str) -> Result<()> {
        let src = src
            .to_str()
            .ok_or_else(|| Error::runtime("copy source path contains invalid UTF-8"))?;
        self.run(&args(&["cp", src, &format!("{}:{}", id, dest)]))
            .await
            .map(|_| ())
    }
}
