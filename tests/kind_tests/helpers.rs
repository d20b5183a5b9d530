//! Shared helpers for the docker-backed stories

use std::path::PathBuf;
use std::process::Command;

use gateway_conformance::RUN_LABEL;

/// Whether a docker daemon answers
pub fn docker_available() -> bool {
    Command::new("docker")
        .args(["info", "--format", "{{.ServerVersion}}"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Whether an image is present in the local store
pub fn image_present(image: &str) -> bool {
    Command::new("docker")
        .args(["image", "inspect", image])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Path of a file under `fixtures/k8s-conformance`
pub fn fixture(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures/k8s-conformance")
        .join(relative)
}

/// Containers (running or not) labelled with a run's cluster name
pub fn labelled_containers(run: &str) -> Vec<String> {
    list(&["ps", "-aq", "--filter"], run)
}

/// Networks labelled with a run's cluster name
pub fn labelled_networks(run: &str) -> Vec<String> {
    list(&["network", "ls", "-q", "--filter"], run)
}

/// Run labels of every container and network whose run name starts with `prefix`
pub fn labelled_runs_with_prefix(prefix: &str) -> Vec<String> {
    let format = format!("{{{{.Label \"{}\"}}}}", RUN_LABEL);
    let mut runs = Vec::new();
    for args in [["ps", "-a"].as_slice(), ["network", "ls"].as_slice()] {
        let output = Command::new("docker")
            .args(args)
            .arg("--filter")
            .arg(format!("label={}", RUN_LABEL))
            .arg("--format")
            .arg(&format)
            .output()
            .expect("docker should run");
        runs.extend(lines(&output.stdout).into_iter().filter(|r| r.starts_with(prefix)));
    }
    runs
}

fn list(args: &[&str], run: &str) -> Vec<String> {
    let output = Command::new("docker")
        .args(args)
        .arg(format!("label={}={}", RUN_LABEL, run))
        .output()
        .expect("docker should run");
    assert!(output.status.success(), "docker {:?} failed", args);
    lines(&output.stdout)
}

fn lines(stdout: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
