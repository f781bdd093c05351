//! Execution substrate: the thing labs actually run on.
//!
//! [`Substrate`] is the narrow contract the orchestrator and providers
//! depend on; [`DockerCli`] implements it by shelling out to the `docker`
//! binary. Networks are created per run and containers join it, so a
//! forced teardown can clean up from ledger records alone.

use std::collections::BTreeMap;
use std::process::{Command, Output};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("failed to launch {binary}: {detail}")]
    Spawn { binary: String, detail: String },
    #[error("substrate command failed ({command}): {detail}")]
    Command { command: String, detail: String },
    #[error("failed to start resource '{name}': {detail}")]
    StartFailed { name: String, detail: String },
}

/// Request to stand up one resource on the run's shared network.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub run_id: String,
    pub image: String,
    pub name: String,
    pub env: Vec<(String, String)>,
    /// host port -> container port
    pub ports: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct StartedResource {
    pub resource_id: String,
    pub port_mappings: BTreeMap<String, String>,
}

pub trait Substrate {
    fn check_reachable(&self) -> bool;
    /// Idempotent: returns the existing network handle when called twice
    /// for the same run id.
    fn create_shared_network(&self, run_id: &str) -> Result<String, SubstrateError>;
    /// Idempotent: a no-op when the network is already gone.
    fn remove_shared_network(&self, run_id: &str) -> Result<(), SubstrateError>;
    fn start_resource(&self, request: &StartRequest) -> Result<StartedResource, SubstrateError>;
    /// Idempotent: a no-op when the resource is already stopped or removed.
    fn stop_resource(&self, resource_id: &str) -> Result<(), SubstrateError>;
}

pub fn network_name(run_id: &str) -> String {
    format!("vriksh-net-{}", run_id)
}

pub fn container_name(run_id: &str, name: &str) -> String {
    format!("vriksh-{}-{}", run_id, name)
}

/// Docker-CLI-backed substrate. Containers run detached with `--rm`, so a
/// stop is also a removal.
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an alternative docker-compatible binary (e.g. podman).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn exec(&self, args: &[String]) -> Result<Output, SubstrateError> {
        Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| SubstrateError::Spawn {
                binary: self.binary.clone(),
                detail: e.to_string(),
            })
    }

    fn exec_ok(&self, args: &[String]) -> Result<String, SubstrateError> {
        let output = self.exec(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(SubstrateError::Command {
                command: format!("{} {}", self.binary, args.join(" ")),
                detail: stderr_tail(&output),
            })
        }
    }
}

impl Substrate for DockerCli {
    fn check_reachable(&self) -> bool {
        self.exec(&to_args(&["info", "--format", "{{.ServerVersion}}"]))
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn create_shared_network(&self, run_id: &str) -> Result<String, SubstrateError> {
        let name = network_name(run_id);
        let inspect = self.exec(&to_args(&["network", "inspect", &name, "--format", "{{.Id}}"]))?;
        if inspect.status.success() {
            let id = String::from_utf8_lossy(&inspect.stdout).trim().to_string();
            tracing::debug!(network = %name, id = %id, "shared network already exists");
            return Ok(id);
        }
        let id = self.exec_ok(&to_args(&["network", "create", "--driver", "bridge", &name]))?;
        tracing::info!(network = %name, id = %id, "created shared network");
        Ok(id)
    }

    fn remove_shared_network(&self, run_id: &str) -> Result<(), SubstrateError> {
        let name = network_name(run_id);
        let output = self.exec(&to_args(&["network", "rm", &name]))?;
        if output.status.success() || is_missing_resource(&stderr_tail(&output)) {
            return Ok(());
        }
        Err(SubstrateError::Command {
            command: format!("{} network rm {}", self.binary, name),
            detail: stderr_tail(&output),
        })
    }

    fn start_resource(&self, request: &StartRequest) -> Result<StartedResource, SubstrateError> {
        let args = start_resource_args(request);
        let output = self.exec(&args)?;
        if !output.status.success() {
            return Err(SubstrateError::StartFailed {
                name: request.name.clone(),
                detail: stderr_tail(&output),
            });
        }
        let resource_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::info!(
            container = %container_name(&request.run_id, &request.name),
            resource_id = %resource_id,
            "resource started"
        );
        Ok(StartedResource {
            resource_id,
            port_mappings: request.ports.clone(),
        })
    }

    fn stop_resource(&self, resource_id: &str) -> Result<(), SubstrateError> {
        let output = self.exec(&to_args(&["stop", resource_id]))?;
        if output.status.success() || is_missing_resource(&stderr_tail(&output)) {
            return Ok(());
        }
        Err(SubstrateError::Command {
            command: format!("{} stop {}", self.binary, resource_id),
            detail: stderr_tail(&output),
        })
    }
}

/// `docker run` argument list for a [`StartRequest`]. Pure so it can be
/// checked without a docker daemon.
pub fn start_resource_args(request: &StartRequest) -> Vec<String> {
    let mut args = to_args(&[
        "run",
        "-d",
        "--rm",
        "--name",
        &container_name(&request.run_id, &request.name),
        "--network",
        &network_name(&request.run_id),
    ]);
    for (key, value) in &request.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for (host, container) in &request.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", host, container));
    }
    args.push(request.image.clone());
    args
}

fn to_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn stderr_tail(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no error output")
        .to_string()
}

fn is_missing_resource(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container")
        || lower.contains("no such network")
        || lower.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_embed_the_run_id() {
        assert_eq!(network_name("run_1"), "vriksh-net-run_1");
        assert_eq!(container_name("run_1", "gitlab-main"), "vriksh-run_1-gitlab-main");
    }

    #[test]
    fn start_args_cover_network_env_and_ports() {
        let mut ports = BTreeMap::new();
        ports.insert("8923".to_string(), "80".to_string());
        let request = StartRequest {
            run_id: "run_1".to_string(),
            image: "gitlab/gitlab-ce:latest".to_string(),
            name: "gitlab-main".to_string(),
            env: vec![("GITLAB_ROOT_PASSWORD".to_string(), "secret".to_string())],
            ports,
        };
        let args = start_resource_args(&request);
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"vriksh-run_1-gitlab-main".to_string()));
        assert!(args.contains(&"vriksh-net-run_1".to_string()));
        assert!(args.contains(&"GITLAB_ROOT_PASSWORD=secret".to_string()));
        assert!(args.contains(&"8923:80".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("gitlab/gitlab-ce:latest"));
    }

    #[test]
    fn missing_resource_errors_are_treated_as_absent() {
        assert!(is_missing_resource("Error response from daemon: No such container: abc"));
        assert!(is_missing_resource("Error: network vriksh-net-run_1 not found"));
        assert!(!is_missing_resource("Error response from daemon: conflict"));
    }

    #[cfg(unix)]
    fn fake_docker(script_body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        use std::time::{SystemTime, UNIX_EPOCH};

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "vriksh-substrate-test-{}-{}",
            std::process::id(),
            stamp
        ));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("docker");
        std::fs::write(&path, script_body).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[test]
    fn stopping_an_already_stopped_resource_is_a_no_op() {
        let script =
            "#!/bin/sh\necho \"Error response from daemon: No such container: $2\" >&2\nexit 1\n";
        let docker = DockerCli::with_binary(fake_docker(script).to_string_lossy());
        docker.stop_resource("cid-1").expect("first stop");
        docker.stop_resource("cid-1").expect("second stop");
    }

    #[cfg(unix)]
    #[test]
    fn removing_an_absent_network_is_a_no_op() {
        let script = "#!/bin/sh\necho \"Error: No such network: vriksh-net-run_1\" >&2\nexit 1\n";
        let docker = DockerCli::with_binary(fake_docker(script).to_string_lossy());
        docker
            .remove_shared_network("run_1")
            .expect("remove absent network");
    }
}
