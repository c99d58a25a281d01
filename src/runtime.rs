//! Container runtime interface
//!
//! The control plane never talks to containers directly; everything goes
//! through [`ContainerRuntime`]. [`DockerCli`] drives the `docker` and
//! `docker compose` command-line tools. Tests substitute a mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use crate::error::{HubError, HubResult};
use crate::validation;

/// Externally visible service state, as reported in the status JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Up,
    Starting,
    Unhealthy,
    Down,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Up => "up",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Down => "down",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

/// Snapshot of a container's state as reported by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerState {
    /// created, running, restarting, exited, paused, dead
    pub status: String,
    /// starting, healthy, unhealthy; `None` when no healthcheck is defined
    pub health: Option<String>,
    /// Output of the most recent health check
    pub last_health_log: Option<String>,
}

impl ContainerState {
    pub fn running(health: Option<&str>) -> Self {
        Self {
            status: "running".to_string(),
            health: health.map(str::to_string),
            last_health_log: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn is_healthy(&self) -> bool {
        self.is_running() && self.health.as_deref() == Some("healthy")
    }

    /// Running and either healthy or without a healthcheck
    pub fn is_ready(&self) -> bool {
        self.is_running() && matches!(self.health.as_deref(), None | Some("healthy"))
    }

    pub fn service_status(&self) -> ServiceStatus {
        match (self.status.as_str(), self.health.as_deref()) {
            ("running", None) | ("running", Some("healthy")) => ServiceStatus::Up,
            ("running", Some("starting")) => ServiceStatus::Starting,
            ("running", Some("unhealthy")) => ServiceStatus::Unhealthy,
            ("running", Some(_)) => ServiceStatus::Unknown,
            ("restarting", _) => ServiceStatus::Starting,
            ("created", _) | ("exited", _) | ("dead", _) | ("paused", _) | ("removing", _) => {
                ServiceStatus::Down
            }
            _ => ServiceStatus::Unknown,
        }
    }
}

/// Operations the control plane needs from the container runtime.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a bridge network with the given subnet. Fails if the range
    /// overlaps an existing network.
    async fn create_network(&self, name: &str, cidr: &str) -> HubResult<()>;

    /// Remove a network by name
    async fn remove_network(&self, name: &str) -> HubResult<()>;

    /// Inspect a container; `Ok(None)` if it does not exist
    async fn inspect(&self, container: &str) -> HubResult<Option<ContainerState>>;

    /// Stop a container
    async fn stop(&self, container: &str) -> HubResult<()>;

    /// Recreate services from the compose project, even if unchanged
    async fn force_recreate(&self, services: &[String]) -> HubResult<()>;

    /// Create/start services from the compose project
    async fn start(&self, services: &[String]) -> HubResult<()>;

    /// Run a command inside a running container and return its stdout
    async fn exec(&self, container: &str, command: &[String]) -> HubResult<String>;
}

/// `docker` CLI backed runtime
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    compose_file: Option<PathBuf>,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(None)
    }
}

impl DockerCli {
    pub fn new(compose_file: Option<PathBuf>) -> Self {
        Self {
            binary: "docker".to_string(),
            compose_file,
        }
    }

    /// Use a different client binary (e.g. `podman`)
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: &[String]) -> HubResult<std::process::Output> {
        debug!("Running: {} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| HubError::CommandFailed {
                cmd: format!("{} {}", self.binary, args.first().map(String::as_str).unwrap_or("")),
                code: None,
                stderr: e.to_string(),
            })
    }

    async fn run_checked(&self, args: &[String]) -> HubResult<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(HubError::command_failed(
                format!("{} {}", self.binary, args.join(" ")),
                &output,
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn compose_args(&self, tail: &[&str], services: &[String]) -> HubResult<Vec<String>> {
        let mut args = vec!["compose".to_string()];
        if let Some(file) = &self.compose_file {
            args.push("-f".to_string());
            args.push(file.to_string_lossy().to_string());
        }
        args.extend(tail.iter().map(|s| s.to_string()));
        for service in services {
            validation::validate_service_name(service)?;
            args.push(service.clone());
        }
        Ok(args)
    }
}

/// Parse `docker inspect --format '{{json .State}}'` output
pub fn parse_state_json(raw: &str) -> HubResult<ContainerState> {
    let value: serde_json::Value = serde_json::from_str(raw.trim())?;

    let status = value
        .get("Status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let health = value.get("Health").filter(|h| !h.is_null());
    let health_status = health
        .and_then(|h| h.get("Status"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let last_health_log = health
        .and_then(|h| h.get("Log"))
        .and_then(|v| v.as_array())
        .and_then(|log| log.last())
        .and_then(|entry| entry.get("Output"))
        .and_then(|v| v.as_str())
        .and_then(|out| out.lines().rev().find(|l| !l.trim().is_empty()))
        .map(|l| l.trim().to_string());

    Ok(ContainerState {
        status,
        health: health_status,
        last_health_log,
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create_network(&self, name: &str, cidr: &str) -> HubResult<()> {
        let args: Vec<String> = ["network", "create", "--driver", "bridge", "--subnet", cidr, name]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.run_checked(&args).await.map(|_| ())
    }

    async fn remove_network(&self, name: &str) -> HubResult<()> {
        let args = vec!["network".to_string(), "rm".to_string(), name.to_string()];
        self.run_checked(&args).await.map(|_| ())
    }

    async fn inspect(&self, container: &str) -> HubResult<Option<ContainerState>> {
        validation::validate_service_name(container)?;
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .State}}".to_string(),
            container.to_string(),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such object") || stderr.contains("No such container") {
                return Ok(None);
            }
            return Err(HubError::command_failed(format!("{} inspect {}", self.binary, container), &output));
        }
        parse_state_json(&String::from_utf8_lossy(&output.stdout)).map(Some)
    }

    async fn stop(&self, container: &str) -> HubResult<()> {
        validation::validate_service_name(container)?;
        let args = vec!["stop".to_string(), container.to_string()];
        self.run_checked(&args).await.map(|_| ())
    }

    async fn force_recreate(&self, services: &[String]) -> HubResult<()> {
        let args = self.compose_args(&["up", "-d", "--no-deps", "--force-recreate"], services)?;
        self.run_checked(&args).await.map(|_| ())
    }

    async fn start(&self, services: &[String]) -> HubResult<()> {
        let args = self.compose_args(&["up", "-d", "--no-deps"], services)?;
        self.run_checked(&args).await.map(|_| ())
    }

    async fn exec(&self, container: &str, command: &[String]) -> HubResult<String> {
        validation::validate_service_name(container)?;
        let mut args = vec!["exec".to_string(), container.to_string()];
        args.extend(command.iter().cloned());
        self.run_checked(&args).await
    }
}
