//! Stack launch sequencing
//!
//! Parallel mode starts every service at once. Staged mode brings up the
//! foundation services first and waits (bounded) for them to become ready,
//! because several services expect the gateway's network namespace to be
//! routable when they start. Neither mode fails on a slow or broken
//! service; problems end up in the [`LaunchReport`].

use futures::future::join_all;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{HubConfig, LaunchSettings, StackSettings};
use crate::error::{HubError, HubResult};
use crate::poll::{poll_until, PollOutcome};
use crate::runtime::ContainerRuntime;
use crate::slot::SlotManager;

/// Timeout of the post-launch reachability probe
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Parallel,
    Staged,
}

impl FromStr for LaunchMode {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "parallel" => Ok(LaunchMode::Parallel),
            "staged" => Ok(LaunchMode::Staged),
            other => Err(HubError::InvalidParameter(format!(
                "Unknown launch mode '{}' (expected parallel or staged)",
                other
            ))),
        }
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchMode::Parallel => write!(f, "parallel"),
            LaunchMode::Staged => write!(f, "staged"),
        }
    }
}

/// Control-plane endpoint classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    AuthRequired,
    Unexpected(u16),
    Unreachable(String),
}

impl Reachability {
    pub fn from_status(code: u16) -> Self {
        match code {
            200 => Reachability::Reachable,
            401 => Reachability::AuthRequired,
            other => Reachability::Unexpected(other),
        }
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, Reachability::Reachable | Reachability::AuthRequired)
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Reachable => write!(f, "reachable"),
            Reachability::AuthRequired => write!(f, "reachable (authentication required)"),
            Reachability::Unexpected(code) => write!(f, "unexpected HTTP status {}", code),
            Reachability::Unreachable(reason) => write!(f, "unreachable: {}", reason),
        }
    }
}

/// Single GET against `url`; never an error
pub async fn probe_reachability(url: &str, timeout: Duration) -> Reachability {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => return Reachability::Unreachable(e.to_string()),
    };
    match client.get(url).send().await {
        Ok(response) => Reachability::from_status(response.status().as_u16()),
        Err(e) => Reachability::Unreachable(e.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    pub mode: LaunchMode,
    /// Foundation services became ready in time (always true in parallel mode)
    pub foundation_ready: bool,
    /// Services whose start command failed
    pub failed: Vec<String>,
}

impl LaunchReport {
    pub fn is_degraded(&self) -> bool {
        !self.foundation_ready || !self.failed.is_empty()
    }
}

pub struct LaunchSequencer {
    runtime: Arc<dyn ContainerRuntime>,
    slots: SlotManager,
    stack: StackSettings,
    settings: LaunchSettings,
    api_url: String,
}

impl LaunchSequencer {
    pub fn new(config: &HubConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let api_url = config
            .launch
            .api_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:55555/api/status", config.network.lan_ip));
        Self {
            runtime,
            slots: SlotManager::new(config.paths.slot_file(), config.stack.app_name.clone()),
            stack: config.stack.clone(),
            settings: config.launch.clone(),
            api_url,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Launch, then probe the control-plane endpoint once
    pub async fn run(&self, mode: LaunchMode) -> HubResult<(LaunchReport, Reachability)> {
        let report = self.launch(mode).await?;
        let reachability = probe_reachability(&self.api_url, REACHABILITY_TIMEOUT).await;
        if reachability.is_reachable() {
            info!("Control plane at {} is {}", self.api_url, reachability);
        } else {
            warn!("Control plane at {} is {}", self.api_url, reachability);
        }
        Ok((report, reachability))
    }

    pub async fn launch(&self, mode: LaunchMode) -> HubResult<LaunchReport> {
        info!("Launching {} services ({} mode)", self.stack.services.len(), mode);
        match mode {
            LaunchMode::Parallel => {
                let failed = self.start_each(&self.stack.services).await;
                Ok(LaunchReport {
                    mode,
                    foundation_ready: true,
                    failed,
                })
            }
            LaunchMode::Staged => self.launch_staged().await,
        }
    }

    async fn start_each(&self, services: &[String]) -> Vec<String> {
        let results = join_all(services.iter().map(|service| async move {
            (service, self.runtime.start(std::slice::from_ref(service)).await)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(service, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!("Failed to start {}: {}", service, e);
                    Some(service.clone())
                }
            })
            .collect()
    }

    async fn launch_staged(&self) -> HubResult<LaunchReport> {
        let foundation = &self.stack.foundation_services;
        let mut failed = Vec::new();

        if let Err(e) = self.runtime.start(foundation).await {
            warn!("Failed to start foundation services: {}", e);
            failed.extend(foundation.iter().cloned());
        }

        let prefix = self.slots.prefix()?;
        let containers: Vec<String> = foundation.iter().map(|s| format!("{}{}", prefix, s)).collect();
        let runtime = &self.runtime;
        let containers_ref = &containers;
        let outcome = poll_until(self.settings.health_interval(), self.settings.health_timeout(), || async move {
            for container in containers_ref {
                match runtime.inspect(container).await {
                    Ok(Some(state)) if state.is_ready() => {}
                    _ => return false,
                }
            }
            true
        })
        .await;

        let foundation_ready = match outcome {
            PollOutcome::Ready { elapsed, .. } => {
                info!("Foundation services ready after {:?}", elapsed);
                true
            }
            PollOutcome::TimedOut { .. } => {
                warn!(
                    "Foundation services not ready after {:?}, continuing anyway",
                    self.settings.health_timeout()
                );
                false
            }
        };

        let rest: Vec<String> = self
            .stack
            .services
            .iter()
            .filter(|s| !foundation.contains(s))
            .cloned()
            .collect();
        if !rest.is_empty() {
            if let Err(e) = self.runtime.start(&rest).await {
                warn!("Failed to start remaining services: {}", e);
                failed.extend(rest);
            }
        }

        Ok(LaunchReport {
            mode: LaunchMode::Staged,
            foundation_ready,
            failed,
        })
    }
}
