//! hubctl - Stack control plane library
//!
//! Supervision of a single-host privacy appliance built from containers:
//! - Deployment slots (A/B naming)
//! - Private subnet allocation
//! - VPN uplink profiles and gateway switching
//! - Bandwidth telemetry that survives restarts
//! - TLS certificate lifecycle (ACME with self-signed fallback)
//! - Staged or parallel stack launch
//!
//! All container operations go through the [`ContainerRuntime`] trait;
//! configuration is loaded once into a [`HubConfig`] and passed to each
//! component.

pub mod error;
pub mod config;
pub mod validation;
pub mod fsutil;
pub mod lock;
pub mod poll;
pub mod runtime;
pub mod slot;
pub mod subnet;
pub mod vpn;
pub mod certs;
pub mod launch;

// Re-export commonly used types
pub use error::{ErrorKind, HubError, HubResult};
pub use config::HubConfig;
pub use runtime::{ContainerRuntime, ContainerState, DockerCli, ServiceStatus};
pub use slot::{Slot, SlotManager};
pub use subnet::{Subnet, SubnetAllocator};
pub use vpn::{Activation, StackStatus, VpnProfileController};
pub use certs::{
    CertOutcome, CertTooling, CertificateManager, CertificateStatus, SystemCertTooling, TrustClass,
};
pub use launch::{LaunchMode, LaunchReport, LaunchSequencer, Reachability};
