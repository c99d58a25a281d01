//! VPN uplink control
//!
//! Profile management, gateway switching and bandwidth telemetry for the
//! VPN gateway container and the WireGuard server clients connect to.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   VpnProfileController (activate,    │
//! │   delete, upload, list, status)      │
//! └───────┬───────────┬───────────┬──────┘
//!         │           │           │
//!         ▼           ▼           ▼
//!   ┌──────────┐ ┌─────────┐ ┌───────────┐
//!   │ profile  │ │  probe  │ │ telemetry │
//!   └──────────┘ └─────────┘ └───────────┘
//!                     │
//!                     ▼
//!             ContainerRuntime
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use libhubctl::{HubConfig, DockerCli};
//! use libhubctl::vpn::VpnProfileController;
//!
//! # async fn run() -> libhubctl::HubResult<()> {
//! let config = HubConfig::load_or_default(None)?;
//! let runtime = Arc::new(DockerCli::new(config.stack.compose_file.clone()));
//! let controller = VpnProfileController::new(&config, runtime);
//!
//! controller.activate("mullvad-se").await?;
//! println!("{}", controller.status().await?.to_json());
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod probe;
pub mod profile;
pub mod status;
pub mod telemetry;

pub use controller::{Activation, VpnProfileController};
pub use profile::{extract_profile_name, ActiveVpnState, Profile, ProfileStore, UNKNOWN_PROFILE};
pub use status::{GatewayStatus, StackStatus, WgEasyStatus};
pub use telemetry::{BandwidthAccumulator, BandwidthReport, CounterSample, CounterSnapshot, Counters};
