//! Status document consumed by the dashboard.
//!
//! Field names are part of the dashboard contract. Every string that can
//! carry externally influenced text goes through
//! [`validation::sanitize_json_string`] before it lands here.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::runtime::{ContainerState, ServiceStatus};
use crate::validation::{self, MAX_HEALTH_DETAIL_LEN};
use super::probe::{self, GatewayReading, WgEasyReading};
use super::telemetry::BandwidthReport;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStatus {
    pub status: String,
    pub healthy: bool,
    pub active_profile: String,
    pub endpoint: String,
    pub public_ip: String,
    pub handshake_ago: String,
    pub session_rx: u64,
    pub session_tx: u64,
    pub total_rx: u64,
    pub total_tx: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WgEasyStatus {
    pub status: String,
    pub host: String,
    pub clients: usize,
    pub connected: usize,
    pub session_rx: u64,
    pub session_tx: u64,
    pub total_rx: u64,
    pub total_tx: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackStatus {
    pub gluetun: GatewayStatus,
    pub wgeasy: WgEasyStatus,
    pub services: BTreeMap<String, ServiceStatus>,
    pub health_details: BTreeMap<String, String>,
}

/// Gateway state: `up` only once healthy.
///
/// Unlike [`ContainerState::service_status`], a running gateway without a
/// healthcheck is `down`.
pub fn gateway_status_label(state: Option<&ContainerState>) -> &'static str {
    match state {
        Some(s) if s.is_healthy() => "up",
        Some(s) if s.is_running() && s.health.as_deref() == Some("starting") => "starting",
        _ => "down",
    }
}

impl GatewayStatus {
    pub fn from_reading(
        reading: &GatewayReading,
        active_profile: &str,
        bandwidth: BandwidthReport,
        now: i64,
    ) -> Self {
        let state = reading.state.as_ref();
        Self {
            status: gateway_status_label(state).to_string(),
            healthy: state.map(|s| s.is_healthy()).unwrap_or(false),
            active_profile: validation::sanitize_json_string(active_profile),
            endpoint: validation::sanitize_json_string(reading.endpoint.as_deref().unwrap_or("")),
            public_ip: validation::sanitize_json_string(reading.public_ip.as_deref().unwrap_or("")),
            handshake_ago: probe::format_handshake_ago(reading.latest_handshake, now),
            session_rx: bandwidth.session_rx,
            session_tx: bandwidth.session_tx,
            total_rx: bandwidth.total_rx,
            total_tx: bandwidth.total_tx,
        }
    }
}

impl WgEasyStatus {
    pub fn from_reading(reading: &WgEasyReading, host: &str, bandwidth: BandwidthReport) -> Self {
        Self {
            status: if reading.running { "up" } else { "down" }.to_string(),
            host: validation::sanitize_json_string(host),
            clients: reading.clients,
            connected: reading.connected,
            session_rx: bandwidth.session_rx,
            session_tx: bandwidth.session_tx,
            total_rx: bandwidth.total_rx,
            total_tx: bandwidth.total_tx,
        }
    }
}

impl StackStatus {
    /// Record one service's inspect result.
    ///
    /// An absent container is `down`; an inspect failure is `unknown`.
    pub fn record_service(&mut self, service: &str, inspected: Result<Option<ContainerState>, String>) {
        let key = validation::sanitize_json_string(service);
        let status = match &inspected {
            Ok(Some(state)) => state.service_status(),
            Ok(None) => ServiceStatus::Down,
            Err(_) => ServiceStatus::Unknown,
        };
        self.services.insert(key.clone(), status);

        let detail = match inspected {
            Ok(Some(state)) if status != ServiceStatus::Up => state.last_health_log,
            Err(e) => Some(e),
            _ => None,
        };
        if let Some(detail) = detail.filter(|d| !d.trim().is_empty()) {
            self.health_details
                .insert(key, validation::sanitize_truncated(&detail, MAX_HEALTH_DETAIL_LEN));
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings, integers and maps with string keys: cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
