//! Live readings from the VPN gateway and the VPN server.
//!
//! Both subsystems are queried through the container runtime. Any failure
//! yields an "unavailable" reading rather than an error: status polling must
//! keep working while containers restart.

use std::path::Path;
use tracing::debug;

use crate::config::VpnSettings;
use crate::runtime::{ContainerRuntime, ContainerState};
use super::telemetry::{CounterSample, Counters};

/// One peer line from `wg show <iface> dump`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeer {
    pub public_key: String,
    pub endpoint: Option<String>,
    /// Unix seconds; 0 means no handshake yet
    pub latest_handshake: i64,
    pub rx: u64,
    pub tx: u64,
}

/// Parse `wg show <iface> dump` output.
///
/// The first line describes the interface and is skipped. Peer lines are
/// tab-separated: public key, preshared key, endpoint, allowed ips, latest
/// handshake, rx bytes, tx bytes, keepalive.
pub fn parse_wg_dump(output: &str) -> Vec<WgPeer> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 7 {
                return None;
            }
            let endpoint = match parts[2] {
                "(none)" | "" => None,
                e => Some(e.to_string()),
            };
            Some(WgPeer {
                public_key: parts[0].to_string(),
                endpoint,
                latest_handshake: parts[4].parse().unwrap_or(0),
                rx: parts[5].parse().unwrap_or(0),
                tx: parts[6].parse().unwrap_or(0),
            })
        })
        .collect()
}

/// Render the age of a handshake for the dashboard
pub fn format_handshake_ago(latest_handshake: i64, now: i64) -> String {
    if latest_handshake <= 0 {
        return "never".to_string();
    }
    let secs = (now - latest_handshake).max(0);
    match secs {
        s if s < 60 => format!("{}s ago", s),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86_400),
    }
}

/// `Endpoint = host:port` from a WireGuard config
pub fn config_endpoint(config: &str) -> Option<String> {
    config.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("endpoint") {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Extract the address from the gateway control server's response.
///
/// Accepts `{"public_ip":"1.2.3.4", ...}` or a bare address.
pub fn parse_public_ip(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        return value
            .get("public_ip")
            .and_then(|v| v.as_str())
            .filter(|ip| !ip.is_empty())
            .map(str::to_string);
    }
    body.parse::<std::net::IpAddr>().ok().map(|ip| ip.to_string())
}

/// Gateway reading
#[derive(Debug, Clone, Default)]
pub struct GatewayReading {
    pub state: Option<ContainerState>,
    pub counters: CounterSample,
    pub endpoint: Option<String>,
    pub latest_handshake: i64,
    pub public_ip: Option<String>,
}

/// VPN server reading
#[derive(Debug, Clone, Default)]
pub struct WgEasyReading {
    pub running: bool,
    pub clients: usize,
    pub connected: usize,
    pub counters: CounterSample,
}

async fn exec_text(runtime: &dyn ContainerRuntime, container: &str, argv: &[&str]) -> Option<String> {
    let command: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    match runtime.exec(container, &command).await {
        Ok(out) => Some(out),
        Err(e) => {
            debug!("{} in {} unavailable: {}", argv.join(" "), container, e);
            None
        }
    }
}

async fn interface_counters(runtime: &dyn ContainerRuntime, container: &str, iface: &str) -> Option<Counters> {
    let rx_path = format!("/sys/class/net/{}/statistics/rx_bytes", iface);
    let tx_path = format!("/sys/class/net/{}/statistics/tx_bytes", iface);
    let rx = exec_text(runtime, container, &["cat", &rx_path]).await?;
    let tx = exec_text(runtime, container, &["cat", &tx_path]).await?;
    Some(Counters::new(rx.trim().parse().ok()?, tx.trim().parse().ok()?))
}

/// Read the gateway's state, counters, tunnel endpoint and exit address.
///
/// `active_config` is the active profile's config file, used for the
/// endpoint when the container offers no `wg` tool.
pub async fn probe_gateway(
    runtime: &dyn ContainerRuntime,
    container: &str,
    settings: &VpnSettings,
    active_config: &Path,
) -> GatewayReading {
    let state = match runtime.inspect(container).await {
        Ok(state) => state,
        Err(e) => {
            debug!("Inspect {} failed: {}", container, e);
            None
        }
    };

    let mut reading = GatewayReading {
        state: state.clone(),
        ..Default::default()
    };
    if !state.map(|s| s.is_running()).unwrap_or(false) {
        return reading;
    }

    let iface = settings.gateway_interface.as_str();
    reading.counters = match interface_counters(runtime, container, iface).await {
        Some(counters) => CounterSample::Live(counters),
        None => CounterSample::Unreadable,
    };

    if let Some(dump) = exec_text(runtime, container, &["wg", "show", iface, "dump"]).await {
        if let Some(peer) = parse_wg_dump(&dump).into_iter().next() {
            reading.endpoint = peer.endpoint;
            reading.latest_handshake = peer.latest_handshake;
        }
    }
    if reading.endpoint.is_none() {
        reading.endpoint = std::fs::read_to_string(active_config)
            .ok()
            .and_then(|config| config_endpoint(&config));
    }

    if let Some(body) = exec_text(
        runtime,
        container,
        &["wget", "-qO-", "-T", "3", &settings.gateway_control_url],
    )
    .await
    {
        reading.public_ip = parse_public_ip(&body);
    }

    reading
}

/// Read the VPN server's client counts and aggregate counters
pub async fn probe_wgeasy(
    runtime: &dyn ContainerRuntime,
    container: &str,
    settings: &VpnSettings,
    now: i64,
) -> WgEasyReading {
    let running = matches!(runtime.inspect(container).await, Ok(Some(ref s)) if s.is_running());
    if !running {
        return WgEasyReading::default();
    }

    let dump = match exec_text(runtime, container, &["wg", "show", &settings.wgeasy_interface, "dump"]).await {
        Some(dump) => dump,
        None => {
            return WgEasyReading {
                running,
                counters: CounterSample::Unreadable,
                ..Default::default()
            }
        }
    };

    let peers = parse_wg_dump(&dump);
    let window = settings.connected_window_secs as i64;
    let connected = peers
        .iter()
        .filter(|p| p.latest_handshake > 0 && now - p.latest_handshake < window)
        .count();
    let counters = peers.iter().fold(Counters::default(), |acc, p| {
        Counters::new(acc.rx.saturating_add(p.rx), acc.tx.saturating_add(p.tx))
    });

    WgEasyReading {
        running,
        clients: peers.len(),
        connected,
        counters: CounterSample::Live(counters),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "cHJpdmF0ZQ=\tcHVibGlj=\t51820\toff\n\
peerA=\t(none)\t203.0.113.5:41234\t10.8.0.2/32\t1700000000\t1000\t2000\t0\n\
peerB=\t(none)\t(none)\t10.8.0.3/32\t0\t0\t0\t0\n\
peerC=\t(none)\t198.51.100.7:5555\t10.8.0.4/32\t1699999000\t50\t70\t25\n";

    #[test]
    fn test_parse_wg_dump() {
        let peers = parse_wg_dump(DUMP);
        assert_eq!(peers.len(), 3);
        assert_eq!(peers[0].endpoint.as_deref(), Some("203.0.113.5:41234"));
        assert_eq!(peers[0].latest_handshake, 1_700_000_000);
        assert_eq!(peers[0].rx, 1000);
        assert_eq!(peers[0].tx, 2000);
        assert_eq!(peers[1].endpoint, None);
        assert_eq!(peers[1].latest_handshake, 0);
    }

    #[test]
    fn test_parse_wg_dump_ignores_short_lines() {
        assert!(parse_wg_dump("iface\nbad\tline\n").is_empty());
        assert!(parse_wg_dump("").is_empty());
    }

    #[test]
    fn test_format_handshake_ago() {
        assert_eq!(format_handshake_ago(0, 100), "never");
        assert_eq!(format_handshake_ago(95, 100), "5s ago");
        assert_eq!(format_handshake_ago(100, 100 + 125), "2m ago");
        assert_eq!(format_handshake_ago(1, 1 + 7200), "2h ago");
        assert_eq!(format_handshake_ago(1, 1 + 3 * 86_400), "3d ago");
        // Clock skew
        assert_eq!(format_handshake_ago(200, 100), "0s ago");
    }

    #[test]
    fn test_config_endpoint() {
        let config = "[Interface]\nPrivateKey = k\n[Peer]\nEndpoint = vpn.example.net:51820\n";
        assert_eq!(config_endpoint(config).as_deref(), Some("vpn.example.net:51820"));
        assert_eq!(config_endpoint("[Interface]\n"), None);
    }

    #[test]
    fn test_parse_public_ip() {
        assert_eq!(
            parse_public_ip(r#"{"public_ip":"185.65.134.1","country":"Sweden"}"#).as_deref(),
            Some("185.65.134.1")
        );
        assert_eq!(parse_public_ip("185.65.134.1\n").as_deref(), Some("185.65.134.1"));
        assert_eq!(parse_public_ip(r#"{"public_ip":""}"#), None);
        assert_eq!(parse_public_ip("<html>"), None);
    }
}
