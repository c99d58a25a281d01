//! Configuration management for hubctl
//!
//! Everything the control plane needs to know about the deployment lives in
//! one [`HubConfig`] value that is loaded once per invocation and passed to
//! each component's constructor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use crate::error::{HubError, HubResult};

/// Environment variable that points at the configuration file
pub const CONFIG_ENV: &str = "HUBCTL_CONFIG";

/// Shortest DNS-01 propagation wait the CA tolerates (seconds)
pub const MIN_PROPAGATION_DELAY_SECS: u64 = 120;

/// Main hubctl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub stack: StackSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub vpn: VpnSettings,
    #[serde(default)]
    pub certs: CertSettings,
    #[serde(default)]
    pub launch: LaunchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Deployment base directory
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// WireGuard uplink profiles
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: PathBuf,
    /// Pointer to the active profile's config (symlink)
    #[serde(default)]
    pub active_profile_link: Option<PathBuf>,
    /// Display name of the active profile
    #[serde(default)]
    pub active_name_file: Option<PathBuf>,
    /// Advisory lock shared by activate/delete/upload
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
    /// Current deployment slot (A/B)
    #[serde(default)]
    pub slot_file: Option<PathBuf>,
    /// Gateway counter-pair snapshot
    #[serde(default)]
    pub gateway_usage_file: Option<PathBuf>,
    /// VPN-server UI counter-pair snapshot
    #[serde(default)]
    pub wgeasy_usage_file: Option<PathBuf>,
    /// Directory holding the TLS key/cert pair
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
    /// Deferred rate-limit retry marker
    #[serde(default)]
    pub cert_retry_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSettings {
    /// Application name, first component of every container name
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Compose project file consumed by the container runtime
    #[serde(default)]
    pub compose_file: Option<PathBuf>,
    /// VPN gateway service
    #[serde(default = "default_gateway_service")]
    pub gateway_service: String,
    /// VPN server with the management UI
    #[serde(default = "default_wgeasy_service")]
    pub wgeasy_service: String,
    /// Services routed through the gateway's network namespace
    #[serde(default = "default_dependent_services")]
    pub dependent_services: Vec<String>,
    /// Services started first in staged launch mode
    #[serde(default = "default_foundation_services")]
    pub foundation_services: Vec<String>,
    /// Every managed service, reported in the status `services` map
    #[serde(default = "default_services")]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// First octet of every candidate /16
    #[serde(default = "default_first_octet")]
    pub first_octet: u8,
    /// Lowest second octet probed
    #[serde(default = "default_second_octet_min")]
    pub second_octet_min: u8,
    /// Highest second octet probed
    #[serde(default = "default_second_octet_max")]
    pub second_octet_max: u8,
    /// Host address on the LAN
    #[serde(default = "default_lan_ip")]
    pub lan_ip: String,
    /// Public WireGuard hostname, falls back to `lan_ip`
    #[serde(default)]
    pub wg_host: Option<String>,
    /// Last octet of the DNS resolver's static address
    #[serde(default = "default_dns_host_octet")]
    pub dns_host_octet: u8,
    /// Last octet of the proxy endpoint's static address
    #[serde(default = "default_proxy_host_octet")]
    pub proxy_host_octet: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnSettings {
    /// Ceiling for the post-activation gateway health wait (seconds)
    #[serde(default = "default_vpn_health_timeout")]
    pub health_timeout_secs: u64,
    /// Health poll interval (seconds)
    #[serde(default = "default_interval")]
    pub health_interval_secs: u64,
    /// Tunnel interface inside the gateway container
    #[serde(default = "default_gateway_interface")]
    pub gateway_interface: String,
    /// WireGuard interface inside the VPN-server container
    #[serde(default = "default_wgeasy_interface")]
    pub wgeasy_interface: String,
    /// A peer counts as connected when its last handshake is this recent (seconds)
    #[serde(default = "default_connected_window")]
    pub connected_window_secs: u64,
    /// Gateway control server, reached from inside the gateway container
    #[serde(default = "default_gateway_control_url")]
    pub gateway_control_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertSettings {
    /// Public domain; self-signed only when unset
    #[serde(default)]
    pub domain: Option<String>,
    /// DNS provider API token (deSEC)
    #[serde(default)]
    pub dns_token: Option<String>,
    /// ACME account e-mail
    #[serde(default)]
    pub acme_email: Option<String>,
    /// DNS-01 propagation wait (seconds). Lower bound, never shortened.
    #[serde(default = "default_propagation_delay")]
    pub propagation_delay_secs: u64,
    /// Skip re-issuance while more than this many days remain
    #[serde(default = "default_renewal_floor")]
    pub renewal_floor_days: i64,
    /// Issuer CN fragments recognized as public CAs
    #[serde(default = "default_trusted_issuers")]
    pub trusted_issuers: Vec<String>,
    /// DNS provider dynamic-update endpoint
    #[serde(default = "default_dns_update_url")]
    pub dns_update_url: String,
    /// Public address lookup endpoint
    #[serde(default = "default_public_ip_url")]
    pub public_ip_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSettings {
    /// Ceiling for the staged-mode foundation health wait (seconds)
    #[serde(default = "default_launch_health_timeout")]
    pub health_timeout_secs: u64,
    /// Health poll interval (seconds)
    #[serde(default = "default_interval")]
    pub health_interval_secs: u64,
    /// Control-plane endpoint probed after launch; derived from `lan_ip` when unset
    #[serde(default)]
    pub api_url: Option<String>,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/DATA/AppData/privacy-hub")
}

fn default_profiles_dir() -> PathBuf {
    PathBuf::from("/DATA/AppData/privacy-hub/wg-profiles")
}

fn default_app_name() -> String {
    "hub".to_string()
}

fn default_gateway_service() -> String {
    "gluetun".to_string()
}

fn default_wgeasy_service() -> String {
    "wg-easy".to_string()
}

fn default_dependent_services() -> Vec<String> {
    ["redlib", "wikiless", "invidious", "rimgo", "breezewiki", "scribe", "anonymousoverflow"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_foundation_services() -> Vec<String> {
    ["hub-api", "adguard", "unbound", "gluetun"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_services() -> Vec<String> {
    [
        "hub-api", "dashboard", "adguard", "unbound", "gluetun", "wg-easy", "redlib",
        "wikiless", "invidious", "rimgo", "breezewiki", "scribe", "anonymousoverflow",
        "memos", "portainer",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_first_octet() -> u8 {
    172
}

fn default_second_octet_min() -> u8 {
    20
}

fn default_second_octet_max() -> u8 {
    31
}

fn default_lan_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_dns_host_octet() -> u8 {
    53
}

fn default_proxy_host_octet() -> u8 {
    80
}

fn default_vpn_health_timeout() -> u64 {
    30
}

fn default_interval() -> u64 {
    1
}

fn default_gateway_interface() -> String {
    "wg0".to_string()
}

fn default_wgeasy_interface() -> String {
    "wg0".to_string()
}

fn default_connected_window() -> u64 {
    180
}

fn default_gateway_control_url() -> String {
    "http://127.0.0.1:8000/v1/publicip/ip".to_string()
}

fn default_propagation_delay() -> u64 {
    MIN_PROPAGATION_DELAY_SECS
}

fn default_renewal_floor() -> i64 {
    30
}

fn default_trusted_issuers() -> Vec<String> {
    [
        "Let's Encrypt", "R3", "R10", "R11", "E1", "E2", "E5", "E6", "ZeroSSL", "Sectigo",
        "DigiCert", "GTS", "ISRG",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_dns_update_url() -> String {
    "https://update.dedyn.io/".to_string()
}

fn default_public_ip_url() -> String {
    "https://api.ipify.org".to_string()
}

fn default_launch_health_timeout() -> u64 {
    60
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            profiles_dir: default_profiles_dir(),
            active_profile_link: None,
            active_name_file: None,
            lock_file: None,
            slot_file: None,
            gateway_usage_file: None,
            wgeasy_usage_file: None,
            cert_dir: None,
            cert_retry_file: None,
        }
    }
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            compose_file: None,
            gateway_service: default_gateway_service(),
            wgeasy_service: default_wgeasy_service(),
            dependent_services: default_dependent_services(),
            foundation_services: default_foundation_services(),
            services: default_services(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            first_octet: default_first_octet(),
            second_octet_min: default_second_octet_min(),
            second_octet_max: default_second_octet_max(),
            lan_ip: default_lan_ip(),
            wg_host: None,
            dns_host_octet: default_dns_host_octet(),
            proxy_host_octet: default_proxy_host_octet(),
        }
    }
}

impl Default for VpnSettings {
    fn default() -> Self {
        Self {
            health_timeout_secs: default_vpn_health_timeout(),
            health_interval_secs: default_interval(),
            gateway_interface: default_gateway_interface(),
            wgeasy_interface: default_wgeasy_interface(),
            connected_window_secs: default_connected_window(),
            gateway_control_url: default_gateway_control_url(),
        }
    }
}

impl Default for CertSettings {
    fn default() -> Self {
        Self {
            domain: None,
            dns_token: None,
            acme_email: None,
            propagation_delay_secs: default_propagation_delay(),
            renewal_floor_days: default_renewal_floor(),
            trusted_issuers: default_trusted_issuers(),
            dns_update_url: default_dns_update_url(),
            public_ip_url: default_public_ip_url(),
        }
    }
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            health_timeout_secs: default_launch_health_timeout(),
            health_interval_secs: default_interval(),
            api_url: None,
        }
    }
}

impl PathSettings {
    pub fn active_profile_link(&self) -> PathBuf {
        self.active_profile_link
            .clone()
            .unwrap_or_else(|| self.profiles_dir.join("active.conf"))
    }

    pub fn active_name_file(&self) -> PathBuf {
        self.active_name_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join(".active_profile_name"))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join(".vpn_control.lock"))
    }

    pub fn slot_file(&self) -> PathBuf {
        self.slot_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join(".active_slot"))
    }

    pub fn gateway_usage_file(&self) -> PathBuf {
        self.gateway_usage_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join(".data_usage"))
    }

    pub fn wgeasy_usage_file(&self) -> PathBuf {
        self.wgeasy_usage_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join(".wge_data_usage"))
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.cert_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("config/adguard"))
    }

    pub fn cert_retry_file(&self) -> PathBuf {
        self.cert_retry_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join(".cert_retry_at"))
    }
}

impl NetworkSettings {
    /// Host clients use to reach the VPN server
    pub fn wg_host(&self) -> &str {
        match self.wg_host.as_deref() {
            Some(host) if !host.is_empty() => host,
            _ => &self.lan_ip,
        }
    }
}

impl VpnSettings {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

impl LaunchSettings {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

impl HubConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> HubResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| HubError::Config(format!("Failed to read config {:?}: {}", path.as_ref(), e)))?;

        let config: HubConfig = toml::from_str(&content)
            .map_err(|e| HubError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, then `HUBCTL_CONFIG`, else defaults.
    ///
    /// A path given explicitly must exist; the environment variable and the
    /// default location are allowed to be absent.
    pub fn load_or_default(explicit: Option<&Path>) -> HubResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match std::env::var_os(CONFIG_ENV) {
            Some(path) if Path::new(&path).exists() => Self::load(Path::new(&path)),
            Some(path) => {
                debug!("{} points at missing file {:?}, using defaults", CONFIG_ENV, path);
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> HubResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| HubError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| HubError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> HubResult<()> {
        if self.network.second_octet_min > self.network.second_octet_max {
            return Err(HubError::Config(format!(
                "second_octet_min {} exceeds second_octet_max {}",
                self.network.second_octet_min, self.network.second_octet_max
            )));
        }
        if self.stack.app_name.is_empty() {
            return Err(HubError::Config("app_name cannot be empty".to_string()));
        }
        crate::validation::validate_service_name(&self.stack.app_name)?;
        if self.certs.propagation_delay_secs < MIN_PROPAGATION_DELAY_SECS {
            return Err(HubError::Config(format!(
                "propagation_delay_secs {} is below the minimum of {}",
                self.certs.propagation_delay_secs, MIN_PROPAGATION_DELAY_SECS
            )));
        }
        Ok(())
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> HubResult<()> {
        for dir in [&self.paths.base_dir, &self.paths.profiles_dir, &self.paths.cert_dir()] {
            std::fs::create_dir_all(dir)
                .map_err(|e| HubError::Config(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }

    /// Configuration rooted in a single directory, used by tests and dry runs.
    pub fn rooted_at(base: &Path) -> Self {
        let mut config = Self::default();
        config.paths.base_dir = base.to_path_buf();
        config.paths.profiles_dir = base.join("wg-profiles");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.stack.app_name, "hub");
        assert_eq!(config.vpn.health_timeout_secs, 30);
        assert_eq!(config.launch.health_timeout_secs, 60);
        assert_eq!(config.certs.renewal_floor_days, 30);
        assert_eq!(
            config.paths.active_profile_link(),
            PathBuf::from("/DATA/AppData/privacy-hub/wg-profiles/active.conf")
        );
        assert_eq!(config.network.wg_host(), "127.0.0.1");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            [paths]
            base_dir = "/srv/hub"

            [network]
            lan_ip = "192.168.1.10"
            wg_host = "vpn.example.org"

            [certs]
            domain = "hub.dedyn.io"
            "#,
        )
        .unwrap();

        assert_eq!(config.paths.slot_file(), PathBuf::from("/srv/hub/.active_slot"));
        assert_eq!(config.network.wg_host(), "vpn.example.org");
        assert_eq!(config.network.first_octet, 172);
        assert_eq!(config.certs.domain.as_deref(), Some("hub.dedyn.io"));
        assert_eq!(config.certs.propagation_delay_secs, 120);
        assert_eq!(config.stack.gateway_service, "gluetun");
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hubctl.toml");

        let mut config = HubConfig::rooted_at(dir.path());
        config.certs.domain = Some("example.dedyn.io".to_string());
        config.save(&path).unwrap();

        let loaded = HubConfig::load(&path).unwrap();
        assert_eq!(loaded.paths.base_dir, dir.path());
        assert_eq!(loaded.certs.domain.as_deref(), Some("example.dedyn.io"));
    }

    #[test]
    fn test_invalid_octet_range_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[network]\nsecond_octet_min = 30\nsecond_octet_max = 20\n").unwrap();

        assert!(matches!(HubConfig::load(&path), Err(HubError::Config(_))));
    }

    #[test]
    fn test_short_propagation_delay_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fast.toml");
        std::fs::write(&path, "[certs]\npropagation_delay_secs = 0\n").unwrap();
        assert!(matches!(HubConfig::load(&path), Err(HubError::Config(_))));

        std::fs::write(&path, "[certs]\npropagation_delay_secs = 300\n").unwrap();
        assert_eq!(HubConfig::load(&path).unwrap().certs.propagation_delay_secs, 300);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        std::fs::write(&path, "[stack]\napp_name = \"dhi\"\n").unwrap();

        std::env::set_var(CONFIG_ENV, &path);
        let config = HubConfig::load_or_default(None).unwrap();
        std::env::remove_var(CONFIG_ENV);

        assert_eq!(config.stack.app_name, "dhi");
    }

    #[test]
    #[serial]
    fn test_env_pointing_at_missing_file_uses_defaults() {
        std::env::set_var(CONFIG_ENV, "/nonexistent/hubctl.toml");
        let config = HubConfig::load_or_default(None).unwrap();
        std::env::remove_var(CONFIG_ENV);

        assert_eq!(config.stack.app_name, "hub");
    }
}
