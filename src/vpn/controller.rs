//! VPN profile controller
//!
//! Activate, delete and upload mutate shared state and run under the
//! controller's advisory lock; a second caller gets `Busy` instead of
//! waiting. Status and listing never touch the lock.

use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{HubConfig, NetworkSettings, StackSettings, VpnSettings};
use crate::error::HubResult;
use crate::lock::LockGuard;
use crate::poll::{poll_until, PollOutcome};
use crate::runtime::ContainerRuntime;
use crate::slot::SlotManager;
use super::probe;
use super::profile::{ActiveVpnState, Profile, ProfileStore};
use super::status::{GatewayStatus, StackStatus, WgEasyStatus};
use super::telemetry::{BandwidthAccumulator, BandwidthReport, CounterSample};

/// Result of a completed activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub profile: String,
    /// Gateway reported healthy within the wait ceiling
    pub gateway_healthy: bool,
    /// Dependent services that failed to start
    pub failed_dependents: Vec<String>,
}

impl Activation {
    pub fn is_degraded(&self) -> bool {
        !self.gateway_healthy || !self.failed_dependents.is_empty()
    }
}

pub struct VpnProfileController {
    runtime: Arc<dyn ContainerRuntime>,
    slots: SlotManager,
    profiles: ProfileStore,
    active: ActiveVpnState,
    lock_path: PathBuf,
    gateway_usage: BandwidthAccumulator,
    wgeasy_usage: BandwidthAccumulator,
    stack: StackSettings,
    vpn: VpnSettings,
    network: NetworkSettings,
}

impl VpnProfileController {
    pub fn new(config: &HubConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let paths = &config.paths;
        Self {
            runtime,
            slots: SlotManager::new(paths.slot_file(), config.stack.app_name.clone()),
            profiles: ProfileStore::new(paths.profiles_dir.clone()),
            active: ActiveVpnState::new(paths.active_profile_link(), paths.active_name_file()),
            lock_path: paths.lock_file(),
            gateway_usage: BandwidthAccumulator::new(paths.gateway_usage_file(), ""),
            wgeasy_usage: BandwidthAccumulator::new(paths.wgeasy_usage_file(), "WGE_"),
            stack: config.stack.clone(),
            vpn: config.vpn.clone(),
            network: config.network.clone(),
        }
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn active_state(&self) -> &ActiveVpnState {
        &self.active
    }

    /// Display name of the active profile
    pub fn active_profile(&self) -> String {
        self.active.read_name()
    }

    pub fn list(&self) -> HubResult<Vec<Profile>> {
        self.profiles.list(&self.active)
    }

    /// Store a new profile and return its name
    pub fn upload(&self, name: Option<&str>, config: &str) -> HubResult<String> {
        let _lock = LockGuard::try_acquire(&self.lock_path)?;
        self.profiles.save(name, config)
    }

    /// Switch the gateway to `name`.
    ///
    /// Dependents are stopped before the gateway is recreated and started
    /// again once it is healthy or the wait ceiling passes. A slow gateway
    /// or a dependent that fails to start degrades the result but is not an
    /// error.
    pub async fn activate(&self, name: &str) -> HubResult<Activation> {
        self.profiles.existing(name)?;
        let _lock = LockGuard::try_acquire(&self.lock_path)?;
        // May have been deleted while we were acquiring
        let config_path = self.profiles.existing(name)?;

        self.active.point_to(&config_path, name)?;
        info!("Active VPN profile set to '{}'", name);

        let prefix = self.slots.prefix()?;
        for service in &self.stack.dependent_services {
            let container = format!("{}{}", prefix, service);
            if let Err(e) = self.runtime.stop(&container).await {
                debug!("Stop {} ignored: {}", container, e);
            }
        }

        let gateway = format!("{}{}", prefix, self.stack.gateway_service);
        let gateway_healthy = match self
            .runtime
            .force_recreate(std::slice::from_ref(&self.stack.gateway_service))
            .await
        {
            Ok(()) => self.wait_for_gateway(&gateway).await,
            Err(e) => {
                warn!("Failed to recreate {}: {}", gateway, e);
                false
            }
        };

        let mut failed_dependents = Vec::new();
        if !self.stack.dependent_services.is_empty() {
            if let Err(e) = self.runtime.start(&self.stack.dependent_services).await {
                warn!("Failed to restart dependent services: {}", e);
                failed_dependents = self.stack.dependent_services.clone();
            }
        }

        Ok(Activation {
            profile: name.to_string(),
            gateway_healthy,
            failed_dependents,
        })
    }

    async fn wait_for_gateway(&self, container: &str) -> bool {
        let runtime = &self.runtime;
        let outcome = poll_until(self.vpn.health_interval(), self.vpn.health_timeout(), || async move {
            matches!(runtime.inspect(container).await, Ok(Some(state)) if state.is_healthy())
        })
        .await;

        match outcome {
            PollOutcome::Ready { elapsed, .. } => {
                info!("{} healthy after {:?}", container, elapsed);
                true
            }
            PollOutcome::TimedOut { attempts } => {
                warn!(
                    "{} not healthy after {} checks, starting dependents anyway",
                    container, attempts
                );
                false
            }
        }
    }

    /// Remove a profile's config.
    ///
    /// The active pointer is left as-is even when it refers to the removed
    /// file; the gateway keeps its loaded config until the next activation.
    pub async fn delete(&self, name: &str) -> HubResult<()> {
        self.profiles.existing(name)?;
        let _lock = LockGuard::try_acquire(&self.lock_path)?;

        let path = self.profiles.existing(name)?;
        let was_active = match (self.active.target(), path.canonicalize()) {
            (Some(target), Ok(canonical)) => target == canonical,
            _ => false,
        };

        self.profiles.remove(name)?;
        info!("VPN profile '{}' deleted", name);
        if was_active {
            warn!(
                "Deleted profile '{}' was active; {:?} now dangles until another profile is activated",
                name,
                self.active.link()
            );
        }
        Ok(())
    }

    /// Merged telemetry and service health; never waits on the lock
    pub async fn status(&self) -> HubResult<StackStatus> {
        self.status_at(chrono::Utc::now().timestamp()).await
    }

    /// Status as of `now` (Unix seconds)
    pub async fn status_at(&self, now: i64) -> HubResult<StackStatus> {
        let prefix = self.slots.prefix()?;
        let runtime = self.runtime.as_ref();

        let gateway_container = format!("{}{}", prefix, self.stack.gateway_service);
        let wgeasy_container = format!("{}{}", prefix, self.stack.wgeasy_service);

        let gateway = probe::probe_gateway(runtime, &gateway_container, &self.vpn, self.active.link()).await;
        let wgeasy = probe::probe_wgeasy(runtime, &wgeasy_container, &self.vpn, now).await;

        let mut status = StackStatus {
            gluetun: GatewayStatus::from_reading(
                &gateway,
                &self.active.read_name(),
                observe(&self.gateway_usage, gateway.counters),
                now,
            ),
            wgeasy: WgEasyStatus::from_reading(
                &wgeasy,
                self.network.wg_host(),
                observe(&self.wgeasy_usage, wgeasy.counters),
            ),
            ..Default::default()
        };

        let inspections = join_all(self.stack.services.iter().map(|service| {
            let container = format!("{}{}", prefix, service);
            async move { (service, runtime.inspect(&container).await) }
        }))
        .await;
        for (service, result) in inspections {
            status.record_service(service, result.map_err(|e| e.to_string()));
        }

        Ok(status)
    }
}

fn observe(accumulator: &BandwidthAccumulator, sample: CounterSample) -> BandwidthReport {
    accumulator.record(sample).unwrap_or_else(|e| {
        warn!("Bandwidth snapshot {:?} not updated: {}", accumulator.path(), e);
        match sample {
            CounterSample::Live(c) => BandwidthReport {
                session_rx: c.rx,
                session_tx: c.tx,
                ..Default::default()
            },
            _ => BandwidthReport::default(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, HubError};
    use crate::runtime::ContainerState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const NL: &str = "[Interface]\nPrivateKey = a\n[Peer]\n# NL-FREE#1\nPublicKey = b\nEndpoint = 1.2.3.4:51820\n";

    /// Records calls; the gateway turns healthy after `healthy_after` inspects
    struct FakeRuntime {
        calls: Mutex<Vec<String>>,
        inspects: AtomicU32,
        healthy_after: u32,
        fail_start: bool,
        fail_counters: bool,
    }

    impl FakeRuntime {
        fn new(healthy_after: u32) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                inspects: AtomicU32::new(0),
                healthy_after,
                fail_start: false,
                fail_counters: false,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create_network(&self, _name: &str, _cidr: &str) -> HubResult<()> {
            Ok(())
        }

        async fn remove_network(&self, _name: &str) -> HubResult<()> {
            Ok(())
        }

        async fn inspect(&self, container: &str) -> HubResult<Option<ContainerState>> {
            if container.ends_with("gluetun") {
                let n = self.inspects.fetch_add(1, Ordering::SeqCst) + 1;
                let health = if n >= self.healthy_after { "healthy" } else { "starting" };
                return Ok(Some(ContainerState::running(Some(health))));
            }
            if container.ends_with("wg-easy") {
                return Ok(Some(ContainerState::running(None)));
            }
            Ok(None)
        }

        async fn stop(&self, container: &str) -> HubResult<()> {
            self.record(format!("stop {}", container));
            Err(HubError::NotFound(container.to_string()))
        }

        async fn force_recreate(&self, services: &[String]) -> HubResult<()> {
            self.record(format!("recreate {}", services.join(",")));
            Ok(())
        }

        async fn start(&self, services: &[String]) -> HubResult<()> {
            self.record(format!("start {}", services.join(",")));
            if self.fail_start {
                return Err(HubError::Timeout("compose up".into()));
            }
            Ok(())
        }

        async fn exec(&self, container: &str, command: &[String]) -> HubResult<String> {
            let cmd = command.join(" ");
            if self.fail_counters && cmd.ends_with("_bytes") {
                return Err(HubError::CommandFailed { cmd, code: Some(1), stderr: "busy".into() });
            }
            match (container.ends_with("gluetun"), cmd.as_str()) {
                (true, c) if c.ends_with("rx_bytes") => Ok("1000\n".into()),
                (true, c) if c.ends_with("tx_bytes") => Ok("400\n".into()),
                (true, c) if c.starts_with("wget") => Ok(r#"{"public_ip":"185.65.134.1"}"#.into()),
                (false, c) if c.starts_with("wg show") => Ok(
                    "priv\tpub\t51820\toff\n\
                     p1\t(none)\t10.0.0.5:1\t10.8.0.2/32\t990\t100\t200\t0\n\
                     p2\t(none)\t(none)\t10.8.0.3/32\t0\t0\t0\t0\n"
                        .into(),
                ),
                _ => Err(HubError::CommandFailed { cmd, code: Some(127), stderr: "not found".into() }),
            }
        }
    }

    fn setup(runtime: FakeRuntime) -> (TempDir, Arc<FakeRuntime>, VpnProfileController) {
        let dir = TempDir::new().unwrap();
        let mut config = HubConfig::rooted_at(dir.path());
        config.stack.dependent_services = vec!["redlib".into(), "rimgo".into()];
        config.stack.services = vec!["gluetun".into(), "redlib".into()];
        let runtime = Arc::new(runtime);
        let controller = VpnProfileController::new(&config, runtime.clone());
        (dir, runtime, controller)
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_sequence() {
        let (_dir, runtime, controller) = setup(FakeRuntime::new(3));
        controller.upload(Some("nl"), NL).unwrap();

        let activation = controller.activate("nl").await.unwrap();
        assert!(activation.gateway_healthy);
        assert!(!activation.is_degraded());
        assert_eq!(controller.active_profile(), "nl");
        assert_eq!(
            runtime.calls(),
            vec![
                "stop hub-a-redlib",
                "stop hub-a-rimgo",
                "recreate gluetun",
                "start redlib,rimgo",
            ]
        );
        assert_eq!(runtime.inspects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_health_timeout_still_starts_dependents() {
        let (_dir, runtime, controller) = setup(FakeRuntime::new(u32::MAX));
        controller.upload(Some("nl"), NL).unwrap();

        let start = tokio::time::Instant::now();
        let activation = controller.activate("nl").await.unwrap();

        assert!(!activation.gateway_healthy);
        assert_eq!(start.elapsed(), std::time::Duration::from_secs(30));
        assert_eq!(runtime.calls().last().map(String::as_str), Some("start redlib,rimgo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_dependent_failure_is_degraded() {
        let mut runtime = FakeRuntime::new(1);
        runtime.fail_start = true;
        let (_dir, _runtime, controller) = setup(runtime);
        controller.upload(Some("nl"), NL).unwrap();

        let activation = controller.activate("nl").await.unwrap();
        assert!(activation.is_degraded());
        assert_eq!(activation.failed_dependents, vec!["redlib", "rimgo"]);
    }

    #[tokio::test]
    async fn test_activate_missing_profile_leaves_state_untouched() {
        let (_dir, runtime, controller) = setup(FakeRuntime::new(1));
        controller.upload(Some("nl"), NL).unwrap();
        controller.activate("nl").await.unwrap();
        let calls_before = runtime.calls().len();

        let err = controller.activate("se").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(controller.active_profile(), "nl");
        assert_eq!(runtime.calls().len(), calls_before);

        assert!(matches!(
            controller.activate("../nl").await,
            Err(HubError::InvalidParameter(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_activate_one_busy() {
        let (_dir, _runtime, controller) = setup(FakeRuntime::new(5));
        controller.upload(Some("nl"), NL).unwrap();
        controller.upload(Some("se"), "[Peer]\n# Sweden\nPublicKey = s\n").unwrap();

        let (first, second) = tokio::join!(controller.activate("nl"), controller.activate("se"));

        let busy = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::Busy))
            .count();
        let ok = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!((ok, busy), (1, 1));
    }

    #[test]
    fn test_upload_busy_while_locked() {
        let (dir, _runtime, controller) = setup(FakeRuntime::new(1));
        let _held = LockGuard::try_acquire(&dir.path().join(".vpn_control.lock")).unwrap();

        let err = controller.upload(Some("nl"), NL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[tokio::test]
    async fn test_delete_active_profile_keeps_pointer() {
        let (_dir, _runtime, controller) = setup(FakeRuntime::new(1));
        controller.upload(Some("nl"), NL).unwrap();
        controller.activate("nl").await.unwrap();

        controller.delete("nl").await.unwrap();
        assert!(controller.list().unwrap().is_empty());
        assert_eq!(controller.active_profile(), "nl");
        assert!(std::fs::symlink_metadata(controller.active_state().link()).is_ok());

        assert_eq!(controller.delete("nl").await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_status_merges_telemetry() {
        let (_dir, _runtime, controller) = setup(FakeRuntime::new(1));
        controller.upload(Some("nl"), NL).unwrap();
        controller.activate("nl").await.unwrap();

        let status = controller.status_at(1000).await.unwrap();
        let gluetun = &status.gluetun;
        assert_eq!(gluetun.status, "up");
        assert!(gluetun.healthy);
        assert_eq!(gluetun.active_profile, "nl");
        assert_eq!(gluetun.public_ip, "185.65.134.1");
        // No wg tool in the gateway: endpoint read from the active config
        assert_eq!(gluetun.endpoint, "1.2.3.4:51820");
        assert_eq!(gluetun.handshake_ago, "never");
        assert_eq!((gluetun.session_rx, gluetun.total_rx), (1000, 1000));

        let wgeasy = &status.wgeasy;
        assert_eq!(wgeasy.status, "up");
        assert_eq!(wgeasy.host, "127.0.0.1");
        assert_eq!((wgeasy.clients, wgeasy.connected), (2, 1));
        assert_eq!((wgeasy.session_rx, wgeasy.session_tx), (100, 200));

        assert_eq!(status.services.len(), 2);
        assert_eq!(status.services["redlib"].as_str(), "down");
        assert_eq!(status.services["gluetun"].as_str(), "up");
    }

    #[tokio::test]
    async fn test_status_unreadable_counters_keep_session() {
        let (dir, _runtime, controller) = setup(FakeRuntime::new(1));
        controller.status_at(1000).await.unwrap();

        let mut runtime = FakeRuntime::new(1);
        runtime.fail_counters = true;
        let config = HubConfig::rooted_at(dir.path());
        let flaky = VpnProfileController::new(&config, Arc::new(runtime));
        let status = flaky.status_at(1010).await.unwrap();
        assert_eq!(status.gluetun.status, "up");
        assert_eq!((status.gluetun.session_rx, status.gluetun.total_rx), (1000, 1000));

        // Readable again with the same session: not mistaken for a restart
        let status = controller.status_at(1020).await.unwrap();
        assert_eq!((status.gluetun.session_rx, status.gluetun.total_rx), (1000, 1000));
        assert_eq!(status.gluetun.total_tx, 400);
    }

    #[tokio::test]
    async fn test_status_does_not_wait_for_lock() {
        let (dir, _runtime, controller) = setup(FakeRuntime::new(1));
        let _held = LockGuard::try_acquire(&dir.path().join(".vpn_control.lock")).unwrap();

        let status = controller.status_at(1000).await.unwrap();
        assert_eq!(status.gluetun.active_profile, "Unknown");
    }
}
