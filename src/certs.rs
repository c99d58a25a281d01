//! TLS certificate lifecycle
//!
//! With a public domain and DNS credential configured the manager keeps a
//! publicly issued certificate (ACME DNS-01 through deSEC); otherwise, or
//! whenever issuance fails, it generates a self-signed pair so TLS services
//! can always start.
//!
//! ```text
//! NoCert ──(no domain)──────────────────────────────► SelfSigned
//! NoCert ──► Issuing ──► Trusted
//!                   └──► RateLimited ─► SelfSigned  (+ retry marker)
//!                   └──► Failed ──────► SelfSigned
//! ```
//!
//! A still-valid certificate for the domain is never replaced by a
//! self-signed one; the fallback only fills in when there is nothing usable.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{CertSettings, HubConfig, MIN_PROPAGATION_DELAY_SECS};
use crate::error::{HubError, HubResult};
use crate::fsutil;
use crate::validation;

const CERT_FILE: &str = "ssl.crt";
const KEY_FILE: &str = "ssl.key";
const ISSUE_LOG_FILE: &str = "last_run.log";

const SELF_SIGNED_DAYS: u32 = 3650;
const SELF_SIGNED_KEY: &str = "rsa:4096";

/// Subject, issuer and expiry of an installed certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateRecord {
    #[serde(flatten)]
    pub info: CertificateInfo,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustClass {
    Trusted,
    SelfSigned,
    RateLimited,
    Unknown,
}

/// Result of a certificate inspection, as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateStatus {
    pub trust: TrustClass,
    pub record: Option<CertificateRecord>,
    pub days_left: Option<i64>,
    pub retry_at: Option<DateTime<Utc>>,
    /// Failure recorded by the last unsuccessful issuance
    pub last_failure: Option<IssuanceFailure>,
}

/// Why an ACME run failed, scraped from the client's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IssuanceFailure {
    RateLimited { retry_at: Option<DateTime<Utc>> },
    Verification,
    Auth,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertOutcome {
    /// Existing certificate still valid past the renewal floor
    Skipped { days_left: i64 },
    Issued,
    /// Issuance failed; the previous certificate is still valid and kept
    KeptExisting { failure: IssuanceFailure },
    SelfSigned { failure: Option<IssuanceFailure> },
}

/// ACME DNS-01 issuance parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub domain: String,
    pub dns_token: String,
    pub email: Option<String>,
    /// Wait for DNS propagation; never shortened
    pub propagation_delay: Duration,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfSignedRequest {
    pub common_name: String,
    /// `subjectAltName` entries, e.g. `IP:192.168.1.10`
    pub alt_names: Vec<String>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Output of a finished external tool run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRun {
    pub success: bool,
    pub output: String,
}

/// External collaborators of the certificate manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertTooling: Send + Sync {
    /// Current public address of the host
    async fn public_ip(&self) -> HubResult<String>;

    /// Point the domain at `ip` through the DNS provider
    async fn update_dns(&self, domain: &str, token: &str, ip: &str) -> HubResult<()>;

    /// Parse the certificate at `path`; `Ok(None)` when there is none
    async fn read_certificate(&self, path: &Path) -> HubResult<Option<CertificateInfo>>;

    /// Run the ACME flow and install the pair on success
    async fn issue(&self, request: &IssueRequest) -> HubResult<ToolRun>;

    /// Generate a self-signed pair
    async fn self_signed(&self, request: &SelfSignedRequest) -> HubResult<()>;
}

/// Extract the `CN` value from an openssl distinguished name.
///
/// Handles both `CN = example.org, O = x` and `/O=x/CN=example.org`.
pub fn common_name(dn: &str) -> Option<String> {
    dn_values(dn)
        .into_iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("CN"))
        .map(|(_, value)| value)
}

fn dn_values(dn: &str) -> Vec<(String, String)> {
    let dn = dn.trim();
    let parts: Vec<&str> = if dn.starts_with('/') {
        dn.split('/').collect()
    } else {
        dn.split(',').collect()
    };
    parts
        .into_iter()
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Parse `openssl x509 -noout -subject -issuer -enddate` output
pub fn parse_x509_text(text: &str) -> HubResult<CertificateInfo> {
    let mut subject = None;
    let mut issuer = None;
    let mut not_after = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("subject=") {
            subject = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("issuer=") {
            issuer = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("notAfter=") {
            not_after = Some(parse_openssl_date(value)?);
        }
    }

    match (subject, issuer, not_after) {
        (Some(subject), Some(issuer), Some(not_after)) => Ok(CertificateInfo {
            subject,
            issuer,
            not_after,
        }),
        _ => Err(HubError::Parse("incomplete openssl x509 output".to_string())),
    }
}

/// `Jan  5 12:00:00 2026 GMT`
fn parse_openssl_date(value: &str) -> HubResult<DateTime<Utc>> {
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT")
        .map(|naive| naive.and_utc())
        .map_err(|e| HubError::Parse(format!("certificate date '{}': {}", value.trim(), e)))
}

/// Find a rate-limit hint and its "retry after" timestamp in ACME output.
///
/// The text format belongs to the CA and the ACME client and can change
/// without notice; an unparseable timestamp yields `retry_at: None`.
pub fn classify_failure(output: &str) -> IssuanceFailure {
    let lower = output.to_lowercase();
    if lower.contains("rate limit") || lower.contains("too many certificates") {
        return IssuanceFailure::RateLimited {
            retry_at: parse_retry_after(output),
        };
    }
    if output.contains("Verify error") || output.contains("Challenge failed") {
        return IssuanceFailure::Verification;
    }
    if lower.contains("invalid token") {
        return IssuanceFailure::Auth;
    }
    IssuanceFailure::Other
}

fn parse_retry_after(output: &str) -> Option<DateTime<Utc>> {
    let re = Regex::new(r"(?i)retry after (\d{4}-\d{2}-\d{2})[ T](\d{2}:\d{2}:\d{2})").ok()?;
    let caps = re.captures(output)?;
    let stamp = format!("{} {}", &caps[1], &caps[2]);
    NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Drives the certificate state machine
pub struct CertificateManager {
    tooling: Arc<dyn CertTooling>,
    settings: CertSettings,
    lan_ip: String,
    cert_dir: PathBuf,
    retry_file: PathBuf,
}

impl CertificateManager {
    pub fn new(config: &HubConfig, tooling: Arc<dyn CertTooling>) -> Self {
        Self {
            tooling,
            settings: config.certs.clone(),
            lan_ip: config.network.lan_ip.clone(),
            cert_dir: config.paths.cert_dir(),
            retry_file: config.paths.cert_retry_file(),
        }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(KEY_FILE)
    }

    fn log_path(&self) -> PathBuf {
        self.cert_dir.join(ISSUE_LOG_FILE)
    }

    /// Domain and token when public issuance is configured
    fn public_target(&self) -> Option<(&str, &str)> {
        let domain = self.settings.domain.as_deref().filter(|d| !d.is_empty())?;
        let token = self.settings.dns_token.as_deref().filter(|t| !t.is_empty())?;
        Some((domain, token))
    }

    fn is_trusted_issuer(&self, issuer: &str) -> bool {
        let values = dn_values(issuer);
        self.settings.trusted_issuers.iter().any(|trusted| {
            let trusted = trusted.to_lowercase();
            values.iter().any(|(key, value)| {
                let value = value.to_lowercase();
                (key.eq_ignore_ascii_case("CN") || key.eq_ignore_ascii_case("O"))
                    && (value == trusted || (trusted.len() > 3 && value.contains(&trusted)))
            })
        })
    }

    fn subject_matches(&self, subject: &str, domain: &str) -> bool {
        match common_name(subject) {
            Some(cn) => {
                let cn = cn.to_lowercase();
                let domain = domain.to_lowercase();
                cn == domain || cn == format!("*.{}", domain)
            }
            None => false,
        }
    }

    /// Whether the installed certificate makes issuance unnecessary
    pub fn should_skip(&self, info: &CertificateInfo, domain: &str, now: DateTime<Utc>) -> bool {
        let days_left = (info.not_after - now).num_days();
        self.subject_matches(&info.subject, domain)
            && self.is_trusted_issuer(&info.issuer)
            && days_left > self.settings.renewal_floor_days
    }

    async fn installed(&self) -> Option<CertificateInfo> {
        match self.tooling.read_certificate(&self.cert_path()).await {
            Ok(info) => info,
            Err(e) => {
                debug!("Installed certificate unreadable: {}", e);
                None
            }
        }
    }

    /// Inspect the installed certificate and classify its trust
    pub async fn inspect(&self, now: DateTime<Utc>) -> CertificateStatus {
        let info = self.installed().await;
        let retry_at = self.pending_retry();
        let last_failure = fsutil::read_optional(&self.log_path())
            .ok()
            .flatten()
            .map(|log| classify_failure(&log));

        let days_left = info.as_ref().map(|i| (i.not_after - now).num_days());
        let trust = match &info {
            None => TrustClass::Unknown,
            Some(i)
                if self.is_trusted_issuer(&i.issuer)
                    && days_left.unwrap_or(0) > self.settings.renewal_floor_days =>
            {
                TrustClass::Trusted
            }
            Some(_) if retry_at.is_some() => TrustClass::RateLimited,
            Some(i) if i.subject == i.issuer => TrustClass::SelfSigned,
            Some(_) => TrustClass::Unknown,
        };

        CertificateStatus {
            trust,
            record: info.map(|info| CertificateRecord {
                info,
                cert_path: self.cert_path(),
                key_path: self.key_path(),
            }),
            days_left,
            retry_at,
            last_failure,
        }
    }

    /// Time of the deferred retry, if one is scheduled
    pub fn pending_retry(&self) -> Option<DateTime<Utc>> {
        let content = match fsutil::read_optional(&self.retry_file) {
            Ok(Some(content)) => content,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cannot read retry marker {:?}: {}", self.retry_file, e);
                return None;
            }
        };
        match DateTime::parse_from_rfc3339(content.trim()) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(e) => {
                warn!("Ignoring malformed retry marker {:?}: {}", self.retry_file, e);
                None
            }
        }
    }

    fn schedule_retry(&self, at: DateTime<Utc>, now: DateTime<Utc>) {
        let wait = at - now;
        info!(
            "Rate limited until {} ({}h {}m from now), retry scheduled",
            at.to_rfc3339(),
            wait.num_hours(),
            wait.num_minutes() % 60
        );
        if let Err(e) = fsutil::atomic_write(&self.retry_file, format!("{}\n", at.to_rfc3339()).as_bytes(), None) {
            warn!("Failed to record retry marker: {}", e);
        }
    }

    fn clear_retry(&self) {
        match std::fs::remove_file(&self.retry_file) {
            Ok(()) => debug!("Removed retry marker {:?}", self.retry_file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove retry marker {:?}: {}", self.retry_file, e),
        }
    }

    fn clear_log(&self) {
        let path = self.log_path();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed issuance log {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove issuance log {:?}: {}", path, e),
        }
    }

    /// Run one renewal check
    pub async fn renew(&self) -> HubResult<CertOutcome> {
        self.renew_at(Utc::now(), true).await
    }

    /// Run the deferred retry if it is due.
    ///
    /// The marker is consumed before the attempt, so a retry never schedules
    /// another one.
    pub async fn run_scheduled_retry(&self, now: DateTime<Utc>) -> HubResult<Option<CertOutcome>> {
        match self.pending_retry() {
            Some(at) if at <= now => {
                info!("Running deferred certificate retry scheduled for {}", at.to_rfc3339());
                self.clear_retry();
                self.renew_at(now, false).await.map(Some)
            }
            Some(at) => {
                debug!("Certificate retry not due until {}", at.to_rfc3339());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn renew_at(&self, now: DateTime<Utc>, allow_retry: bool) -> HubResult<CertOutcome> {
        let (domain, token) = match self.public_target() {
            Some(target) => target,
            None => {
                info!("No public domain configured, using a self-signed certificate");
                self.generate_self_signed(None).await?;
                return Ok(CertOutcome::SelfSigned { failure: None });
            }
        };
        validation::validate_domain(domain)?;

        self.refresh_dns(domain, token).await;

        let installed = self.installed().await;
        if let Some(info) = &installed {
            if self.should_skip(info, domain, now) {
                let days_left = (info.not_after - now).num_days();
                info!("Certificate for {} valid for {} more days, skipping issuance", domain, days_left);
                return Ok(CertOutcome::Skipped { days_left });
            }
        }

        let request = IssueRequest {
            domain: domain.to_string(),
            dns_token: token.to_string(),
            email: self.settings.acme_email.clone(),
            propagation_delay: Duration::from_secs(
                self.settings.propagation_delay_secs.max(MIN_PROPAGATION_DELAY_SECS),
            ),
            cert_path: self.cert_path(),
            key_path: self.key_path(),
        };

        info!("Requesting certificate for {}", domain);
        let run = match self.tooling.issue(&request).await {
            Ok(run) => run,
            Err(e) => ToolRun {
                success: false,
                output: e.to_string(),
            },
        };
        if run.success {
            info!("Certificate for {} issued", domain);
            self.clear_retry();
            self.clear_log();
            return Ok(CertOutcome::Issued);
        }

        if let Err(e) = fsutil::atomic_write(&self.log_path(), run.output.as_bytes(), None) {
            debug!("Issuance log not written: {}", e);
        }

        let failure = classify_failure(&run.output);
        warn!("Certificate issuance for {} failed: {:?}", domain, failure);
        if let IssuanceFailure::RateLimited { retry_at: Some(at) } = &failure {
            if allow_retry {
                self.schedule_retry(*at, now);
            } else {
                warn!("Still rate limited after the deferred retry, not rescheduling");
            }
        }

        let still_valid = installed
            .as_ref()
            .map(|info| info.not_after > now && self.subject_matches(&info.subject, domain))
            .unwrap_or(false);
        if still_valid {
            warn!("Keeping the current certificate for {} until it can be renewed", domain);
            return Ok(CertOutcome::KeptExisting { failure });
        }

        self.generate_self_signed(Some(domain)).await?;
        Ok(CertOutcome::SelfSigned { failure: Some(failure) })
    }

    async fn refresh_dns(&self, domain: &str, token: &str) {
        let ip = match self.tooling.public_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("Public address lookup failed, DNS not updated: {}", e);
                return;
            }
        };
        match self.tooling.update_dns(domain, token, &ip).await {
            Ok(()) => info!("DNS for {} points at {}", domain, ip),
            Err(e) => warn!("DNS update for {} failed: {}", domain, e),
        }
    }

    async fn generate_self_signed(&self, domain: Option<&str>) -> HubResult<()> {
        std::fs::create_dir_all(&self.cert_dir)?;

        let mut alt_names = vec![format!("IP:{}", self.lan_ip)];
        let common_name = match domain {
            Some(domain) => {
                alt_names.insert(0, format!("DNS:{}", domain));
                alt_names.insert(1, format!("DNS:*.{}", domain));
                domain.to_string()
            }
            None => self.lan_ip.clone(),
        };

        let request = SelfSignedRequest {
            common_name,
            alt_names,
            cert_path: self.cert_path(),
            key_path: self.key_path(),
        };
        self.tooling.self_signed(&request).await?;
        warn!("Using a self-signed certificate for {}", request.common_name);
        Ok(())
    }
}

/// `openssl`, `acme.sh` and the deSEC HTTP API
pub struct SystemCertTooling {
    http: reqwest::Client,
    public_ip_url: String,
    dns_update_url: String,
    acme_binary: String,
}

impl SystemCertTooling {
    pub fn new(settings: &CertSettings) -> HubResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            public_ip_url: settings.public_ip_url.clone(),
            dns_update_url: settings.dns_update_url.clone(),
            acme_binary: "acme.sh".to_string(),
        })
    }

    async fn run(cmd: &mut Command, label: &str) -> HubResult<std::process::Output> {
        cmd.output().await.map_err(|e| HubError::CommandFailed {
            cmd: label.to_string(),
            code: None,
            stderr: e.to_string(),
        })
    }
}

#[async_trait]
impl CertTooling for SystemCertTooling {
    async fn public_ip(&self) -> HubResult<String> {
        let body = self.http.get(&self.public_ip_url).send().await?.error_for_status()?.text().await?;
        let ip = body.trim();
        ip.parse::<std::net::IpAddr>()
            .map(|ip| ip.to_string())
            .map_err(|_| HubError::Parse(format!("Unexpected public address response: {}", ip)))
    }

    async fn update_dns(&self, domain: &str, token: &str, ip: &str) -> HubResult<()> {
        self.http
            .get(&self.dns_update_url)
            .query(&[("hostname", domain), ("myipv4", ip)])
            .header("Authorization", format!("Token {}", token))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn read_certificate(&self, path: &Path) -> HubResult<Option<CertificateInfo>> {
        if !path.exists() {
            return Ok(None);
        }
        let output = Self::run(
            Command::new("openssl")
                .args(["x509", "-noout", "-subject", "-issuer", "-enddate", "-in"])
                .arg(path),
            "openssl x509",
        )
        .await?;
        if !output.status.success() {
            return Err(HubError::command_failed("openssl x509", &output));
        }
        parse_x509_text(&String::from_utf8_lossy(&output.stdout)).map(Some)
    }

    async fn issue(&self, request: &IssueRequest) -> HubResult<ToolRun> {
        let wildcard = format!("*.{}", request.domain);
        let mut issue = Command::new(&self.acme_binary);
        issue
            .args(["--issue", "--dns", "dns_desec", "--server", "letsencrypt"])
            .args(["-d", request.domain.as_str(), "-d", wildcard.as_str()])
            .arg("--dnssleep")
            .arg(request.propagation_delay.as_secs().to_string())
            .env("DEDYN_TOKEN", &request.dns_token)
            .env("DEDYN_NAME", &request.domain);
        if let Some(email) = &request.email {
            issue.args(["--accountemail", email.as_str()]);
        }

        let output = Self::run(&mut issue, "acme.sh --issue").await?;
        let mut log = String::from_utf8_lossy(&output.stdout).to_string();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Ok(ToolRun { success: false, output: log });
        }

        let install = Self::run(
            Command::new(&self.acme_binary)
                .args(["--install-cert", "-d", request.domain.as_str()])
                .arg("--key-file")
                .arg(&request.key_path)
                .arg("--fullchain-file")
                .arg(&request.cert_path),
            "acme.sh --install-cert",
        )
        .await?;
        log.push_str(&String::from_utf8_lossy(&install.stdout));
        log.push_str(&String::from_utf8_lossy(&install.stderr));

        Ok(ToolRun {
            success: install.status.success(),
            output: log,
        })
    }

    async fn self_signed(&self, request: &SelfSignedRequest) -> HubResult<()> {
        let subject = format!("/CN={}", request.common_name);
        let san = format!("subjectAltName={}", request.alt_names.join(","));
        let output = Self::run(
            Command::new("openssl")
                .args(["req", "-x509", "-newkey", SELF_SIGNED_KEY, "-sha256", "-nodes"])
                .arg("-days")
                .arg(SELF_SIGNED_DAYS.to_string())
                .arg("-keyout")
                .arg(&request.key_path)
                .arg("-out")
                .arg(&request.cert_path)
                .args(["-subj", subject.as_str(), "-addext", san.as_str()]),
            "openssl req",
        )
        .await?;
        if !output.status.success() {
            return Err(HubError::Certificate(format!(
                "self-signed generation failed: {}",
                validation::sanitize_error_message(&String::from_utf8_lossy(&output.stderr))
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&request.key_path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockall::predicate::*;
    use tempfile::TempDir;

    const DOMAIN: &str = "hub.dedyn.io";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn lets_encrypt(days: i64) -> CertificateInfo {
        CertificateInfo {
            subject: format!("CN = {}", DOMAIN),
            issuer: "C = US, O = Let's Encrypt, CN = R11".to_string(),
            not_after: now() + chrono::Duration::days(days),
        }
    }

    fn config(dir: &TempDir, public: bool) -> HubConfig {
        let mut config = HubConfig::rooted_at(dir.path());
        config.network.lan_ip = "192.168.1.10".to_string();
        if public {
            config.certs.domain = Some(DOMAIN.to_string());
            config.certs.dns_token = Some("secret".to_string());
        }
        config
    }

    fn with_dns(tooling: &mut MockCertTooling) {
        tooling.expect_public_ip().returning(|| Ok("203.0.113.9".to_string()));
        tooling
            .expect_update_dns()
            .with(eq(DOMAIN), eq("secret"), eq("203.0.113.9"))
            .times(1)
            .returning(|_, _, _| Ok(()));
    }

    #[tokio::test]
    async fn test_skip_when_45_days_left() {
        let dir = TempDir::new().unwrap();
        let mut tooling = MockCertTooling::new();
        with_dns(&mut tooling);
        tooling.expect_read_certificate().returning(|_| Ok(Some(lets_encrypt(45))));
        tooling.expect_issue().never();
        tooling.expect_self_signed().never();

        let manager = CertificateManager::new(&config(&dir, true), Arc::new(tooling));
        let outcome = manager.renew_at(now(), true).await.unwrap();
        assert_eq!(outcome, CertOutcome::Skipped { days_left: 45 });
    }

    #[tokio::test]
    async fn test_issue_when_20_days_left() {
        let dir = TempDir::new().unwrap();
        let mut tooling = MockCertTooling::new();
        with_dns(&mut tooling);
        tooling.expect_read_certificate().returning(|_| Ok(Some(lets_encrypt(20))));
        tooling
            .expect_issue()
            .withf(|req: &IssueRequest| req.domain == DOMAIN && req.propagation_delay == Duration::from_secs(120))
            .times(1)
            .returning(|_| Ok(ToolRun { success: true, output: "Cert success.".into() }));
        tooling.expect_self_signed().never();

        let manager = CertificateManager::new(&config(&dir, true), Arc::new(tooling));
        assert_eq!(manager.renew_at(now(), true).await.unwrap(), CertOutcome::Issued);
    }

    #[tokio::test]
    async fn test_propagation_delay_never_shortened() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, true);
        config.certs.propagation_delay_secs = 0;

        let mut tooling = MockCertTooling::new();
        with_dns(&mut tooling);
        tooling.expect_read_certificate().returning(|_| Ok(None));
        tooling
            .expect_issue()
            .withf(|req: &IssueRequest| req.propagation_delay == Duration::from_secs(MIN_PROPAGATION_DELAY_SECS))
            .times(1)
            .returning(|_| Ok(ToolRun { success: true, output: String::new() }));

        let manager = CertificateManager::new(&config, Arc::new(tooling));
        assert_eq!(manager.renew_at(now(), true).await.unwrap(), CertOutcome::Issued);
    }

    #[tokio::test]
    async fn test_success_clears_previous_failure_log() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, true);
        config.ensure_directories().unwrap();

        let mut tooling = MockCertTooling::new();
        with_dns(&mut tooling);
        tooling.expect_read_certificate().returning(|_| Ok(Some(lets_encrypt(20))));
        tooling
            .expect_issue()
            .times(1)
            .returning(|_| Ok(ToolRun { success: true, output: String::new() }));

        let manager = CertificateManager::new(&config, Arc::new(tooling));
        std::fs::write(manager.log_path(), "Error: DNS problem: NXDOMAIN").unwrap();

        assert_eq!(manager.renew_at(now(), true).await.unwrap(), CertOutcome::Issued);
        assert!(!manager.log_path().exists());
        assert_eq!(manager.inspect(now()).await.last_failure, None);
    }

    #[tokio::test]
    async fn test_foreign_or_self_signed_cert_is_reissued() {
        let dir = TempDir::new().unwrap();
        let mut tooling = MockCertTooling::new();
        with_dns(&mut tooling);
        tooling.expect_read_certificate().returning(|_| {
            Ok(Some(CertificateInfo {
                subject: format!("CN = {}", DOMAIN),
                issuer: format!("CN = {}", DOMAIN),
                not_after: now() + chrono::Duration::days(3000),
            }))
        });
        tooling
            .expect_issue()
            .times(1)
            .returning(|_| Ok(ToolRun { success: true, output: String::new() }));

        let manager = CertificateManager::new(&config(&dir, true), Arc::new(tooling));
        assert_eq!(manager.renew_at(now(), true).await.unwrap(), CertOutcome::Issued);
    }

    #[tokio::test]
    async fn test_rate_limit_schedules_retry_and_self_signs() {
        let dir = TempDir::new().unwrap();
        let mut tooling = MockCertTooling::new();
        tooling.expect_public_ip().returning(|| Err(HubError::Http("offline".into())));
        tooling.expect_update_dns().never();
        tooling.expect_read_certificate().returning(|_| Ok(None));
        tooling.expect_issue().times(1).returning(|_| {
            Ok(ToolRun {
                success: false,
                output: "Error creating new order :: too many certificates already issued. \
                         Rate limit exceeded, retry after 2026-03-02 18:30:00 UTC"
                    .into(),
            })
        });
        tooling
            .expect_self_signed()
            .withf(|req: &SelfSignedRequest| {
                req.common_name == DOMAIN
                    && req.alt_names == vec!["DNS:hub.dedyn.io", "DNS:*.hub.dedyn.io", "IP:192.168.1.10"]
            })
            .times(1)
            .returning(|_| Ok(()));

        let manager = CertificateManager::new(&config(&dir, true), Arc::new(tooling));
        let outcome = manager.renew_at(now(), true).await.unwrap();

        let retry_at = Utc.with_ymd_and_hms(2026, 3, 2, 18, 30, 0).unwrap();
        assert_eq!(
            outcome,
            CertOutcome::SelfSigned {
                failure: Some(IssuanceFailure::RateLimited { retry_at: Some(retry_at) })
            }
        );
        assert_eq!(manager.pending_retry(), Some(retry_at));
    }

    #[tokio::test]
    async fn test_failure_keeps_still_valid_cert() {
        let dir = TempDir::new().unwrap();
        let mut tooling = MockCertTooling::new();
        with_dns(&mut tooling);
        tooling.expect_read_certificate().returning(|_| Ok(Some(lets_encrypt(10))));
        tooling
            .expect_issue()
            .returning(|_| Ok(ToolRun { success: false, output: "Verify error: NXDOMAIN".into() }));
        tooling.expect_self_signed().never();

        let manager = CertificateManager::new(&config(&dir, true), Arc::new(tooling));
        assert_eq!(
            manager.renew_at(now(), true).await.unwrap(),
            CertOutcome::KeptExisting { failure: IssuanceFailure::Verification }
        );
    }

    #[tokio::test]
    async fn test_no_domain_goes_straight_to_self_signed() {
        let dir = TempDir::new().unwrap();
        let mut tooling = MockCertTooling::new();
        tooling.expect_public_ip().never();
        tooling.expect_issue().never();
        tooling
            .expect_self_signed()
            .withf(|req: &SelfSignedRequest| req.common_name == "192.168.1.10" && req.alt_names == vec!["IP:192.168.1.10"])
            .times(1)
            .returning(|_| Ok(()));

        let manager = CertificateManager::new(&config(&dir, false), Arc::new(tooling));
        assert_eq!(
            manager.renew_at(now(), true).await.unwrap(),
            CertOutcome::SelfSigned { failure: None }
        );
    }

    #[tokio::test]
    async fn test_scheduled_retry_runs_once_when_due() {
        let dir = TempDir::new().unwrap();
        let mut tooling = MockCertTooling::new();
        with_dns(&mut tooling);
        tooling.expect_read_certificate().returning(|_| Ok(None));
        tooling.expect_issue().times(1).returning(|_| {
            Ok(ToolRun {
                success: false,
                output: "Rate limit: retry after 2026-03-05 00:00:00 UTC".into(),
            })
        });
        tooling.expect_self_signed().returning(|_| Ok(()));

        let manager = CertificateManager::new(&config(&dir, true), Arc::new(tooling));
        std::fs::write(dir.path().join(".cert_retry_at"), "2026-03-01T11:00:00+00:00\n").unwrap();

        // Not due yet: nothing happens
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(manager.run_scheduled_retry(earlier).await.unwrap(), None);

        let outcome = manager.run_scheduled_retry(now()).await.unwrap();
        assert!(matches!(outcome, Some(CertOutcome::SelfSigned { .. })));
        // Consumed and not rescheduled
        assert_eq!(manager.pending_retry(), None);
        assert_eq!(manager.run_scheduled_retry(now()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_inspect_trust_classes() {
        let dir = TempDir::new().unwrap();
        let mut tooling = MockCertTooling::new();
        let mut seq = mockall::Sequence::new();
        for info in [
            Some(lets_encrypt(60)),
            Some(CertificateInfo {
                subject: "CN = 192.168.1.10".into(),
                issuer: "CN = 192.168.1.10".into(),
                not_after: now() + chrono::Duration::days(3650),
            }),
            None,
        ] {
            tooling
                .expect_read_certificate()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(info.clone()));
        }

        let manager = CertificateManager::new(&config(&dir, true), Arc::new(tooling));
        let trusted = manager.inspect(now()).await;
        assert_eq!(trusted.trust, TrustClass::Trusted);
        assert_eq!(trusted.days_left, Some(60));
        assert_eq!(trusted.record.unwrap().cert_path, dir.path().join("config/adguard/ssl.crt"));

        std::fs::write(dir.path().join(".cert_retry_at"), "2026-03-02T00:00:00Z\n").unwrap();
        assert_eq!(manager.inspect(now()).await.trust, TrustClass::RateLimited);
        assert_eq!(manager.inspect(now()).await.trust, TrustClass::Unknown);
    }

    #[test]
    fn test_parse_x509_text() {
        let text = "subject=CN = hub.dedyn.io\nissuer=C = US, O = Let's Encrypt, CN = R11\nnotAfter=Jan  5 08:15:00 2027 GMT\n";
        let info = parse_x509_text(text).unwrap();
        assert_eq!(common_name(&info.subject).as_deref(), Some("hub.dedyn.io"));
        assert_eq!(common_name(&info.issuer).as_deref(), Some("R11"));
        assert_eq!(info.not_after, Utc.with_ymd_and_hms(2027, 1, 5, 8, 15, 0).unwrap());

        assert_eq!(common_name("/C=US/O=Let's Encrypt/CN=R3").as_deref(), Some("R3"));
        assert!(parse_x509_text("subject=CN = x\n").is_err());
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("Rate limit exceeded: retry after 2026-01-02T03:04:05Z"),
            IssuanceFailure::RateLimited {
                retry_at: Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap())
            }
        );
        assert_eq!(
            classify_failure("too many certificates (5) already issued"),
            IssuanceFailure::RateLimited { retry_at: None }
        );
        assert_eq!(classify_failure("Challenge failed for domain"), IssuanceFailure::Verification);
        assert_eq!(classify_failure("deSEC: Invalid token."), IssuanceFailure::Auth);
        assert_eq!(classify_failure("connection reset"), IssuanceFailure::Other);
    }

    #[test]
    fn test_trusted_issuer_matching() {
        let dir = TempDir::new().unwrap();
        let manager = CertificateManager::new(&config(&dir, true), Arc::new(MockCertTooling::new()));
        assert!(manager.is_trusted_issuer("C = US, O = Let's Encrypt, CN = E6"));
        assert!(manager.is_trusted_issuer("C = AT, O = ZeroSSL, CN = ZeroSSL RSA Domain Secure Site CA"));
        // Short names only match exactly
        assert!(!manager.is_trusted_issuer("CN = R3D Home CA"));
        assert!(!manager.is_trusted_issuer("CN = hub.dedyn.io"));
    }
}
