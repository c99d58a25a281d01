//! hub-deploy - deploy-time steps of the privacy hub
//!
//! Each subcommand is one step of a deployment or a timer-driven check:
//! subnet allocation, slot administration, certificate renewal and the
//! stack launch.

use chrono::Utc;
use clap::{Parser, Subcommand};
use libhubctl::certs::TrustClass;
use libhubctl::slot::Slot;
use libhubctl::{
    CertOutcome, CertificateManager, DockerCli, ErrorKind, HubConfig, HubError, HubResult,
    LaunchMode, LaunchSequencer, SlotManager, SubnetAllocator, SystemCertTooling,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "hub-deploy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Privacy hub deployment steps", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to $HUBCTL_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Find a free private /16 and print SUBNET= / OCTET= lines
    Subnet,
    /// Show or change the deployment slot
    Slot {
        /// Switch to the other slot
        #[arg(long, conflicts_with = "set")]
        swap: bool,

        /// Set the slot explicitly (A or B)
        #[arg(long)]
        set: Option<String>,
    },
    /// Obtain or renew the TLS certificate
    Certs,
    /// Show the installed certificate and its trust class
    CertStatus {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the deferred rate-limit retry if it is due
    CertRetry,
    /// Start the stack
    Launch {
        /// parallel or staged
        #[arg(short, long, default_value = "staged")]
        mode: LaunchMode,

        /// Skip the control-plane reachability probe
        #[arg(long)]
        no_probe: bool,
    },
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose { "debug" } else { &cli.log_level };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hub_deploy={},libhubctl={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn describe(outcome: &CertOutcome) -> String {
    match outcome {
        CertOutcome::Skipped { days_left } => format!("certificate valid for {} more days", days_left),
        CertOutcome::Issued => "certificate issued".to_string(),
        CertOutcome::KeptExisting { failure } => {
            format!("renewal failed ({:?}), existing certificate kept", failure)
        }
        CertOutcome::SelfSigned { failure: None } => "self-signed certificate installed".to_string(),
        CertOutcome::SelfSigned { failure: Some(failure) } => {
            format!("issuance failed ({:?}), self-signed certificate installed", failure)
        }
    }
}

fn cert_manager(config: &HubConfig) -> HubResult<CertificateManager> {
    let tooling = SystemCertTooling::new(&config.certs)?;
    Ok(CertificateManager::new(config, Arc::new(tooling)))
}

async fn run(cli: &Cli) -> HubResult<()> {
    let config = HubConfig::load_or_default(cli.config.as_deref())?;
    config.ensure_directories()?;
    let runtime = Arc::new(DockerCli::new(config.stack.compose_file.clone()));

    match &cli.command {
        Commands::Subnet => {
            let probe_prefix = format!("{}-", config.stack.app_name);
            let allocator = SubnetAllocator::new(runtime, &config.network, &probe_prefix);
            let subnet = allocator.allocate().await?;
            println!("SUBNET={}", subnet.cidr());
            println!("OCTET={}", subnet.octet());
        }
        Commands::Slot { swap, set } => {
            let slots = SlotManager::new(config.paths.slot_file(), config.stack.app_name.clone());
            if *swap {
                slots.swap()?;
            } else if let Some(raw) = set {
                let slot = Slot::parse(raw)
                    .ok_or_else(|| HubError::InvalidParameter(format!("Invalid slot '{}'", raw)))?;
                slots.set(slot)?;
            }
            println!("SLOT={}", slots.current_slot()?);
            println!("PREFIX={}", slots.prefix()?);
        }
        Commands::Certs => {
            let outcome = cert_manager(&config)?.renew().await?;
            println!("{}", describe(&outcome));
        }
        Commands::CertStatus { json } => {
            let status = cert_manager(&config)?.inspect(Utc::now()).await;
            if *json {
                println!("{}", serde_json::to_string(&status)?);
            } else {
                println!("trust:   {:?}", status.trust);
                if let Some(record) = &status.record {
                    println!("subject: {}", record.info.subject);
                    println!("issuer:  {}", record.info.issuer);
                    println!("expires: {}", record.info.not_after.to_rfc3339());
                }
                if let Some(days) = status.days_left {
                    println!("days:    {}", days);
                }
                if let Some(at) = status.retry_at {
                    println!("retry:   {}", at.to_rfc3339());
                }
            }
            if status.trust != TrustClass::Trusted {
                warn!("Certificate is not publicly trusted ({:?})", status.trust);
            }
        }
        Commands::CertRetry => match cert_manager(&config)?.run_scheduled_retry(Utc::now()).await? {
            Some(outcome) => println!("{}", describe(&outcome)),
            None => info!("No certificate retry due"),
        },
        Commands::Launch { mode, no_probe } => {
            let sequencer = LaunchSequencer::new(&config, runtime);
            let report = if *no_probe {
                sequencer.launch(*mode).await?
            } else {
                sequencer.run(*mode).await?.0
            };
            if report.is_degraded() {
                warn!(
                    "Stack launched in a degraded state (foundation ready: {}, failed: {:?})",
                    report.foundation_ready, report.failed
                );
            }
            println!("Stack launched ({} mode)", report.mode);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        let code = if e.kind() == ErrorKind::Busy { 2 } else { 1 };
        process::exit(code);
    }
}
