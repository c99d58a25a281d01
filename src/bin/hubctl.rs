//! hubctl - VPN profile administration
//!
//! Command surface used by the dashboard backend and by operators:
//! activate/delete/upload/list profiles and print the status document.

use clap::{Parser, Subcommand};
use libhubctl::vpn::VpnProfileController;
use libhubctl::{DockerCli, ErrorKind, HubConfig, HubError, HubResult};
use std::io::Read;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "hubctl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Privacy hub control - VPN profiles and stack status", long_about = None)]
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
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Switch the VPN gateway to a profile
    Activate {
        /// Profile name
        name: String,
    },
    /// Delete a profile
    Delete {
        /// Profile name
        name: String,
    },
    /// Print the status document as JSON
    Status {
        /// Indent the output
        #[arg(long)]
        pretty: bool,
    },
    /// List stored profiles
    Profiles {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Store a WireGuard config as a profile
    Upload {
        /// Config file, `-` for stdin
        file: PathBuf,

        /// Profile name (defaults to the name in the config comments)
        #[arg(short, long)]
        name: Option<String>,
    },
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose { "debug" } else { &cli.log_level };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hubctl={},libhubctl={}", log_level, log_level)));

    // stdout is reserved for command output
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn read_config_text(file: &PathBuf) -> HubResult<String> {
    if file.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    std::fs::read_to_string(file)
        .map_err(|e| HubError::InvalidParameter(format!("Cannot read {:?}: {}", file, e)))
}

async fn run(cli: &Cli) -> HubResult<()> {
    let config = HubConfig::load_or_default(cli.config.as_deref())?;
    let runtime = Arc::new(DockerCli::new(config.stack.compose_file.clone()));
    let controller = VpnProfileController::new(&config, runtime);

    match &cli.command {
        Commands::Activate { name } => {
            let activation = controller.activate(name).await?;
            if activation.is_degraded() {
                warn!("Profile '{}' activated in a degraded state", activation.profile);
            }
            println!("Activated VPN profile '{}'", activation.profile);
        }
        Commands::Delete { name } => {
            controller.delete(name).await?;
            println!("Deleted VPN profile '{}'", name);
        }
        Commands::Status { pretty } => {
            let status = controller.status().await?;
            let out = if *pretty {
                serde_json::to_string_pretty(&status)?
            } else {
                status.to_json()
            };
            println!("{}", out);
        }
        Commands::Profiles { json } => {
            let profiles = controller.list()?;
            if *json {
                println!("{}", serde_json::to_string(&profiles)?);
            } else if profiles.is_empty() {
                println!("No VPN profiles in {:?}", controller.profiles().dir());
            } else {
                for profile in profiles {
                    let marker = if profile.active { "*" } else { " " };
                    println!("{} {:<24} {}", marker, profile.name, profile.display_name);
                }
            }
        }
        Commands::Upload { file, name } => {
            let text = read_config_text(file)?;
            let stored = controller.upload(name.as_deref(), &text)?;
            println!("Uploaded VPN profile '{}'", stored);
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
