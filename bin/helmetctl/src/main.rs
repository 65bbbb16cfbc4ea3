//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Operator CLI for the smart helmet telemetry link."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use helmet_telemetry::{format_helmet_status, ClientConfig, Coordinate, DistanceCache, StatusValue};

mod monitor;

/// Paths probed when neither `--config` nor `HELMET_CONFIG` is given.
const CONFIG_CANDIDATES: [&str; 2] = ["helmet.toml", "/etc/helmet/helmet.toml"];

#[derive(Debug, Parser)]
#[command(author, version, about = "Smart helmet telemetry operator utility", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Connect and fold live telemetry into a fleet view")]
    Monitor(monitor::MonitorArgs),
    #[command(about = "Raise an SOS for one helmet, or \"sos\" for all")]
    Sos(monitor::SosArgs),
    #[command(name = "status-of", about = "Classify a status value")]
    StatusOf {
        /// Status as a device would send it; omit for an absent status.
        value: Option<String>,
    },
    #[command(about = "Great-circle distance between two \"lat,lon\" points in km")]
    Distance {
        #[arg(allow_hyphen_values = true)]
        from: Coordinate,
        #[arg(allow_hyphen_values = true)]
        to: Coordinate,
    },
    #[command(about = "Print the effective configuration")]
    Config,
}

fn load_config(explicit: Option<&PathBuf>) -> Result<(ClientConfig, Option<PathBuf>)> {
    match explicit {
        Some(path) => Ok((ClientConfig::from_path(path)?, Some(path.clone()))),
        None => {
            let loaded = ClientConfig::load(&CONFIG_CANDIDATES)?;
            Ok((loaded.config, loaded.source))
        }
    }
}

fn status_value(raw: Option<String>) -> StatusValue {
    match raw {
        Some(text) => match text.trim().parse::<f64>() {
            Ok(number) => StatusValue::Number(number),
            Err(_) => StatusValue::Text(text),
        },
        None => StatusValue::Missing,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = load_config(cli.config.as_ref())?;
    helmet_logging::init_tracing("helmetctl", &config.logging)
        .context("failed to initialise logging")?;
    if let Some(path) = &source {
        tracing::debug!(config_path = %path.display(), "configuration loaded");
    }

    match cli.command {
        Commands::Monitor(args) => monitor::run(config, args).await?,
        Commands::Sos(args) => monitor::send_sos(config, args).await?,
        Commands::StatusOf { value } => {
            let display = format_helmet_status(status_value(value));
            println!("{}", serde_json::to_string(&display)?);
        }
        Commands::Distance { from, to } => {
            let cache = DistanceCache::from_config(&config.distance_cache);
            match cache.distance_km(Some(from), Some(to)) {
                Some(km) => println!("{km:.2}"),
                None => println!("unknown"),
            }
        }
        Commands::Config => {
            match &source {
                Some(path) => println!("# loaded from {}", path.display()),
                None => println!("# compiled-in defaults"),
            }
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}
