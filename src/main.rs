//! stationkeeper - keep a device on its network and broker
//!
//! Runs the connection manager against NetworkManager and an MQTT broker
//! until SIGINT or SIGTERM arrives.

use clap::{Parser, Subcommand};
use stationkeeper::broker::{RumqttClient, RumqttSettings};
use stationkeeper::config::{ConfigStore, FileConfigStore, KeeperConfig};
use stationkeeper::link::NmcliLink;
use stationkeeper::observability::logging::{init_default_logging, init_logging, LogFormat};
use stationkeeper::{
    BrokerSession, ConnectionManager, NetworkDescriptor, PinnedSession, PlainSession,
};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Level};
use url::Url;

/// How often a record without a network name is re-read
const RECORD_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Connection lifecycle manager for unattended devices
#[derive(Parser)]
#[command(name = "stationkeeper")]
#[command(about = "Keeps a device joined to its network and connected to its MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connection manager until a shutdown signal
    Run,
    /// Validate configuration
    Config {
        /// Show the resolved configuration with secrets masked
        #[arg(long)]
        show: bool,
        /// Write a default network record to FILE and exit
        #[arg(long, value_name = "FILE")]
        init: Option<PathBuf>,
    },
    /// List visible networks
    Scan,
}

fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format_from_env(), false),
        _ => init_logging(Level::TRACE, log_format_from_env(), true),
    }

    info!("Starting stationkeeper v{}", env!("CARGO_PKG_VERSION"));

    if let Commands::Config {
        init: Some(path), ..
    } = &cli.command
    {
        if let Err(e) = init_network_record(path) {
            error!("Failed to write network record: {}", e);
            process::exit(1);
        }
        return;
    }

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_manager(config),
        Commands::Config { show, .. } => handle_config_command(&config, show),
        Commands::Scan => scan_networks(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn log_format_from_env() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()))
}

fn load_configuration(config_path: Option<&Path>) -> Result<KeeperConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(KeeperConfig::load_from_file(path)?);
    }

    let default_paths = [
        "stationkeeper.toml",
        "config/stationkeeper.toml",
        "/etc/stationkeeper/stationkeeper.toml",
    ];
    for path_str in default_paths {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(KeeperConfig::load_from_file(path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create stationkeeper.toml".into())
}

fn run_manager(config: KeeperConfig) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let settings = RumqttSettings {
        handshake_timeout: Duration::from_millis(config.timing.handshake_timeout_ms),
        pinned_fingerprint: config.security.fingerprint.clone(),
        ..RumqttSettings::default()
    };
    let client = RumqttClient::new(settings)?;
    let session: Box<dyn BrokerSession> = match &config.security.fingerprint {
        Some(fingerprint) => {
            info!("Using encrypted broker transport with pinned fingerprint");
            Box::new(PinnedSession::new(client, fingerprint.clone()))
        }
        None => Box::new(PlainSession::new(client)),
    };

    let link = NmcliLink::new(config.link.interface.clone());
    let mut manager: ConnectionManager =
        ConnectionManager::new(Box::new(link), session, config.manager_config());

    manager.on_link_established(|| info!("Network link established"));
    manager.on_message(|topic, payload| {
        info!(topic, bytes = payload.len(), "Message received");
    });
    for topic in &config.subscriptions {
        manager.add_subscription(topic)?;
    }

    // Set while the stored record names no network; re-read until it does
    let mut pending_store: Option<FileConfigStore> = None;
    if config.networks.is_empty() {
        let path = config
            .device
            .network_file
            .clone()
            .ok_or("device.network_file is required when no [[networks]] are configured")?;
        let mut store = FileConfigStore::new(path);
        let descriptor = store.load_or_create();
        if descriptor.network_name.is_empty() {
            warn!(
                path = %store.path().display(),
                "Network record names no network, waiting for it to be filled in"
            );
            pending_store = Some(store);
        } else {
            manager.begin(descriptor)?;
        }
    } else {
        manager.begin_with_candidates(config.descriptors()?, config.device.start_index)?;
    }

    info!(status = %manager.status(), "Connection manager running");

    let interval = Duration::from_millis(config.timing.loop_interval_ms);
    let mut last_status = manager.status();
    let mut last_record_check = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        if let Some(store) = pending_store.as_mut() {
            if last_record_check.elapsed() >= RECORD_RETRY_INTERVAL {
                last_record_check = Instant::now();
                match manager.try_begin_from_store(store) {
                    Ok(true) => {
                        info!(path = %store.path().display(), "Network record ready, connecting");
                        pending_store = None;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Could not start from network record: {}", e),
                }
            }
        }

        let status = manager.poll();
        if status != last_status {
            let network = manager
                .current_descriptor()
                .map(|d| d.network_name.clone())
                .unwrap_or_default();
            info!(%status, network = %network, "Connection status changed");
            last_status = status;
        }
        std::thread::sleep(interval);
    }

    info!("Received shutdown signal, shutting down gracefully...");
    manager.end();
    Ok(())
}

fn handle_config_command(config: &KeeperConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Configuration validation successful");

    if show {
        println!("{}", toml::to_string_pretty(&masked(config))?);
    }
    Ok(())
}

/// Copy of the configuration with every secret replaced
fn masked(config: &KeeperConfig) -> KeeperConfig {
    const MASK: &str = "***";
    let mut config = config.clone();
    for entry in &mut config.networks {
        if entry.password.is_some() {
            entry.password = Some(MASK.to_string());
        }
        if entry.broker_password.is_some() {
            entry.broker_password = Some(MASK.to_string());
        }
        if let Some(raw) = entry.broker_url.as_mut() {
            if let Ok(mut url) = Url::parse(raw) {
                if url.password().is_some() && url.set_password(Some(MASK)).is_ok() {
                    *raw = url.to_string();
                }
            }
        }
    }
    config
}

fn init_network_record(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = FileConfigStore::new(path);
    if path.exists() {
        warn!("Overwriting existing network record at {}", path.display());
    }
    store.save(&NetworkDescriptor::default())?;
    println!("Wrote default network record to {}", path.display());
    Ok(())
}

fn scan_networks(config: &KeeperConfig) -> Result<(), Box<dyn std::error::Error>> {
    use stationkeeper::Link;

    let mut link = NmcliLink::new(config.link.interface.clone());
    let networks = link.scan();
    if networks.is_empty() {
        println!("No networks found on {}", link.interface());
    }
    for name in networks {
        let known = config.networks.iter().any(|n| n.ssid == name);
        println!("{}{}", name, if known { "  (configured)" } else { "" });
    }
    Ok(())
}
