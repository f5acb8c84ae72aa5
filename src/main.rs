mod api;
mod app;
mod clock;
mod config;
mod modem;
mod worker;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::Modem;
use crate::app::AppDriver;
use crate::clock::{Clock, SystemClock};
use crate::config::UplinkTrigger;
use crate::modem::sim::SimulatedModem;
use crate::modem::Region;
use crate::worker::{EngineWorker, WorkerSettings};

#[derive(Parser)]
#[command(name = "lbm-node")]
#[command(about = "LoRaWAN end device driving a Basic Modem engine")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the configured LoRaWAN region (e.g. EU868, US915, AS923-2)
    #[arg(short, long)]
    region: Option<Region>,

    /// Override what schedules the periodic uplink
    #[arg(long, value_enum)]
    trigger: Option<UplinkTrigger>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        config::Config::default()
    });
    if let Some(region) = cli.region {
        config.network.region = region;
    }
    if let Some(trigger) = cli.trigger {
        config.uplink.trigger = trigger;
    }

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lbm-node v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Region {}, class {:?}, uplink every {} ms on port {} ({:?} trigger)",
        config.network.region,
        config.network.class,
        config.uplink.interval_ms,
        config.uplink.port,
        config.uplink.trigger
    );

    let identity = config
        .device
        .identity()
        .context("invalid device credentials in config")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let engine = SimulatedModem::new(clock.clone(), config.simulator.clone());
    let mut modem = Modem::new(engine);
    if !modem.p2p().is_available() {
        info!("P2P mode not available in this engine build");
    }

    // Setup: credentials, region, join request
    if let Err(e) = app::provision(&mut modem, &identity, &config.network) {
        warn!("Join was not requested ({}), node will stay unjoined", e);
    }

    let driver = AppDriver::new(config.uplink.clone());
    let worker = EngineWorker::start(
        modem,
        driver,
        clock,
        WorkerSettings::from(&config.engine),
    );

    info!("Node running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if worker.is_finished() {
        warn!("Engine worker had already stopped");
    }
    worker.stop();
    let report = worker.join().await?;
    info!(
        "Final state {:?}: {} uplink(s) sent, {} downlink(s) received",
        report.state, report.uplinks_sent, report.downlinks_received
    );

    Ok(())
}
