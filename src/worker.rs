//! Supervised engine worker
//!
//! Runs the engine pump loop and the application driver on their own tokio
//! task. The worker owns the facade exclusively, so engine calls never
//! overlap. It is stopped through a watch channel and joined for its
//! final report.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::Modem;
use crate::app::{AppDriver, DriverStats};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::modem::ModemEngine;

/// What the worker hands back once it stops
pub type WorkerReport = DriverStats;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Longest sleep between two engine pumps
    pub cadence: Duration,
    /// Capacity of the event channel between facade and driver
    pub event_queue: usize,
}

impl From<&EngineConfig> for WorkerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            cadence: Duration::from_millis(config.cadence_ms),
            event_queue: config.event_queue.max(1),
        }
    }
}

pub struct EngineWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<WorkerReport>>,
}

impl EngineWorker {
    /// Spawn the pump loop. Must be called from within a tokio runtime.
    pub fn start<E>(
        modem: Modem<E>,
        driver: AppDriver,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self
    where
        E: ModemEngine + Send + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_engine_loop(
            modem,
            driver,
            clock,
            settings,
            shutdown_rx,
        ));
        Self { shutdown, handle }
    }

    /// Ask the loop to finish after its current pass
    pub fn stop(&self) {
        // Err only means the loop already ended
        let _ = self.shutdown.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to end and collect its report
    pub async fn join(self) -> anyhow::Result<WorkerReport> {
        self.handle.await.context("engine worker panicked")?
    }
}

async fn run_engine_loop<E: ModemEngine>(
    mut modem: Modem<E>,
    mut driver: AppDriver,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<WorkerReport> {
    let (tx, mut events) = mpsc::channel(settings.event_queue);
    modem.set_event_subscriber(Some(tx));
    info!("LoRaWAN engine worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = clock.now_ms();
        // Hand each event over as it leaves the engine so a burst never
        // outgrows the channel
        let hint = modem.run_engine_with(|modem| {
            while let Ok(event) = events.try_recv() {
                driver.handle_event(modem, event, now);
            }
        });
        loop {
            match events.try_recv() {
                Ok(event) => driver.handle_event(&mut modem, event, now),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    anyhow::bail!("event channel closed while the worker was running")
                }
            }
        }
        driver.tick(&mut modem, now);

        let sleep = hint.min(settings.cadence);
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    debug!("Worker handle dropped, stopping");
                    break;
                }
            }
            _ = tokio::time::sleep(sleep) => {}
        }
    }

    modem.set_event_subscriber(None);
    let mut lorawan = modem.lorawan();
    if let Err(e) = lorawan.clear_alarm() {
        debug!("Uplink alarm not cleared: {}", e);
    }
    match lorawan.status() {
        Ok(status) => debug!("Engine status at shutdown: {:?}", status),
        Err(e) => warn!("Failed to get modem status: {}", e),
    }

    let report = driver.stats();
    info!(
        "LoRaWAN engine worker finished: {:?} (engine session {}), {} uplink(s), {} downlink(s)",
        report.state,
        if lorawan.is_joined() { "active" } else { "inactive" },
        report.uplinks_sent,
        report.downlinks_received
    );
    Ok(report)
}
