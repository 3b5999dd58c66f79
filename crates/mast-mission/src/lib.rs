pub mod doctor;
pub mod driver;
pub mod monitors;
pub mod signals;

pub use driver::{AttemptRecord, Driver, DriverState, MissionConfig, MissionReport, Outcome};
pub use monitors::MonitorConfig;
pub use signals::{Flag, MissionSignals};

use anyhow::{Context, Result};
use mast_fc::FlightLink;
use mast_geo::Candidate;
use mast_proto::GeoPoint;
use mast_vision::{Classifier, FrameSource};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Runs the whole mission: spawns the condition monitors, drives the
/// candidates, then stops the monitors and waits for them before returning.
///
/// If `cancel` resolves first the vehicle is sent home and the mission fails
/// as interrupted. The monitors are joined on every path.
pub async fn run_mission<L, F, C>(
    link: &mut L,
    frames: F,
    classifier: C,
    mission: &MissionConfig,
    monitor_cfg: &MonitorConfig,
    entry: GeoPoint,
    candidates: &[Candidate],
    cancel: impl Future<Output = ()>,
) -> Result<MissionReport>
where
    L: FlightLink,
    F: FrameSource + 'static,
    C: Classifier + 'static,
{
    let signals = Arc::new(MissionSignals::default());
    let (stop_tx, stop_rx) = watch::channel(false);

    let tasks = vec![
        (
            "distance",
            tokio::spawn(monitors::monitor_distance(
                link.subscribe(),
                signals.clone(),
                monitor_cfg.distance_threshold_cm,
                stop_rx.clone(),
            )),
        ),
        (
            "altitude",
            tokio::spawn(monitors::monitor_altitude(
                link.subscribe(),
                signals.clone(),
                mission.mast_height_m,
                mission.altitude_tolerance_m,
                stop_rx.clone(),
            )),
        ),
        (
            "recognition",
            tokio::spawn(monitors::monitor_recognition(
                frames,
                classifier,
                signals.clone(),
                monitor_cfg.clone(),
                stop_rx.clone(),
            )),
        ),
        ("progress", tokio::spawn(monitors::log_progress(link.subscribe(), stop_rx))),
    ];
    info!("mission: {} candidates, monitors started", candidates.len());

    let outcome = {
        let mut driver = Driver::new(&mut *link, signals, mission.clone(), entry);
        tokio::select! {
            res = driver.run(candidates) => Some(res),
            _ = cancel => None,
        }
    };
    let result = match outcome {
        Some(res) => res,
        None => {
            warn!("mission: interrupted, returning to launch");
            match link.return_to_launch().await.context("return to launch") {
                Ok(()) => Err(anyhow::anyhow!("mission interrupted")),
                Err(e) => Err(e.context("mission interrupted")),
            }
        }
    };

    let _ = stop_tx.send(true);
    for (name, task) in tasks {
        if let Err(e) = task.await {
            warn!("mission: {} monitor ended abnormally: {}", name, e);
        }
    }
    result
}
