use mast_proto::{DistanceSample, Telemetry};
use mast_vision::{Classifier, FrameSource};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::signals::MissionSignals;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Range finder reading (cm) below which an obstacle is reported.
    pub distance_threshold_cm: u16,
    pub recognition_period_ms: u64,
    pub frame_timeout_ms: u64,
    pub target_label: String,
    pub min_confidence: f32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            distance_threshold_cm: 250,
            recognition_period_ms: 5000,
            frame_timeout_ms: 2000,
            target_label: "balloon".into(),
            min_confidence: 0.90,
        }
    }
}

impl MonitorConfig {
    pub fn recognition_period(&self) -> Duration {
        Duration::from_millis(self.recognition_period_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// Next telemetry sample, or None once the stream closes or shutdown is signalled.
async fn next_sample(
    rx: &mut broadcast::Receiver<Telemetry>,
    shutdown: &mut watch::Receiver<bool>,
    who: &'static str,
) -> Option<Telemetry> {
    loop {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() {
                    return None;
                }
            }
            res = rx.recv() => match res {
                Ok(t) => return Some(t),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!("{}: skipped {} samples", who, n),
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("{}: telemetry closed", who);
                    return None;
                }
            },
        }
    }
}

pub fn obstacle_detected(d: &DistanceSample, threshold_cm: u16, signals: &MissionSignals, mission_finished: bool) -> bool {
    d.current_cm < threshold_cm
        && signals.altitude_reached.is_set()
        && !signals.is_returning.is_set()
        && !mission_finished
}

pub fn altitude_reached(relative_alt_m: f32, mast_height_m: f32, tolerance_m: f32) -> bool {
    relative_alt_m >= mast_height_m - tolerance_m
}

/// Sets `obstacle_triggered` on close range-finder readings while out on an
/// attempt. Runs until shutdown.
pub async fn monitor_distance(
    mut rx: broadcast::Receiver<Telemetry>,
    signals: Arc<MissionSignals>,
    threshold_cm: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut mission_finished = false;
    while let Some(t) = next_sample(&mut rx, &mut shutdown, "distance").await {
        match t {
            Telemetry::MissionProgress { .. } => {
                mission_finished = t.mission_finished().unwrap_or(mission_finished);
            }
            Telemetry::Distance(d) => {
                if obstacle_detected(&d, threshold_cm, &signals, mission_finished) && signals.obstacle_triggered.set() {
                    warn!("distance: obstacle at {} cm (threshold {} cm)", d.current_cm, threshold_cm);
                }
            }
            _ => {}
        }
    }
    debug!("distance: monitor stopped");
}

/// Sets `altitude_reached` once the vehicle is within tolerance of mast height, then returns.
pub async fn monitor_altitude(
    mut rx: broadcast::Receiver<Telemetry>,
    signals: Arc<MissionSignals>,
    mast_height_m: f32,
    tolerance_m: f32,
    mut shutdown: watch::Receiver<bool>,
) {
    while let Some(t) = next_sample(&mut rx, &mut shutdown, "altitude").await {
        if let Telemetry::Position(p) = t {
            if altitude_reached(p.relative_alt_m, mast_height_m, tolerance_m) {
                signals.altitude_reached.set();
                info!("altitude: reached {:.1} m (mast {:.1} m)", p.relative_alt_m, mast_height_m);
                return;
            }
        }
    }
    debug!("altitude: monitor stopped");
}

async fn recognise_once<F: FrameSource, C: Classifier>(frames: &mut F, classifier: &mut C, cfg: &MonitorConfig) -> bool {
    if !frames.frame_available() {
        debug!("recognition: waiting for a frame");
    }
    let frame = match frames.next_frame(cfg.frame_timeout()).await {
        Ok(Some(f)) => f,
        Ok(None) => {
            debug!("recognition: no frame within {:?}", cfg.frame_timeout());
            return false;
        }
        Err(e) => {
            warn!("recognition: frame source failed: {:#}", e);
            return false;
        }
    };
    match classifier.classify(&frame).await {
        Ok(c) if c.is_target(&cfg.target_label, cfg.min_confidence) => {
            info!("recognition: {} ({:.2}) in frame {}", c.label, c.confidence, frame.seq);
            true
        }
        Ok(c) => {
            debug!("recognition: frame {} -> {} ({:.2})", frame.seq, c.label, c.confidence);
            false
        }
        Err(e) => {
            warn!("recognition: classifier failed: {:#}", e);
            false
        }
    }
}

/// Classifies one frame per period while at altitude and not returning.
/// Sets `mast_found` and returns on the first positive.
pub async fn monitor_recognition<F: FrameSource, C: Classifier>(
    mut frames: F,
    mut classifier: C,
    signals: Arc<MissionSignals>,
    cfg: MonitorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(cfg.recognition_period());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !signals.mast_found.is_set() && !*shutdown.borrow() {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() { break; }
                continue;
            }
            _ = tick.tick() => {}
        }
        if signals.is_returning.is_set() || !signals.altitude_reached.is_set() {
            continue;
        }
        let found = tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() { break; }
                continue;
            }
            found = recognise_once(&mut frames, &mut classifier, &cfg) => found,
        };
        if !found {
            continue;
        }
        // the vehicle may have turned home while the frame was being classified
        if signals.is_returning.is_set() || !signals.altitude_reached.is_set() {
            debug!("recognition: match dropped, no longer on station");
            continue;
        }
        signals.mast_found.set();
    }
    debug!("recognition: monitor stopped");
}

/// Logs mission progress whenever it changes.
pub async fn log_progress(mut rx: broadcast::Receiver<Telemetry>, mut shutdown: watch::Receiver<bool>) {
    let mut last = None;
    while let Some(t) = next_sample(&mut rx, &mut shutdown, "progress").await {
        if let Telemetry::MissionProgress { current, total } = t {
            if last != Some((current, total)) {
                info!("mission progress: {}/{}", current, total);
                last = Some((current, total));
            }
        }
    }
}
