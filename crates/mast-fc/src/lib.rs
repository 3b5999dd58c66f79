pub mod mav;
pub mod safety;
pub mod sim;
pub mod state;

use anyhow::Result;
use mast_proto::{MissionPlan, Telemetry};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::broadcast;

/// Telemetry fan-out capacity; slow subscribers skip samples past this.
pub const TELEMETRY_CAPACITY: usize = 256;

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// "mavlink" | "sim"
    pub kind: String,

    /// Any `mavlink::connect` address. Default "udpin:0.0.0.0:14540" (PX4 SITL).
    pub address: Option<String>,

    /// MAVLink ids we use (companion side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (autopilot side). 1/1 is common for PX4.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Hard safety: refuse RTL if false
    pub allow_rtl: bool,

    /// Require seeing autopilot heartbeat before sending commands
    pub require_heartbeat: bool,

    /// How long to wait for COMMAND_ACK / mission handshake replies. Default 3000.
    pub command_timeout_ms: Option<u64>,

    /// Companion heartbeat rate. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,

    /// Float parameters written once before the first mission upload. Unset
    /// raises the PX4 mission distance limits so far-off masts are accepted;
    /// an empty table writes nothing.
    pub params: Option<BTreeMap<String, f32>>,

    pub sim: Option<sim::SimConfig>,
}

impl LinkConfig {
    pub fn mission_params(&self) -> BTreeMap<String, f32> {
        match &self.params {
            Some(p) => p.clone(),
            None => [("MIS_DIST_1WP", 5000.0), ("MIS_DIST_WPS", 5000.0)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("{command} rejected by autopilot: {result}")]
    CommandRejected { command: &'static str, result: String },
    #[error("mission upload rejected: {0}")]
    MissionRejected(String),
    #[error("{0} disabled by config")]
    Disabled(&'static str),
    #[error("refusing {0}: no heartbeat seen yet")]
    NoHeartbeat(&'static str),
    #[error("flight link closed")]
    Closed,
}

/// What the mission driver needs from the vehicle.
///
/// Command methods resolve once the autopilot has accepted the command; any
/// error is a transport failure and is expected to abort the mission.
pub trait FlightLink {
    /// A fresh receiver on the telemetry stream. Samples sent before the call are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<Telemetry>;

    fn arm(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn upload_mission(&mut self, plan: &MissionPlan) -> impl Future<Output = Result<()>> + Send;

    fn start_mission(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn pause_mission(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn clear_mission(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn is_mission_finished(&mut self) -> impl Future<Output = Result<bool>> + Send;

    fn return_to_launch(&mut self) -> impl Future<Output = Result<()>> + Send;
}
