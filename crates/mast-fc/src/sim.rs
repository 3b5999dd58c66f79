use anyhow::Result;
use mast_geo::geo::{haversine_m, step_towards};
use mast_proto::{DistanceSample, GeoPoint, Health, MissionPlan, Position, Telemetry, Waypoint};
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{FlightLink, TELEMETRY_CAPACITY};

const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimConfig {
    /// Vertical speed for climb and landing. Default 3 m/s.
    pub climb_rate_m_s: Option<f32>,
    /// Horizontal speed for RTL. Default 5 m/s.
    pub rtl_speed_m_s: Option<f32>,
    /// Range finder reading when nothing is in front. Default 1200 cm.
    pub clear_range_cm: Option<u16>,
    /// Report an obstacle (150 cm) once airborne and within this many meters of the active waypoint.
    pub obstacle_within_m: Option<f64>,
}

#[derive(Debug)]
struct Vehicle {
    home: GeoPoint,
    position: GeoPoint,
    alt_m: f32,
    armed: bool,
    plan: Vec<Waypoint>,
    next: usize,
    running: bool,
    rtl: bool,
}

impl Vehicle {
    fn in_air(&self) -> bool {
        self.alt_m > 0.1
    }

    fn active_target(&self) -> Option<&Waypoint> {
        if self.running { self.plan.get(self.next) } else { None }
    }

    fn step(&mut self, cfg: &SimConfig, dt: f32) {
        let climb = cfg.climb_rate_m_s.unwrap_or(3.0) * dt;

        if self.rtl {
            if self.alt_m < 10.0 && haversine_m(self.position, self.home) > 1.0 {
                self.alt_m = (self.alt_m + climb).min(10.0);
                return;
            }
            let speed = cfg.rtl_speed_m_s.unwrap_or(5.0) as f64 * dt as f64;
            self.position = step_towards(self.position, self.home, speed);
            if self.position == self.home {
                self.alt_m = (self.alt_m - climb).max(0.0);
                if !self.in_air() {
                    self.alt_m = 0.0;
                    self.rtl = false;
                    self.armed = false;
                    info!("sim: landed at home");
                }
            }
            return;
        }

        let Some(wp) = self.active_target().copied() else { return };
        let dz = wp.relative_alt_m - self.alt_m;
        self.alt_m += dz.clamp(-climb, climb);
        // take off vertically before moving
        if self.alt_m >= 1.0 {
            let step = wp.speed_m_s as f64 * dt as f64;
            self.position = step_towards(self.position, wp.point(), step);
        }

        let close = haversine_m(self.position, wp.point()) <= wp.acceptance_radius_m.max(0.5) as f64;
        if close && (self.alt_m - wp.relative_alt_m).abs() < 0.5 {
            debug!("sim: reached item {}", self.next);
            self.next += 1;
            if self.next >= self.plan.len() {
                self.running = false;
            }
        }
    }

    fn distance_cm(&self, cfg: &SimConfig) -> u16 {
        let clear = cfg.clear_range_cm.unwrap_or(1200);
        match (cfg.obstacle_within_m, self.active_target()) {
            (Some(r), Some(wp)) if self.in_air() && haversine_m(self.position, wp.point()) <= r => 150,
            _ => clear,
        }
    }

    fn samples(&self, cfg: &SimConfig) -> Vec<Telemetry> {
        let mut out = vec![
            Telemetry::Connection { connected: true },
            Telemetry::Health(Health { global_position_ok: true, home_position_ok: true }),
            Telemetry::Position(Position { lat: self.position.lat, lon: self.position.lon, relative_alt_m: self.alt_m }),
            Telemetry::InAir(self.in_air()),
            Telemetry::Distance(DistanceSample { current_cm: self.distance_cm(cfg), min_cm: 20, max_cm: 1200 }),
        ];
        if !self.plan.is_empty() {
            out.push(Telemetry::MissionProgress { current: self.next as u16, total: self.plan.len() as u16 });
        }
        out
    }
}

/// Point-mass vehicle that flies single-altitude waypoint missions; good
/// enough to exercise the mission flow without an autopilot.
pub struct SimLink {
    vehicle: Arc<Mutex<Vehicle>>,
    telemetry: broadcast::Sender<Telemetry>,
    ticker: JoinHandle<()>,
}

impl SimLink {
    /// Must be called from within a tokio runtime.
    pub fn new(home: GeoPoint, cfg: SimConfig) -> Self {
        let vehicle = Arc::new(Mutex::new(Vehicle {
            home,
            position: home,
            alt_m: 0.0,
            armed: false,
            plan: Vec::new(),
            next: 0,
            running: false,
            rtl: false,
        }));
        let (telemetry, _) = broadcast::channel(TELEMETRY_CAPACITY);

        let v = vehicle.clone();
        let tx = telemetry.clone();
        let ticker = tokio::spawn(async move {
            let mut iv = tokio::time::interval(TICK);
            loop {
                iv.tick().await;
                let samples = {
                    let mut veh = lock(&v);
                    veh.step(&cfg, TICK.as_secs_f32());
                    veh.samples(&cfg)
                };
                for s in samples {
                    let _ = tx.send(s);
                }
            }
        });
        info!("sim: vehicle at home {:.6},{:.6}", home.lat, home.lon);
        Self { vehicle, telemetry, ticker }
    }

    fn vehicle(&self) -> MutexGuard<'_, Vehicle> {
        lock(&self.vehicle)
    }

    pub fn position(&self) -> (GeoPoint, f32) {
        let v = self.vehicle();
        (v.position, v.alt_m)
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

fn lock(v: &Mutex<Vehicle>) -> MutexGuard<'_, Vehicle> {
    v.lock().unwrap_or_else(|e| e.into_inner())
}

impl FlightLink for SimLink {
    fn subscribe(&self) -> broadcast::Receiver<Telemetry> {
        self.telemetry.subscribe()
    }

    async fn arm(&mut self) -> Result<()> {
        self.vehicle().armed = true;
        info!("sim: armed");
        Ok(())
    }

    async fn upload_mission(&mut self, plan: &MissionPlan) -> Result<()> {
        anyhow::ensure!(!plan.items.is_empty(), "refusing to upload an empty mission");
        let mut v = self.vehicle();
        v.plan = plan.items.clone();
        v.next = 0;
        v.running = false;
        Ok(())
    }

    async fn start_mission(&mut self) -> Result<()> {
        let mut v = self.vehicle();
        anyhow::ensure!(v.armed, "sim: cannot start mission, vehicle not armed");
        anyhow::ensure!(!v.plan.is_empty(), "sim: no mission uploaded");
        v.running = true;
        v.rtl = false;
        Ok(())
    }

    async fn pause_mission(&mut self) -> Result<()> {
        self.vehicle().running = false;
        Ok(())
    }

    async fn clear_mission(&mut self) -> Result<()> {
        let mut v = self.vehicle();
        v.plan.clear();
        v.next = 0;
        v.running = false;
        Ok(())
    }

    async fn is_mission_finished(&mut self) -> Result<bool> {
        let v = self.vehicle();
        let finished = !v.plan.is_empty() && v.next >= v.plan.len();
        Ok(finished)
    }

    async fn return_to_launch(&mut self) -> Result<()> {
        let mut v = self.vehicle();
        v.running = false;
        v.rtl = true;
        info!("sim: RTL");
        Ok(())
    }
}
