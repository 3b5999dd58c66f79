use anyhow::{Context, Result};
use mast_fc::{FlightLink, LinkError};
use mast_geo::Candidate;
use mast_proto::{GeoPoint, MissionPlan, Telemetry, Waypoint};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::signals::MissionSignals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverState {
    Idle,
    Connecting,
    AwaitingPosition,
    Arming,
    AttemptingWaypoint(usize),
    ReturningHome(usize),
    Landed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    /// Waypoint altitude relative to takeoff.
    pub mast_height_m: f32,
    pub altitude_tolerance_m: f32,
    pub speed_m_s: f32,
    pub acceptance_radius_m: f32,
    pub max_attempts: usize,
    pub poll_interval_ms: u64,
    /// Give up on an attempt after this long without a trigger. Off by default.
    pub attempt_timeout_s: Option<u64>,
    pub landing_timeout_s: u64,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            mast_height_m: 30.0,
            altitude_tolerance_m: 2.0,
            speed_m_s: 5.0,
            acceptance_radius_m: 5.0,
            max_attempts: 3,
            poll_interval_ms: 1000,
            attempt_timeout_s: None,
            landing_timeout_s: 300,
        }
    }
}

impl MissionConfig {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn waypoint(&self, point: GeoPoint) -> Waypoint {
        Waypoint::at(point, self.mast_height_m, self.speed_m_s, self.acceptance_radius_m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    MastFound,
    Obstacle,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub index: usize,
    pub station_id: String,
    pub distance_m: f64,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionReport {
    pub entry: GeoPoint,
    pub attempts: Vec<AttemptRecord>,
    pub mast_found: bool,
    pub final_state: DriverState,
    pub started_unix_ms: i64,
    pub finished_unix_ms: i64,
}

impl MissionReport {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialize mission report")
    }
}

fn now_unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Waits on the stream until `pred` matches. A closed stream means the link is gone.
async fn wait_for(
    rx: &mut broadcast::Receiver<Telemetry>,
    what: &'static str,
    mut pred: impl FnMut(&Telemetry) -> bool,
) -> Result<()> {
    loop {
        match rx.recv().await {
            Ok(t) if pred(&t) => return Ok(()),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => debug!("driver: skipped {} samples waiting for {}", n, what),
            Err(broadcast::error::RecvError::Closed) => {
                return Err(anyhow::Error::new(LinkError::Closed).context(what));
            }
        }
    }
}

/// Vehicle seen in the air and then on the ground again.
async fn wait_landed(rx: &mut broadcast::Receiver<Telemetry>) -> Result<()> {
    let mut was_in_air = false;
    wait_for(rx, "landing", |t| match t {
        Telemetry::InAir(true) => {
            was_in_air = true;
            false
        }
        Telemetry::InAir(false) => was_in_air,
        _ => false,
    })
    .await
}

/// Flies the candidate masts one at a time until one is recognised or the
/// attempts run out, returning to the entry point after each attempt.
pub struct Driver<'a, L: FlightLink> {
    link: &'a mut L,
    signals: Arc<MissionSignals>,
    cfg: MissionConfig,
    entry: GeoPoint,
    state: DriverState,
}

impl<'a, L: FlightLink> Driver<'a, L> {
    pub fn new(link: &'a mut L, signals: Arc<MissionSignals>, cfg: MissionConfig, entry: GeoPoint) -> Self {
        Self { link, signals, cfg, entry, state: DriverState::Idle }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    fn transition(&mut self, next: DriverState) {
        info!("driver: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub async fn run(&mut self, candidates: &[Candidate]) -> Result<MissionReport> {
        let started_unix_ms = now_unix_ms();
        let mut rx = self.link.subscribe();

        self.transition(DriverState::Connecting);
        wait_for(&mut rx, "connection", |t| matches!(t, Telemetry::Connection { connected: true })).await?;

        self.transition(DriverState::AwaitingPosition);
        wait_for(&mut rx, "position estimate", |t| matches!(t, Telemetry::Health(h) if h.ready_to_fly())).await?;
        drop(rx);

        if candidates.is_empty() {
            warn!("driver: no candidate masts in range, staying on the ground");
            self.transition(DriverState::Landed);
            return Ok(self.report(started_unix_ms, Vec::new()));
        }

        self.transition(DriverState::Arming);
        self.link.arm().await.context("arm")?;

        let mut attempts = Vec::new();
        let mut i = 0;
        while !self.signals.mast_found.is_set() && i < self.cfg.max_attempts && i < candidates.len() {
            let cand = &candidates[i];
            self.transition(DriverState::AttemptingWaypoint(i));
            info!(
                "driver: checking mast {} at {:.6},{:.6} ({:.0} m)",
                cand.mast.station_id, cand.mast.position.lat, cand.mast.position.lon, cand.distance_m
            );
            // a reading taken on the way home must not abort the new attempt
            self.signals.obstacle_triggered.clear();
            let plan = MissionPlan::single(self.cfg.waypoint(cand.mast.position));
            self.link.upload_mission(&plan).await.with_context(|| format!("upload mission {}", i))?;
            self.link.start_mission().await.with_context(|| format!("start mission {}", i))?;

            let outcome = self.await_trigger().await;
            match outcome {
                Outcome::MastFound => info!("driver: mast {} found", cand.mast.station_id),
                Outcome::Obstacle | Outcome::TimedOut => {
                    warn!("driver: attempt {} aborted ({:?})", i, outcome);
                    self.link.pause_mission().await.context("pause mission")?;
                    self.link.clear_mission().await.context("clear mission")?;
                }
            }
            attempts.push(AttemptRecord {
                index: i,
                station_id: cand.mast.station_id.clone(),
                distance_m: cand.distance_m,
                outcome,
            });

            self.transition(DriverState::ReturningHome(i));
            self.signals.is_returning.set();
            self.signals.obstacle_triggered.clear();
            self.return_home().await?;
            self.signals.is_returning.clear();
            i += 1;
        }

        // subscribe before commanding so the takeoff->landing edge is not missed
        let mut rx = self.link.subscribe();
        self.link.return_to_launch().await.context("return to launch")?;
        let landing = Duration::from_secs(self.cfg.landing_timeout_s);
        match tokio::time::timeout(landing, wait_landed(&mut rx)).await {
            Ok(res) => res?,
            Err(_) => warn!("driver: no landing seen within {:?}", landing),
        }
        self.transition(DriverState::Landed);
        Ok(self.report(started_unix_ms, attempts))
    }

    fn report(&self, started_unix_ms: i64, attempts: Vec<AttemptRecord>) -> MissionReport {
        let mast_found = self.signals.mast_found.is_set();
        info!("driver: mission finished, line of sight confirmed: {}", mast_found);
        MissionReport {
            entry: self.entry,
            attempts,
            mast_found,
            final_state: self.state,
            started_unix_ms,
            finished_unix_ms: now_unix_ms(),
        }
    }

    /// Resolves on the first trigger. A found mast wins over an obstacle
    /// raised at the same moment.
    async fn await_trigger(&self) -> Outcome {
        let timeout = self.cfg.attempt_timeout_s.map(Duration::from_secs);
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.signals.mast_found.wait() => Outcome::MastFound,
            _ = self.signals.obstacle_triggered.wait() => Outcome::Obstacle,
            _ = deadline => Outcome::TimedOut,
        }
    }

    async fn return_home(&mut self) -> Result<()> {
        self.link.clear_mission().await.context("clear mission")?;
        let plan = MissionPlan::single(self.cfg.waypoint(self.entry));
        self.link.upload_mission(&plan).await.context("upload return mission")?;
        self.link.start_mission().await.context("start return mission")?;
        while !self.link.is_mission_finished().await.context("mission status")? {
            tokio::time::sleep(self.cfg.poll_interval()).await;
        }
        info!("driver: back at entry point");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mast_geo::MastRecord;
    use mast_proto::Health;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    const ENTRY: GeoPoint = GeoPoint { lat: 55.369671, lon: 10.573138 };

    #[derive(Debug, Clone, Copy)]
    enum Script {
        Found,
        Obstacle,
        Nothing,
    }

    #[derive(Debug, Default)]
    struct Log {
        calls: Vec<String>,
        obstacle_at_upload: Vec<bool>,
    }

    /// Scripted vehicle: each attempt start fires the next scripted trigger,
    /// return missions finish straight away.
    struct MockLink {
        signals: Arc<MissionSignals>,
        script: VecDeque<Script>,
        finished: bool,
        /// Raise an obstacle while flying home, like a wall passed on the way back.
        obstacle_on_return: bool,
        telemetry: broadcast::Sender<Telemetry>,
        log: Arc<Mutex<Log>>,
        heartbeat: JoinHandle<()>,
    }

    impl MockLink {
        fn new(signals: Arc<MissionSignals>, script: &[Script]) -> Self {
            let (telemetry, _) = broadcast::channel(64);
            let tx = telemetry.clone();
            let heartbeat = tokio::spawn(async move {
                loop {
                    let _ = tx.send(Telemetry::Connection { connected: true });
                    let _ = tx.send(Telemetry::Health(Health { global_position_ok: true, home_position_ok: true }));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            });
            Self {
                signals,
                script: script.iter().copied().collect(),
                finished: false,
                obstacle_on_return: false,
                telemetry,
                log: Arc::default(),
                heartbeat,
            }
        }

        fn record(&self, call: &str) {
            self.log.lock().unwrap().calls.push(call.to_string());
        }
    }

    impl Drop for MockLink {
        fn drop(&mut self) {
            self.heartbeat.abort();
        }
    }

    impl FlightLink for MockLink {
        fn subscribe(&self) -> broadcast::Receiver<Telemetry> {
            self.telemetry.subscribe()
        }

        async fn arm(&mut self) -> Result<()> {
            self.record("arm");
            Ok(())
        }

        async fn upload_mission(&mut self, plan: &MissionPlan) -> Result<()> {
            let home = plan.items[0].point() == ENTRY;
            self.record(if home { "upload_home" } else { "upload" });
            if !home {
                let obstacle = self.signals.obstacle_triggered.is_set();
                self.log.lock().unwrap().obstacle_at_upload.push(obstacle);
            }
            self.finished = false;
            Ok(())
        }

        async fn start_mission(&mut self) -> Result<()> {
            self.record("start");
            if self.signals.is_returning.is_set() {
                if self.obstacle_on_return {
                    self.signals.obstacle_triggered.set();
                }
                self.finished = true;
                return Ok(());
            }
            match self.script.pop_front() {
                Some(Script::Found) => {
                    self.signals.mast_found.set();
                }
                Some(Script::Obstacle) => {
                    self.signals.obstacle_triggered.set();
                }
                Some(Script::Nothing) | None => {}
            }
            Ok(())
        }

        async fn pause_mission(&mut self) -> Result<()> {
            self.record("pause");
            Ok(())
        }

        async fn clear_mission(&mut self) -> Result<()> {
            self.record("clear");
            Ok(())
        }

        async fn is_mission_finished(&mut self) -> Result<bool> {
            Ok(self.finished)
        }

        async fn return_to_launch(&mut self) -> Result<()> {
            self.record("rtl");
            let _ = self.telemetry.send(Telemetry::InAir(true));
            let _ = self.telemetry.send(Telemetry::InAir(false));
            Ok(())
        }
    }

    fn candidates(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate {
                mast: MastRecord {
                    station_id: format!("mast-{}", i),
                    position: GeoPoint::new(55.370 + i as f64 * 0.001, 10.572),
                    service: None,
                    technology: None,
                    street: None,
                    house_no: None,
                    postcode: None,
                    municipality: None,
                    commissioned: None,
                    radius_m: None,
                    frequency_band: None,
                },
                distance_m: 80.0 + i as f64 * 100.0,
            })
            .collect()
    }

    async fn fly(script: &[Script], n: usize, cfg: MissionConfig) -> (MissionReport, Arc<Mutex<Log>>, Arc<MissionSignals>) {
        let signals = Arc::new(MissionSignals::default());
        let mut link = MockLink::new(signals.clone(), script);
        let log = link.log.clone();
        let mut driver = Driver::new(&mut link, signals.clone(), cfg, ENTRY);
        let report = driver.run(&candidates(n)).await.unwrap();
        assert_eq!(driver.state(), DriverState::Landed);
        (report, log, signals)
    }

    #[tokio::test(start_paused = true)]
    async fn test_found_on_second_attempt() {
        let (report, log, signals) = fly(&[Script::Obstacle, Script::Found], 3, MissionConfig::default()).await;

        assert!(report.mast_found);
        let outcomes: Vec<_> = report.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(outcomes, [Outcome::Obstacle, Outcome::MastFound]);
        assert_eq!(report.attempts[1].station_id, "mast-1");
        assert_eq!(report.final_state, DriverState::Landed);
        assert!(!signals.is_returning.is_set());

        let calls = log.lock().unwrap().calls.clone();
        assert_eq!(
            calls,
            [
                "arm",
                "upload", "start", "pause", "clear",
                "clear", "upload_home", "start",
                "upload", "start",
                "clear", "upload_home", "start",
                "rtl",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_obstacle_flag_cleared_before_next_attempt() {
        let (report, log, signals) =
            fly(&[Script::Obstacle, Script::Obstacle, Script::Obstacle], 3, MissionConfig::default()).await;

        assert!(!report.mast_found);
        assert_eq!(report.attempts.len(), 3);
        assert!(report.attempts.iter().all(|a| a.outcome == Outcome::Obstacle));
        assert_eq!(log.lock().unwrap().obstacle_at_upload, [false, false, false]);
        assert!(!signals.obstacle_triggered.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fewer_candidates_than_attempts() {
        let (report, log, _) = fly(&[Script::Obstacle, Script::Obstacle], 2, MissionConfig::default()).await;
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(log.lock().unwrap().calls.last().map(String::as_str), Some("rtl"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidates_stays_on_ground() {
        let (report, log, _) = fly(&[], 0, MissionConfig::default()).await;
        assert!(report.attempts.is_empty());
        assert!(!report.mast_found);
        assert_eq!(report.final_state, DriverState::Landed);
        assert!(log.lock().unwrap().calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_obstacle_seen_on_return_not_carried_over() {
        let signals = Arc::new(MissionSignals::default());
        let mut link = MockLink::new(signals.clone(), &[Script::Nothing, Script::Found]);
        link.obstacle_on_return = true;
        let log = link.log.clone();
        let cfg = MissionConfig { attempt_timeout_s: Some(30), ..Default::default() };

        let report = Driver::new(&mut link, signals.clone(), cfg, ENTRY).run(&candidates(2)).await.unwrap();

        let outcomes: Vec<_> = report.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(outcomes, [Outcome::TimedOut, Outcome::MastFound]);
        assert_eq!(log.lock().unwrap().obstacle_at_upload, [false, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_wakes_without_waiting_for_poll() {
        let signals = Arc::new(MissionSignals::default());
        let mut link = MockLink::new(signals.clone(), &[Script::Nothing]);
        let cfg = MissionConfig { poll_interval_ms: 60_000, ..Default::default() };
        let driver = Driver::new(&mut link, signals.clone(), cfg, ENTRY);

        let s = signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            s.mast_found.set();
        });
        let start = Instant::now();
        assert_eq!(driver.await_trigger().await, Outcome::MastFound);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout() {
        let cfg = MissionConfig { attempt_timeout_s: Some(45), max_attempts: 2, ..Default::default() };
        let start = Instant::now();
        let (report, log, _) = fly(&[Script::Nothing, Script::Found], 3, cfg).await;

        let outcomes: Vec<_> = report.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(outcomes, [Outcome::TimedOut, Outcome::MastFound]);
        assert!(start.elapsed() >= Duration::from_secs(45));
        assert!(log.lock().unwrap().calls.iter().any(|c| c == "pause"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_json() {
        let (report, _, _) = fly(&[Script::Found], 3, MissionConfig::default()).await;
        let v: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(v["mast_found"], true);
        assert_eq!(v["attempts"][0]["outcome"], "mast_found");
        assert_eq!(v["final_state"], "Landed");
        assert!(v["finished_unix_ms"].as_i64().unwrap() >= v["started_unix_ms"].as_i64().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_link_is_fatal() {
        struct Dead;
        impl FlightLink for Dead {
            fn subscribe(&self) -> broadcast::Receiver<Telemetry> {
                let (_tx, rx) = broadcast::channel(1);
                rx
            }
            async fn arm(&mut self) -> Result<()> { Ok(()) }
            async fn upload_mission(&mut self, _plan: &MissionPlan) -> Result<()> { Ok(()) }
            async fn start_mission(&mut self) -> Result<()> { Ok(()) }
            async fn pause_mission(&mut self) -> Result<()> { Ok(()) }
            async fn clear_mission(&mut self) -> Result<()> { Ok(()) }
            async fn is_mission_finished(&mut self) -> Result<bool> { Ok(true) }
            async fn return_to_launch(&mut self) -> Result<()> { Ok(()) }
        }

        let mut link = Dead;
        let mut driver = Driver::new(&mut link, Arc::new(MissionSignals::default()), MissionConfig::default(), ENTRY);
        let err = driver.run(&candidates(1)).await.unwrap_err();
        assert!(err.downcast_ref::<LinkError>().is_some());
        assert!(format!("{:#}", err).contains("connection"));
        assert_eq!(driver.state(), DriverState::Connecting);
    }
}
