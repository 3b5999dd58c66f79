use anyhow::{Context, Result};
use mavlink::{
    common::{
        GpsFixType, MavAutopilot, MavCmd, MavFrame, MavLandedState, MavMessage, MavMissionResult,
        MavModeFlag, MavParamType, MavResult, MavState, MavType, COMMAND_LONG_DATA, HEARTBEAT_DATA,
        MISSION_CLEAR_ALL_DATA, MISSION_COUNT_DATA, MISSION_ITEM_INT_DATA, PARAM_SET_DATA,
    },
    MavConnection, MavHeader,
};
use mast_proto::{DistanceSample, Health, MissionPlan, Position, Telemetry};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::safety::CommandRateLimit;
use crate::state::LinkStatus;
use crate::{FlightLink, LinkConfig, LinkError, TELEMETRY_CAPACITY};

pub const DEFAULT_ADDRESS: &str = "udpin:0.0.0.0:14540";

type Conn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

// Shared send half: the reader thread sends heartbeats, the link sends commands.
struct MavTx {
    conn: Conn,
    sys_id: u8,
    comp_id: u8,
    seq: AtomicU8,
}

impl MavTx {
    fn send(&self, msg: &MavMessage) -> Result<()> {
        let hdr = MavHeader {
            system_id: self.sys_id,
            component_id: self.comp_id,
            sequence: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.conn.send(&hdr, msg).map_err(|e| anyhow::anyhow!("mavlink send: {:?}", e))?;
        Ok(())
    }
}

/// MAVLink flight link. Telemetry is decoded on a dedicated reader thread
/// (connection `recv` blocks); commands are issued from async context.
pub struct MavLink {
    tx: Arc<MavTx>,
    target_sys: u8,
    target_comp: u8,
    status: Arc<Mutex<LinkStatus>>,
    telemetry: broadcast::Sender<Telemetry>,
    protocol: mpsc::Receiver<MavMessage>,
    limiter: CommandRateLimit,
    allow_rtl: bool,
    require_heartbeat: bool,
    command_timeout: Duration,
    /// Written on the first upload, then cleared.
    pending_params: BTreeMap<String, f32>,
    stop: Arc<AtomicBool>,
}

impl MavLink {
    pub fn open(cfg: &LinkConfig) -> Result<Self> {
        let address = cfg.address.clone().unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        let conn = mavlink::connect::<MavMessage>(&address)
            .with_context(|| format!("mavlink connect {}", address))?;
        let conn: Conn = Arc::from(conn);
        info!("FC: mavlink listening on {}", address);

        let tx = Arc::new(MavTx { conn, sys_id: cfg.sys_id, comp_id: cfg.comp_id, seq: AtomicU8::new(0) });
        let status = Arc::new(Mutex::new(LinkStatus { address: Some(address), ..Default::default() }));
        let (telemetry, _) = broadcast::channel(TELEMETRY_CAPACITY);
        let (protocol_tx, protocol) = mpsc::channel(32);
        let stop = Arc::new(AtomicBool::new(false));

        let hb_hz = cfg.send_heartbeat_hz.unwrap_or(1.0).max(0.2);
        let reader = Reader {
            tx: tx.clone(),
            target_sys: cfg.target_sys,
            status: status.clone(),
            telemetry: telemetry.clone(),
            protocol: protocol_tx,
            stop: stop.clone(),
            hb_interval: Duration::from_secs_f32(1.0 / hb_hz),
        };
        std::thread::Builder::new()
            .name("mav-reader".into())
            .spawn(move || reader.run())
            .context("spawn mavlink reader thread")?;

        Ok(Self {
            tx,
            target_sys: cfg.target_sys,
            target_comp: cfg.target_comp,
            status,
            telemetry,
            protocol,
            limiter: CommandRateLimit::new(Duration::from_secs(2)),
            allow_rtl: cfg.allow_rtl,
            require_heartbeat: cfg.require_heartbeat,
            command_timeout: Duration::from_millis(cfg.command_timeout_ms.unwrap_or(3000)),
            pending_params: cfg.mission_params(),
            stop,
        })
    }

    pub fn status(&self) -> LinkStatus {
        lock(&self.status).clone()
    }

    fn guard(&self, what: &'static str) -> Result<()> {
        if self.require_heartbeat && lock(&self.status).last_heartbeat.is_none() {
            return Err(LinkError::NoHeartbeat(what).into());
        }
        Ok(())
    }

    // Stale acks from an earlier exchange must not satisfy the next one.
    fn drain_protocol(&mut self) {
        while self.protocol.try_recv().is_ok() {}
    }

    async fn await_protocol<F>(&mut self, what: &'static str, pred: F) -> Result<MavMessage>
    where
        F: Fn(&MavMessage) -> bool + Send,
    {
        let deadline = tokio::time::Instant::now() + self.command_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.protocol.recv()).await {
                Err(_) => return Err(LinkError::Timeout(what).into()),
                Ok(None) => return Err(LinkError::Closed.into()),
                Ok(Some(msg)) if pred(&msg) => return Ok(msg),
                Ok(Some(_)) => continue,
            }
        }
    }

    async fn command(&mut self, name: &'static str, cmd: MavCmd, params: [f32; 7]) -> Result<()> {
        self.guard(name)?;
        self.drain_protocol();
        self.tx.send(&MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            command: cmd,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        }))?;

        let ack = self
            .await_protocol(name, |m| matches!(m, MavMessage::COMMAND_ACK(a) if a.command == cmd))
            .await?;
        if let MavMessage::COMMAND_ACK(a) = ack {
            if !matches!(a.result, MavResult::MAV_RESULT_ACCEPTED | MavResult::MAV_RESULT_IN_PROGRESS) {
                return Err(LinkError::CommandRejected { command: name, result: format!("{:?}", a.result) }.into());
            }
        }
        info!("FC: {} accepted", name);
        Ok(())
    }

    /// Writes a float parameter and waits for the autopilot to echo it back.
    pub async fn set_param_f32(&mut self, name: &str, value: f32) -> Result<()> {
        self.guard("parameter write")?;
        let msg = param_set(self.target_sys, self.target_comp, name, value)?;
        let id = msg.param_id;
        self.drain_protocol();
        self.tx.send(&MavMessage::PARAM_SET(msg))?;

        let echo = self
            .await_protocol("parameter echo", move |m| matches!(m, MavMessage::PARAM_VALUE(p) if p.param_id == id))
            .await?;
        if let MavMessage::PARAM_VALUE(p) = echo {
            if (p.param_value - value).abs() > 1e-3 {
                return Err(LinkError::CommandRejected {
                    command: "parameter write",
                    result: format!("{} reads back {}", name, p.param_value),
                }
                .into());
            }
        }
        info!("FC: {} = {}", name, value);
        Ok(())
    }

    async fn apply_pending_params(&mut self) -> Result<()> {
        let params = std::mem::take(&mut self.pending_params);
        for (name, value) in &params {
            self.set_param_f32(name, *value).await.with_context(|| format!("set {}", name))?;
        }
        Ok(())
    }

    fn send_item(&self, items: &[MISSION_ITEM_INT_DATA], seq: u16) -> Result<()> {
        let item = items
            .get(seq as usize)
            .with_context(|| format!("autopilot requested mission item {} of {}", seq, items.len()))?;
        debug!("FC: sending mission item {}", seq);
        self.tx.send(&MavMessage::MISSION_ITEM_INT(item.clone()))
    }
}

impl Drop for MavLink {
    fn drop(&mut self) {
        // reader exits after its next recv returns
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl FlightLink for MavLink {
    fn subscribe(&self) -> broadcast::Receiver<Telemetry> {
        self.telemetry.subscribe()
    }

    async fn arm(&mut self) -> Result<()> {
        if !self.limiter.allow("arm") {
            warn!("arm rate-limited");
            return Ok(());
        }
        self.command("arm", MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).await
    }

    async fn upload_mission(&mut self, plan: &MissionPlan) -> Result<()> {
        anyhow::ensure!(!plan.items.is_empty(), "refusing to upload an empty mission");
        self.guard("mission upload")?;
        self.apply_pending_params().await?;
        let items = mission_items(plan, self.target_sys, self.target_comp);
        let count = items.len() as u16;

        self.drain_protocol();
        self.tx.send(&MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count,
            target_system: self.target_sys,
            target_component: self.target_comp,
            ..Default::default()
        }))?;

        loop {
            let msg = self
                .await_protocol("mission item request", |m| {
                    matches!(m, MavMessage::MISSION_REQUEST_INT(_) | MavMessage::MISSION_REQUEST(_) | MavMessage::MISSION_ACK(_))
                })
                .await?;
            match msg {
                MavMessage::MISSION_REQUEST_INT(r) => self.send_item(&items, r.seq)?,
                MavMessage::MISSION_REQUEST(r) => self.send_item(&items, r.seq)?,
                MavMessage::MISSION_ACK(a) => {
                    if a.mavtype != MavMissionResult::MAV_MISSION_ACCEPTED {
                        return Err(LinkError::MissionRejected(format!("{:?}", a.mavtype)).into());
                    }
                    break;
                }
                _ => {}
            }
        }

        lock(&self.status).reset_mission(count);
        let _ = self.telemetry.send(Telemetry::MissionProgress { current: 0, total: count });
        if let Some(wp) = plan.last() {
            info!("FC: mission uploaded ({} items), heading for {:.6},{:.6}", count, wp.lat, wp.lon);
        }
        Ok(())
    }

    async fn start_mission(&mut self) -> Result<()> {
        self.command("mission start", MavCmd::MAV_CMD_MISSION_START, [0.0; 7]).await
    }

    async fn pause_mission(&mut self) -> Result<()> {
        self.command("mission pause", MavCmd::MAV_CMD_DO_PAUSE_CONTINUE, [0.0; 7]).await
    }

    async fn clear_mission(&mut self) -> Result<()> {
        self.guard("mission clear")?;
        self.drain_protocol();
        self.tx.send(&MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            ..Default::default()
        }))?;
        let ack = self.await_protocol("mission clear ack", |m| matches!(m, MavMessage::MISSION_ACK(_))).await?;
        if let MavMessage::MISSION_ACK(a) = ack {
            if a.mavtype != MavMissionResult::MAV_MISSION_ACCEPTED {
                return Err(LinkError::MissionRejected(format!("clear: {:?}", a.mavtype)).into());
            }
        }
        lock(&self.status).reset_mission(0);
        info!("FC: mission cleared");
        Ok(())
    }

    async fn is_mission_finished(&mut self) -> Result<bool> {
        let finished = lock(&self.status).mission_finished();
        Ok(finished)
    }

    async fn return_to_launch(&mut self) -> Result<()> {
        if !self.allow_rtl {
            return Err(LinkError::Disabled("RTL").into());
        }
        if !self.limiter.allow("rtl") {
            warn!("RTL rate-limited");
            return Ok(());
        }
        info!("FC: sending RTL");
        self.command("RTL", MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 7]).await
    }
}

fn lock(status: &Mutex<LinkStatus>) -> MutexGuard<'_, LinkStatus> {
    status.lock().unwrap_or_else(|e| e.into_inner())
}

/// Each waypoint becomes DO_CHANGE_SPEED followed by NAV_WAYPOINT; MAVLink
/// waypoints carry no speed of their own.
pub fn mission_items(plan: &MissionPlan, target_sys: u8, target_comp: u8) -> Vec<MISSION_ITEM_INT_DATA> {
    let mut out = Vec::with_capacity(plan.items.len() * 2);
    for wp in &plan.items {
        let seq = out.len() as u16;
        out.push(MISSION_ITEM_INT_DATA {
            param1: 1.0, // ground speed
            param2: wp.speed_m_s,
            param3: -1.0,
            param4: 0.0,
            x: 0,
            y: 0,
            z: 0.0,
            seq,
            command: MavCmd::MAV_CMD_DO_CHANGE_SPEED,
            target_system: target_sys,
            target_component: target_comp,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            current: u8::from(seq == 0),
            autocontinue: 1,
            ..Default::default()
        });
        out.push(MISSION_ITEM_INT_DATA {
            param1: 0.0, // hold
            param2: wp.acceptance_radius_m,
            param3: 0.0,
            param4: f32::NAN, // keep yaw
            x: (wp.lat * 1e7).round() as i32,
            y: (wp.lon * 1e7).round() as i32,
            z: wp.relative_alt_m,
            seq: seq + 1,
            command: MavCmd::MAV_CMD_NAV_WAYPOINT,
            target_system: target_sys,
            target_component: target_comp,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            current: 0,
            autocontinue: 1,
            ..Default::default()
        });
    }
    out
}

struct Reader {
    tx: Arc<MavTx>,
    target_sys: u8,
    status: Arc<Mutex<LinkStatus>>,
    telemetry: broadcast::Sender<Telemetry>,
    protocol: mpsc::Sender<MavMessage>,
    stop: Arc<AtomicBool>,
    hb_interval: Duration,
}

impl Reader {
    fn run(self) {
        let mut last_hb_send: Option<Instant> = None;
        while !self.stop.load(Ordering::Relaxed) {
            if last_hb_send.map_or(true, |t| t.elapsed() >= self.hb_interval) {
                if let Err(e) = self.tx.send(&companion_heartbeat()) {
                    debug!("FC: heartbeat send failed: {:#}", e);
                }
                last_hb_send = Some(Instant::now());
            }

            match self.tx.conn.recv() {
                Ok((hdr, msg)) => {
                    if hdr.system_id != self.target_sys { continue; }
                    dispatch(&msg, &self.status, &self.telemetry, &self.protocol);
                }
                Err(e) => {
                    debug!("FC: mavlink recv: {:?}", e);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        debug!("FC: reader stopped");
    }
}

/// PARAM_SET for a float parameter. The id must fit the 16-byte wire field.
fn param_set(target_sys: u8, target_comp: u8, name: &str, value: f32) -> Result<PARAM_SET_DATA> {
    let bytes = name.as_bytes();
    anyhow::ensure!(!bytes.is_empty() && bytes.len() <= 16, "parameter id {:?} must be 1 to 16 bytes", name);
    let mut param_id = [0u8; 16];
    param_id[..bytes.len()].copy_from_slice(bytes);
    Ok(PARAM_SET_DATA {
        param_value: value,
        target_system: target_sys,
        target_component: target_comp,
        param_id,
        param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
    })
}

fn companion_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

/// Decode one autopilot message into link status and telemetry; handshake
/// replies go to the command side.
fn dispatch(
    msg: &MavMessage,
    status: &Mutex<LinkStatus>,
    telemetry: &broadcast::Sender<Telemetry>,
    protocol: &mpsc::Sender<MavMessage>,
) {
    let sample = match msg {
        MavMessage::HEARTBEAT(hb) => {
            let mut st = lock(status);
            st.connected = true;
            st.last_heartbeat = Some(Instant::now());
            st.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
            Some(Telemetry::Connection { connected: true })
        }
        MavMessage::GLOBAL_POSITION_INT(p) => Some(Telemetry::Position(Position {
            lat: p.lat as f64 / 1e7,
            lon: p.lon as f64 / 1e7,
            relative_alt_m: p.relative_alt as f32 / 1000.0,
        })),
        MavMessage::DISTANCE_SENSOR(d) => Some(Telemetry::Distance(DistanceSample {
            current_cm: d.current_distance,
            min_cm: d.min_distance,
            max_cm: d.max_distance,
        })),
        MavMessage::EXTENDED_SYS_STATE(s) => {
            let in_air = !matches!(
                s.landed_state,
                MavLandedState::MAV_LANDED_STATE_ON_GROUND | MavLandedState::MAV_LANDED_STATE_UNDEFINED
            );
            lock(status).in_air = in_air;
            Some(Telemetry::InAir(in_air))
        }
        MavMessage::GPS_RAW_INT(g) => {
            let gps_ok = matches!(
                g.fix_type,
                GpsFixType::GPS_FIX_TYPE_3D_FIX
                    | GpsFixType::GPS_FIX_TYPE_DGPS
                    | GpsFixType::GPS_FIX_TYPE_RTK_FLOAT
                    | GpsFixType::GPS_FIX_TYPE_RTK_FIXED
            );
            let mut st = lock(status);
            st.gps_ok = gps_ok;
            Some(Telemetry::Health(Health { global_position_ok: gps_ok, home_position_ok: st.home_seen }))
        }
        MavMessage::HOME_POSITION(_) => {
            lock(status).home_seen = true;
            None
        }
        MavMessage::MISSION_ITEM_REACHED(r) => {
            let mut st = lock(status);
            st.reached_seq = Some(r.seq);
            Some(Telemetry::MissionProgress { current: r.seq.saturating_add(1), total: st.mission_count })
        }
        MavMessage::COMMAND_ACK(_)
        | MavMessage::MISSION_REQUEST_INT(_)
        | MavMessage::MISSION_REQUEST(_)
        | MavMessage::MISSION_ACK(_)
        | MavMessage::PARAM_VALUE(_) => {
            if protocol.try_send(msg.clone()).is_err() {
                warn!("FC: dropping handshake message, command side not keeping up");
            }
            None
        }
        _ => None,
    };

    if let Some(s) = sample {
        // no subscribers is fine
        let _ = telemetry.send(s);
    }
}
