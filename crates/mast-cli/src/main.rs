use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::{info, warn};

use mast_fc::mav::{MavLink, DEFAULT_ADDRESS};
use mast_fc::sim::SimLink;
use mast_fc::{FlightLink, LinkConfig};
use mast_geo::{doctor as geo_doctor, Candidate, MastSnapshot};
use mast_mission::{doctor as mission_doctor, run_mission, MissionConfig, MissionReport, MonitorConfig};
use mast_proto::GeoPoint;
use mast_vision::camera::{CameraConfig, CameraFeed};
use mast_vision::external::ExternalClassifier;
use mast_vision::replay::ReplayFrames;
use mast_vision::{Classification, Classifier, ClassifierConfig, Frame, FrameSource};

#[cfg(feature = "vision-tflite")]
use mast_vision::tflite::TfliteClassifier;

#[derive(Debug, Parser)]
#[command(name = "mast", version, about = "MASTscout - find and confirm line of sight to a cell mast by drone")]
struct Cli {
    #[arg(long, default_value = "mast.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Args)]
struct EntryArgs {
    /// Entry point longitude (decimal degrees)
    #[arg(long, default_value_t = 10.573138, allow_negative_numbers = true)]
    lon: f64,
    /// Entry point latitude (decimal degrees)
    #[arg(long, default_value_t = 55.369671, allow_negative_numbers = true)]
    lat: f64,
}

impl EntryArgs {
    fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate config, snapshot and search parameters.
    Doctor,
    /// Fly the closest candidate masts from the entry point.
    Run {
        #[command(flatten)]
        entry: EntryArgs,
        /// Write the JSON mission report here.
        #[arg(long)]
        report: Option<String>,
    },
    /// Print the candidate masts for an entry point.
    Closest {
        #[command(flatten)]
        entry: EntryArgs,
        #[arg(long)]
        radius: Option<f64>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    link: LinkConfig,
    masts: MastsCfg,
    #[serde(default)]
    mission: MissionConfig,
    #[serde(default)]
    monitors: MonitorConfig,

    camera: Option<CameraConfig>,
    replay: Option<ReplayCfg>,
    classifier: ClassifierConfig,
}

#[derive(Debug, serde::Deserialize)]
struct MastsCfg {
    snapshot_path: String,
    /// Search radius around the entry point. Default 4000.
    radius_m: Option<f64>,
    /// Candidates to consider. Default 3.
    limit: Option<usize>,
}

impl MastsCfg {
    fn radius_m(&self) -> f64 {
        self.radius_m.unwrap_or(4000.0)
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(3)
    }
}

#[derive(Debug, serde::Deserialize)]
struct ReplayCfg {
    dir: String,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    parse_config(&s)
}

fn parse_config(s: &str) -> Result<Config> {
    toml::from_str(s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run { entry, report } => run(&cfg, entry.point(), report.as_deref()).await?,
        Command::Closest { entry, radius, limit } => closest(&cfg, entry.point(), radius, limit)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    match cfg.link.kind.as_str() {
        "mavlink" => {
            let addr = cfg.link.address.as_deref().unwrap_or(DEFAULT_ADDRESS);
            anyhow::ensure!(addr.contains(':'), "link.address looks wrong: {}", addr);
            if !cfg.link.require_heartbeat {
                warn!("doctor: link.require_heartbeat=false, commands may go out before the autopilot is seen");
            }
        }
        "sim" => info!("doctor: simulated link"),
        other => anyhow::bail!("unknown link.kind: {}", other),
    }
    if !cfg.link.allow_rtl {
        warn!("doctor: link.allow_rtl=false, the mission cannot end with return-to-launch");
    }

    geo_doctor::check_search(cfg.masts.radius_m(), cfg.masts.limit())?;
    let snap = MastSnapshot::load(&cfg.masts.snapshot_path)?;
    geo_doctor::check_snapshot(&snap)?;
    if snap.skipped() > 0 {
        warn!("doctor: {} snapshot records without usable coordinates", snap.skipped());
    }

    mission_doctor::check_mission(&cfg.mission)?;
    mission_doctor::check_monitors(&cfg.monitors)?;
    if cfg.mission.max_attempts > cfg.masts.limit() {
        warn!(
            "doctor: mission.max_attempts={} but only {} candidates are searched",
            cfg.mission.max_attempts,
            cfg.masts.limit()
        );
    }

    match (&cfg.camera, &cfg.replay) {
        (Some(cam), _) => {
            mast_vision::camera::capture_command(cam)?;
        }
        (None, Some(r)) => {
            anyhow::ensure!(std::path::Path::new(&r.dir).is_dir(), "replay.dir not a directory: {}", r.dir);
        }
        (None, None) => anyhow::bail!("no frame source: configure [camera] or [replay]"),
    }

    match cfg.classifier.backend.as_str() {
        "external" => {
            ExternalClassifier::new(&cfg.classifier)?;
        }
        "tflite" => {
            #[cfg(not(feature = "vision-tflite"))]
            { anyhow::bail!("classifier.backend=tflite but binary not built with --features vision-tflite"); }
            #[cfg(feature = "vision-tflite")]
            {
                let model = cfg.classifier.model_path.as_deref().context("classifier.model_path missing")?;
                anyhow::ensure!(std::path::Path::new(model).is_file(), "model not found: {}", model);
            }
        }
        other => anyhow::bail!("unknown classifier.backend: {}", other),
    }

    info!("doctor: OK");
    Ok(())
}

fn candidates(cfg: &Config, entry: GeoPoint, radius_m: f64, limit: usize) -> Result<Vec<Candidate>> {
    geo_doctor::check_entry_point(entry)?;
    let snap = MastSnapshot::load(&cfg.masts.snapshot_path)?;
    let found = snap.find_closest(entry, radius_m, limit);
    info!("{} masts within {:.0} m of {:.6},{:.6}", found.len(), radius_m, entry.lat, entry.lon);
    Ok(found)
}

fn closest(cfg: &Config, entry: GeoPoint, radius: Option<f64>, limit: Option<usize>) -> Result<()> {
    let found = candidates(cfg, entry, radius.unwrap_or(cfg.masts.radius_m()), limit.unwrap_or(cfg.masts.limit()))?;
    if found.is_empty() {
        println!("no masts in range");
    }
    for (i, c) in found.iter().enumerate() {
        let m = &c.mast;
        println!(
            "{} {} {:.0}m lat={:.6} lon={:.6} service={} tech={}",
            i,
            m.station_id,
            c.distance_m,
            m.position.lat,
            m.position.lon,
            m.service.as_ref().map(|s| s.navn.as_str()).unwrap_or("-"),
            m.technology.as_ref().map(|t| t.navn.as_str()).unwrap_or("-"),
        );
    }
    Ok(())
}

async fn run(cfg: &Config, entry: GeoPoint, report_path: Option<&str>) -> Result<()> {
    info!("run: starting from {:.6},{:.6}", entry.lat, entry.lon);
    let found = candidates(cfg, entry, cfg.masts.radius_m(), cfg.masts.limit())?;

    let frames = init_frames(cfg)?;
    let classifier = init_classifier(cfg)?;

    let report = match cfg.link.kind.as_str() {
        "mavlink" => {
            let mut link = MavLink::open(&cfg.link).context("open flight link")?;
            let report = fly(&mut link, frames, classifier, cfg, entry, &found).await;
            let st = link.status();
            info!(
                "run: link at exit: armed={} in_air={} last heartbeat {:?} ago",
                st.armed,
                st.in_air,
                st.hb_age()
            );
            report?
        }
        "sim" => {
            let mut link = SimLink::new(entry, cfg.link.sim.clone().unwrap_or_default());
            fly(&mut link, frames, classifier, cfg, entry, &found).await?
        }
        other => anyhow::bail!("unknown link.kind: {}", other),
    };

    println!("mast found: {}", report.mast_found);
    for a in &report.attempts {
        println!("attempt {} {} {:.0}m {:?}", a.index, a.station_id, a.distance_m, a.outcome);
    }
    if let Some(path) = report_path {
        std::fs::write(path, report.to_json()?).with_context(|| format!("write report {}", path))?;
        info!("run: report written to {}", path);
    }
    Ok(())
}

async fn fly<L: FlightLink>(
    link: &mut L,
    frames: FrameRuntime,
    classifier: ClassifierRuntime,
    cfg: &Config,
    entry: GeoPoint,
    candidates: &[Candidate],
) -> Result<MissionReport> {
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("run: cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    run_mission(link, frames, classifier, &cfg.mission, &cfg.monitors, entry, candidates, interrupted).await
}

// --- frame source / classifier runtimes ---

enum FrameRuntime {
    Camera(CameraFeed),
    Replay(ReplayFrames),
}

impl FrameSource for FrameRuntime {
    fn frame_available(&self) -> bool {
        match self {
            FrameRuntime::Camera(c) => c.frame_available(),
            FrameRuntime::Replay(r) => r.frame_available(),
        }
    }

    async fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        match self {
            FrameRuntime::Camera(c) => c.next_frame(timeout).await,
            FrameRuntime::Replay(r) => r.next_frame(timeout).await,
        }
    }
}

fn init_frames(cfg: &Config) -> Result<FrameRuntime> {
    if let Some(cam) = &cfg.camera {
        return Ok(FrameRuntime::Camera(CameraFeed::spawn(cam.clone())?));
    }
    let replay = cfg.replay.as_ref().context("no frame source: configure [camera] or [replay]")?;
    Ok(FrameRuntime::Replay(ReplayFrames::open(&replay.dir)?))
}

enum ClassifierRuntime {
    External(ExternalClassifier),
    #[cfg(feature = "vision-tflite")]
    Tflite(TfliteClassifier),
}

impl Classifier for ClassifierRuntime {
    async fn classify(&mut self, frame: &Frame) -> Result<Classification> {
        match self {
            ClassifierRuntime::External(c) => c.classify(frame).await,
            #[cfg(feature = "vision-tflite")]
            ClassifierRuntime::Tflite(c) => c.classify(frame).await,
        }
    }
}

fn init_classifier(cfg: &Config) -> Result<ClassifierRuntime> {
    match cfg.classifier.backend.as_str() {
        "external" => Ok(ClassifierRuntime::External(ExternalClassifier::new(&cfg.classifier)?)),
        #[cfg(feature = "vision-tflite")]
        "tflite" => Ok(ClassifierRuntime::Tflite(TfliteClassifier::new(&cfg.classifier)?)),
        #[cfg(not(feature = "vision-tflite"))]
        "tflite" => anyhow::bail!("classifier.backend=tflite but binary not built with --features vision-tflite"),
        other => anyhow::bail!("unknown classifier.backend: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let cfg = parse_config(include_str!("../../../mast.example.toml")).unwrap();
        assert_eq!(cfg.link.kind, "sim");
        assert_eq!(cfg.masts.radius_m(), 4000.0);
        assert_eq!(cfg.masts.limit(), 3);
        assert_eq!(cfg.mission.max_attempts, 3);
        assert_eq!(cfg.monitors.distance_threshold_cm, 250);
        assert_eq!(cfg.monitors.target_label, "balloon");
        assert!(cfg.camera.is_none());
        assert_eq!(cfg.replay.as_ref().map(|r| r.dir.as_str()), Some("frames"));
        assert_eq!(cfg.classifier.backend, "external");
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let cfg = parse_config(
            r#"
            [link]
            kind = "mavlink"
            sys_id = 245
            comp_id = 191
            target_sys = 1
            target_comp = 1
            allow_rtl = true
            require_heartbeat = true

            [masts]
            snapshot_path = "masts.json"

            [classifier]
            backend = "external"
            command = ["python3", "classify.py"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.mission.mast_height_m, 30.0);
        assert_eq!(cfg.monitors.recognition_period_ms, 5000);
        assert!(cfg.replay.is_none() && cfg.camera.is_none());
        assert!(init_frames(&cfg).is_err());

        let params = cfg.link.mission_params();
        assert_eq!(params.get("MIS_DIST_1WP"), Some(&5000.0));
        assert_eq!(params.get("MIS_DIST_WPS"), Some(&5000.0));
    }

    #[test]
    fn test_link_params_override() {
        let cfg = parse_config(
            r#"
            [link]
            kind = "mavlink"
            sys_id = 245
            comp_id = 191
            target_sys = 1
            target_comp = 1
            allow_rtl = true
            require_heartbeat = true
            params = {}

            [masts]
            snapshot_path = "masts.json"

            [classifier]
            backend = "external"
            command = ["classify"]
            "#,
        )
        .unwrap();
        assert!(cfg.link.mission_params().is_empty());

        let cfg = parse_config(&include_str!("../../../mast.example.toml").replace(
            "# params = { MIS_DIST_1WP = 5000.0, MIS_DIST_WPS = 5000.0 }",
            "params = { MIS_DIST_1WP = 8000.0 }",
        ))
        .unwrap();
        assert_eq!(cfg.link.mission_params().into_iter().collect::<Vec<_>>(), [("MIS_DIST_1WP".to_string(), 8000.0)]);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["mast", "run"]).unwrap();
        assert_eq!(cli.config, "mast.toml");
        match cli.cmd {
            Command::Run { entry, report } => {
                assert_eq!(entry.point(), GeoPoint::new(55.369671, 10.573138));
                assert!(report.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let cli = Cli::try_parse_from(["mast", "--config", "x.toml", "closest", "--lon", "-3.5", "--radius", "900"]).unwrap();
        match cli.cmd {
            Command::Closest { entry, radius, limit } => {
                assert_eq!(entry.lon, -3.5);
                assert_eq!(radius, Some(900.0));
                assert_eq!(limit, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
