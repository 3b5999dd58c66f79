use anyhow::{Context, Result};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Frame, FrameSource};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CameraConfig {
    pub mode: String,   // "libcamera-jpeg" | "v4l2-mjpeg"
    pub device: String, // /dev/video0 (v4l2)
    pub width: u32,
    pub height: u32,
    /// Pause between captures. Default 1000.
    pub capture_interval_ms: Option<u64>,
}

/// Program and arguments for grabbing one JPEG to stdout.
/// - libcamera-jpeg: `libcamera-still -n -t 1 --width W --height H -o -`
/// - v4l2-mjpeg: one MJPEG frame from `ffmpeg`
pub fn capture_command(cfg: &CameraConfig) -> Result<(&'static str, Vec<String>)> {
    let args: Vec<String> = match cfg.mode.as_str() {
        "libcamera-jpeg" => vec![
            "-n".into(),
            "-t".into(), "1".into(),
            "--width".into(), cfg.width.to_string(),
            "--height".into(), cfg.height.to_string(),
            "-o".into(), "-".into(),
        ],
        "v4l2-mjpeg" => vec![
            "-hide_banner".into(), "-loglevel".into(), "error".into(),
            "-f".into(), "video4linux2".into(),
            "-input_format".into(), "mjpeg".into(),
            "-video_size".into(), format!("{}x{}", cfg.width, cfg.height),
            "-i".into(), cfg.device.clone(),
            "-vframes".into(), "1".into(),
            "-f".into(), "image2pipe".into(),
            "-vcodec".into(), "mjpeg".into(),
            "-".into(),
        ],
        other => anyhow::bail!("unknown camera.mode: {}", other),
    };
    let program = if cfg.mode == "libcamera-jpeg" { "libcamera-still" } else { "ffmpeg" };
    Ok((program, args))
}

pub async fn capture_jpeg(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let (program, args) = capture_command(cfg)?;
    debug!("capture: {}", program);
    let out = Command::new(program)
        .args(&args)
        .output()
        .await
        .with_context(|| format!("run {}", program))?;
    anyhow::ensure!(out.status.success(), "{} failed: {}", program, out.status);
    anyhow::ensure!(!out.stdout.is_empty(), "{} produced no image", program);
    Ok(out.stdout)
}

/// Background capture loop publishing the latest frame. Readers wait on the
/// watch channel instead of polling for a frame.
pub struct CameraFeed {
    rx: watch::Receiver<Option<Frame>>,
    task: JoinHandle<()>,
}

impl CameraFeed {
    pub fn spawn(cfg: CameraConfig) -> Result<Self> {
        // fail early on a bad mode rather than inside the loop
        capture_command(&cfg)?;
        let (tx, rx) = watch::channel(None);
        let period = Duration::from_millis(cfg.capture_interval_ms.unwrap_or(1000));
        info!("camera: {} {}x{} every {:?}", cfg.mode, cfg.width, cfg.height, period);

        let task = tokio::spawn(async move {
            let mut seq = 0u64;
            loop {
                match capture_jpeg(&cfg).await {
                    Ok(jpeg) => {
                        seq += 1;
                        if tx.send(Some(Frame { seq, jpeg })).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("camera: capture failed: {:#}", e),
                }
                tokio::time::sleep(period).await;
            }
        });
        Ok(Self { rx, task })
    }
}

impl Drop for CameraFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FrameSource for CameraFeed {
    fn frame_available(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    async fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        match tokio::time::timeout(timeout, self.rx.changed()).await {
            Err(_) => Ok(None),
            Ok(Err(_)) => anyhow::bail!("camera capture loop stopped"),
            Ok(Ok(())) => {
                let frame = self.rx.borrow_and_update().clone();
                Ok(frame)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(mode: &str) -> CameraConfig {
        CameraConfig { mode: mode.into(), device: "/dev/video2".into(), width: 640, height: 480, capture_interval_ms: None }
    }

    #[test]
    fn test_capture_command_libcamera() {
        let (prog, args) = capture_command(&cfg("libcamera-jpeg")).unwrap();
        assert_eq!(prog, "libcamera-still");
        assert_eq!(args.join(" "), "-n -t 1 --width 640 --height 480 -o -");
    }

    #[test]
    fn test_capture_command_v4l2() {
        let (prog, args) = capture_command(&cfg("v4l2-mjpeg")).unwrap();
        assert_eq!(prog, "ffmpeg");
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/dev/video2"));
        assert!(args.windows(2).any(|w| w[0] == "-video_size" && w[1] == "640x480"));
    }

    #[test]
    fn test_unknown_mode() {
        assert!(capture_command(&cfg("gstreamer")).is_err());
    }
}
