use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{Classification, Classifier, ClassifierConfig, Frame};

/// Runs a model out of process: JPEG on stdin, `<label> <confidence>` on stdout.
/// Confidence may be a fraction (`0.95`) or a percentage (`95%`).
pub struct ExternalClassifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalClassifier {
    pub fn new(cfg: &ClassifierConfig) -> Result<Self> {
        let cmd = cfg.command.as_ref().context("classifier.command missing")?;
        let (program, args) = cmd.split_first().context("classifier.command is empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_millis(cfg.timeout_ms.unwrap_or(10_000)),
        })
    }
}

impl Classifier for ExternalClassifier {
    async fn classify(&mut self, frame: &Frame) -> Result<Classification> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn classifier {}", self.program))?;

        // feed stdin while draining stdout, all under one deadline; a child
        // that never reads would otherwise stall the write on a full pipe
        let mut stdin = child.stdin.take().context("classifier stdin")?;
        let write = async move {
            let res = stdin.write_all(&frame.jpeg).await;
            drop(stdin);
            res
        };
        let (written, out) = tokio::time::timeout(self.timeout, async move { tokio::join!(write, child.wait_with_output()) })
            .await
            .map_err(|_| anyhow::anyhow!("classifier timed out after {:?}", self.timeout))?;
        let out = out.context("wait for classifier")?;
        anyhow::ensure!(
            out.status.success(),
            "classifier exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
        if let Err(e) = written {
            debug!("classifier: frame {} not fully read: {}", frame.seq, e);
        }
        let c = parse_classification(&String::from_utf8_lossy(&out.stdout))?;
        debug!("classifier: frame {} -> {} ({:.2})", frame.seq, c.label, c.confidence);
        Ok(c)
    }
}

pub fn parse_classification(s: &str) -> Result<Classification> {
    let line = s.lines().rev().map(str::trim).find(|l| !l.is_empty()).context("classifier printed nothing")?;
    let (label, conf) = line.rsplit_once(char::is_whitespace).context("expected `<label> <confidence>`")?;
    let label = label.trim();
    anyhow::ensure!(!label.is_empty(), "classifier label is empty");

    let confidence = match conf.strip_suffix('%') {
        Some(pct) => pct.parse::<f32>().context("parse confidence")? / 100.0,
        None => conf.parse::<f32>().context("parse confidence")?,
    };
    anyhow::ensure!((0.0..=1.0).contains(&confidence), "confidence out of range: {}", conf);
    Ok(Classification { label: label.to_string(), confidence })
}
