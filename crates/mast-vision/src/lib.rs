pub mod camera;
pub mod external;
pub mod replay;
#[cfg(feature = "vision-tflite")]
pub mod tflite;

use anyhow::{Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// One captured image, JPEG encoded.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub jpeg: Vec<u8>,
}

impl Frame {
    pub fn decode(&self) -> Result<DynamicImage> {
        image::load_from_memory(&self.jpeg).context("decode frame")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

impl Classification {
    pub fn is_target(&self, label: &str, min_confidence: f32) -> bool {
        self.label == label && self.confidence >= min_confidence
    }
}

pub trait FrameSource: Send {
    fn frame_available(&self) -> bool;

    /// Wait up to `timeout` for a frame that has not been handed out yet.
    /// `Ok(None)` means nothing arrived in time.
    fn next_frame(&mut self, timeout: Duration) -> impl Future<Output = Result<Option<Frame>>> + Send;
}

pub trait Classifier: Send {
    fn classify(&mut self, frame: &Frame) -> impl Future<Output = Result<Classification>> + Send;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    pub backend: String, // "external" | "tflite"

    /// external: program and arguments; the frame is written to stdin and
    /// `<label> <confidence>` is read from the last line of stdout.
    pub command: Option<Vec<String>>,
    pub timeout_ms: Option<u64>,

    /// tflite
    pub model_path: Option<String>,
    pub img_w: Option<u32>,
    pub img_h: Option<u32>,
    pub class_names: Option<Vec<String>>,
    pub num_threads: Option<i32>,
}

/// Best class from raw scores. Scores that do not already look like
/// probabilities are passed through softmax.
pub fn top1(scores: &[f32], class_names: &[String]) -> Option<Classification> {
    if scores.is_empty() {
        return None;
    }
    let probs: Vec<f32> = if scores.iter().all(|s| (0.0..=1.0).contains(s)) {
        scores.to_vec()
    } else {
        softmax(scores)
    };
    let (idx, conf) = probs
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    let label = class_names.get(idx).cloned().unwrap_or_else(|| format!("class_{}", idx));
    Some(Classification { label, confidence: conf })
}

fn softmax(xs: &[f32]) -> Vec<f32> {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = xs.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["background".into(), "balloon".into(), "mast".into()]
    }

    #[test]
    fn test_top1_probabilities() {
        let c = top1(&[0.02, 0.95, 0.03], &names()).unwrap();
        assert_eq!(c.label, "balloon");
        assert_eq!(c.confidence, 0.95);
        assert!(c.is_target("balloon", 0.90));
        assert!(!c.is_target("mast", 0.90));
    }

    #[test]
    fn test_top1_logits_use_softmax() {
        let c = top1(&[-1.0, 0.5, 6.0], &names()).unwrap();
        assert_eq!(c.label, "mast");
        assert!(c.confidence > 0.99 && c.confidence <= 1.0);
    }

    #[test]
    fn test_top1_unknown_class_and_empty() {
        let c = top1(&[0.1, 0.2, 0.3, 0.4], &names()).unwrap();
        assert_eq!(c.label, "class_3");
        assert!(top1(&[], &names()).is_none());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let c = Classification { label: "mast".into(), confidence: 0.90 };
        assert!(c.is_target("mast", 0.90));
        let c = Classification { confidence: 0.89, ..c };
        assert!(!c.is_target("mast", 0.90));
    }

    #[test]
    fn test_frame_decode() {
        let img = image::RgbImage::from_pixel(4, 3, image::Rgb([200, 10, 10]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Jpeg).unwrap();
        let frame = Frame { seq: 1, jpeg: buf.into_inner() };
        let decoded = frame.decode().unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));

        let bad = Frame { seq: 2, jpeg: vec![1, 2, 3] };
        assert!(bad.decode().is_err());
    }
}
