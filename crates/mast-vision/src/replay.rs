use anyhow::{Context, Result};
use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::{Frame, FrameSource};

/// Cycles through the images of a directory in name order. Useful for bench
/// runs against recorded footage.
pub struct ReplayFrames {
    paths: Vec<PathBuf>,
    next: usize,
    seq: u64,
}

impl ReplayFrames {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for ent in std::fs::read_dir(dir).with_context(|| format!("read replay dir {}", dir.display()))? {
            let path = ent?.path();
            if path.is_file() && is_image(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        anyhow::ensure!(!paths.is_empty(), "no .jpg/.jpeg/.png files in {}", dir.display());
        info!("replay: {} frames from {}", paths.len(), dir.display());
        Ok(Self { paths, next: 0, seq: 0 })
    }
}

fn is_image(p: &Path) -> bool {
    matches!(
        p.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("jpg" | "jpeg" | "png")
    )
}

fn to_jpeg(bytes: Vec<u8>) -> Result<Vec<u8>> {
    if image::guess_format(&bytes).ok() == Some(ImageFormat::Jpeg) {
        return Ok(bytes);
    }
    let img = image::load_from_memory(&bytes).context("decode replay image")?;
    let mut out = std::io::Cursor::new(Vec::new());
    img.to_rgb8().write_to(&mut out, ImageFormat::Jpeg).context("encode jpeg")?;
    Ok(out.into_inner())
}

impl FrameSource for ReplayFrames {
    fn frame_available(&self) -> bool {
        !self.paths.is_empty()
    }

    async fn next_frame(&mut self, _timeout: Duration) -> Result<Option<Frame>> {
        let path = &self.paths[self.next % self.paths.len()];
        self.next += 1;
        let bytes = tokio::fs::read(path).await.with_context(|| format!("read {}", path.display()))?;
        debug!("replay: {}", path.display());
        self.seq += 1;
        Ok(Some(Frame { seq: self.seq, jpeg: to_jpeg(bytes)? }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mast-replay-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_cycles_and_converts_png() {
        let dir = fixture_dir("cycle");
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([0, 128, 255]));
        img.save_with_format(dir.join("b.png"), ImageFormat::Png).unwrap();
        img.save_with_format(dir.join("a.jpg"), ImageFormat::Jpeg).unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let mut src = ReplayFrames::open(&dir).unwrap();
        assert!(src.frame_available());
        let mut seqs = Vec::new();
        for _ in 0..3 {
            let f = src.next_frame(Duration::from_secs(1)).await.unwrap().unwrap();
            assert_eq!(image::guess_format(&f.jpeg).unwrap(), ImageFormat::Jpeg);
            seqs.push(f.seq);
        }
        assert_eq!(seqs, [1, 2, 3]);
        assert_eq!(src.next, 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_empty_dir_is_an_error() {
        let dir = fixture_dir("empty");
        assert!(ReplayFrames::open(&dir).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
