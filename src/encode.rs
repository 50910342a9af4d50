//! Video encoding for saved clips.
//!
//! The save path hands an ordered frame snapshot to a `VideoEncoder`, which
//! writes one playable artifact. The bundled `MjpegEncoder` writes a Motion-JPEG
//! elementary stream: one baseline JPEG per frame, concatenated. ffmpeg, VLC
//! and most NVR tools play it directly.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, RgbImage};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::frame::{Frame, Resolution};

pub const MJPEG_EXTENSION: &str = "mjpeg";
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// A saved clip on disk. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoArtifact {
    pub camera_id: String,
    pub created_at: NaiveDateTime,
    pub path: PathBuf,
    pub frame_count: usize,
}

/// Everything an encoder needs to write one clip.
#[derive(Clone, Copy, Debug)]
pub struct EncodeRequest<'a> {
    pub camera_id: &'a str,
    pub frames: &'a [Frame],
    /// Capture rate. A Motion-JPEG elementary stream carries no timing, so
    /// `MjpegEncoder` ignores it; players must be told the rate out of band.
    pub fps: u32,
    pub resolution: Resolution,
    pub output_path: &'a Path,
    pub created_at: NaiveDateTime,
}

pub trait VideoEncoder: Send + Sync {
    /// File extension of produced artifacts, without the dot.
    fn extension(&self) -> &str;

    fn encode(&self, request: EncodeRequest<'_>) -> Result<VideoArtifact>;
}

#[derive(Clone, Debug)]
pub struct MjpegEncoder {
    quality: u8,
}

impl MjpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    fn write_frame<W: Write>(&self, out: &mut W, frame: &Frame, target: Resolution) -> Result<()> {
        let source = frame.resolution();
        if frame.byte_len() != source.rgb_len() {
            return Err(anyhow!(
                "frame payload is {} bytes, expected {} for {}",
                frame.byte_len(),
                source.rgb_len(),
                source
            ));
        }

        let mut encoder = JpegEncoder::new_with_quality(&mut *out, self.quality);
        if source == target {
            encoder.encode(frame.data(), target.width, target.height, ExtendedColorType::Rgb8)?;
        } else {
            let image = RgbImage::from_raw(source.width, source.height, frame.data().to_vec())
                .ok_or_else(|| anyhow!("frame does not match {}", source))?;
            let scaled =
                imageops::resize(&image, target.width, target.height, FilterType::Triangle);
            encoder.encode(scaled.as_raw(), target.width, target.height, ExtendedColorType::Rgb8)?;
        }
        Ok(())
    }
}

impl Default for MjpegEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl VideoEncoder for MjpegEncoder {
    fn extension(&self) -> &str {
        MJPEG_EXTENSION
    }

    fn encode(&self, request: EncodeRequest<'_>) -> Result<VideoArtifact> {
        if request.frames.is_empty() {
            return Err(anyhow!("no frames to encode for camera {}", request.camera_id));
        }

        let partial = partial_path(request.output_path);
        let result = (|| -> Result<()> {
            let file = File::create(&partial)
                .with_context(|| format!("create {}", partial.display()))?;
            let mut out = BufWriter::new(file);
            for frame in request.frames {
                self.write_frame(&mut out, frame, request.resolution)?;
            }
            let file = out.into_inner().map_err(|e| anyhow!("flush clip: {}", e))?;
            file.sync_all()?;
            fs::rename(&partial, request.output_path)
                .with_context(|| format!("publish {}", request.output_path.display()))?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        Ok(VideoArtifact {
            camera_id: request.camera_id.to_string(),
            created_at: request.created_at,
            path: request.output_path.to_path_buf(),
            frame_count: request.frames.len(),
        })
    }
}

/// In-progress clips carry a `.partial` suffix so retention never sees them.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gray_frame(level: u8, resolution: Resolution) -> Frame {
        Frame::new(vec![level; resolution.rgb_len()], resolution)
    }

    fn request<'a>(
        frames: &'a [Frame],
        path: &'a Path,
        resolution: Resolution,
    ) -> EncodeRequest<'a> {
        EncodeRequest {
            camera_id: "press",
            frames,
            fps: 30,
            resolution,
            output_path: path,
            created_at: chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap(),
        }
    }

    fn count_jpeg_starts(bytes: &[u8]) -> usize {
        bytes.windows(3).filter(|w| *w == [0xFF, 0xD8, 0xFF]).count()
    }

    #[test]
    fn writes_one_jpeg_per_frame() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("20240101_000000.mjpeg");
        let res = Resolution::new(16, 8);
        let frames: Vec<Frame> = (0..5).map(|i| gray_frame(i * 40, res)).collect();

        let artifact = MjpegEncoder::default().encode(request(&frames, &path, res))?;

        assert_eq!(artifact.frame_count, 5);
        assert_eq!(artifact.path, path);
        let bytes = fs::read(&path)?;
        assert_eq!(count_jpeg_starts(&bytes), 5);
        assert!(!partial_path(&path).exists());
        Ok(())
    }

    #[test]
    fn resizes_frames_to_target_resolution() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("clip.mjpeg");
        let frames = vec![gray_frame(128, Resolution::new(32, 16))];

        MjpegEncoder::new(90).encode(request(&frames, &path, Resolution::new(8, 4)))?;

        let decoded =
            image::load_from_memory_with_format(&fs::read(&path)?, image::ImageFormat::Jpeg)?;
        assert_eq!((decoded.width(), decoded.height()), (8, 4));
        Ok(())
    }

    #[test]
    fn empty_snapshot_is_an_error_and_leaves_nothing_behind() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("clip.mjpeg");
        let res = Resolution::new(4, 4);
        assert!(MjpegEncoder::default().encode(request(&[], &path, res)).is_err());
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn malformed_frame_removes_partial_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("clip.mjpeg");
        let res = Resolution::new(4, 4);
        let frames = vec![gray_frame(1, res), Frame::new(vec![0; 5], res)];
        assert!(MjpegEncoder::default().encode(request(&frames, &path, res)).is_err());
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }
}
