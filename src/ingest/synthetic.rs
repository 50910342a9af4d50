//! Synthetic frame source (`stub://`).
//!
//! Produces a moving RGB test pattern at the camera's resolution. The URI
//! query accepts:
//! - `fps=N`: pace reads to N frames per second (`0` disables pacing)
//! - `frames=N`: end the stream after N frames
//!
//! Example: `stub://press_line?fps=15&frames=600`.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::{FrameRead, VideoSource};
use crate::frame::{Frame, Resolution};

pub struct SyntheticSource {
    name: String,
    resolution: Resolution,
    frame_interval: Option<Duration>,
    frame_limit: Option<u64>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(name: &str, resolution: Resolution, fps: u32) -> Self {
        Self {
            name: name.to_string(),
            resolution,
            frame_interval: interval_for(fps),
            frame_limit: None,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    /// Parse a `stub://` URI. `default_fps` applies when the URI has no `fps`.
    pub fn from_uri(uri: &str, resolution: Resolution, default_fps: u32) -> Result<Self> {
        let rest = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub:// locator: {}", uri))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut source = Self::new(name, resolution, default_fps);
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub parameter '{}' in {}", pair, uri))?;
            let value: u64 = value
                .parse()
                .map_err(|_| anyhow!("stub parameter '{}' must be an integer", key))?;
            match key {
                "fps" => source.frame_interval = interval_for(value as u32),
                "frames" => source.frame_limit = Some(value),
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        log::info!("SyntheticSource: opened {} ({})", source.name, resolution);
        Ok(source)
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame_count
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.frame_interval, self.last_frame_at) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let mut pixels = vec![0u8; self.resolution.rgb_len()];
        let width = self.resolution.width.max(1) as u64;
        for (i, pixel) in pixels.iter_mut().enumerate() {
            let column = (i as u64 / 3) % width;
            *pixel = ((column + self.frame_count * 4 + (i as u64 % 3) * 85) % 256) as u8;
        }
        pixels
    }
}

impl VideoSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<FrameRead> {
        if self.frame_limit.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(FrameRead::EndOfStream);
        }
        self.pace();
        let frame = Frame::new(self.generate_pixels(), self.resolution);
        self.frame_count += 1;
        Ok(FrameRead::Frame(frame))
    }

    fn close(self: Box<Self>) -> Result<()> {
        log::debug!(
            "SyntheticSource: closed {} after {} frames",
            self.name,
            self.frame_count
        );
        Ok(())
    }
}

fn interval_for(fps: u32) -> Option<Duration> {
    if fps == 0 {
        None
    } else {
        Some(Duration::from_secs_f64(1.0 / fps as f64))
    }
}
