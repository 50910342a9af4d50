//! Camera frame sources.
//!
//! This module provides the sources a capture worker reads from:
//! - Synthetic stream (`stub://`) for tests and dry runs
//! - Local devices and network/file URIs via GStreamer (feature: gstreamer)
//!
//! A `SourceOpener` turns a configured `CameraSource` into an open
//! `VideoSource`. Reading a frame blocks until the device delivers one, the
//! stream ends, or the source errors.

#[cfg(feature = "gstreamer")]
mod gst_source;
pub mod synthetic;

use anyhow::{anyhow, Result};
use std::fmt;

use crate::frame::{Frame, Resolution};

#[cfg(feature = "gstreamer")]
use self::gst_source::GstreamerSource;
pub use synthetic::SyntheticSource;

/// Where a camera's frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Locator {
    /// Local capture device index (`/dev/video<N>` on Linux).
    Device(u32),
    /// Stream or file URI (`rtsp://...`, `file://...`, `stub://...`).
    Uri(String),
}

impl Locator {
    /// An unsigned integer is a device index; anything else is a URI.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("camera locator must not be empty"));
        }
        match trimmed.parse::<u32>() {
            Ok(index) => Ok(Locator::Device(index)),
            Err(_) => Ok(Locator::Uri(trimmed.to_string())),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Device(index) => write!(f, "device:{}", index),
            Locator::Uri(uri) => f.write_str(uri),
        }
    }
}

/// A configured camera. Immutable for the lifetime of the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraSource {
    pub id: String,
    pub locator: Locator,
    pub resolution: Resolution,
}

/// Outcome of one blocking read.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    EndOfStream,
}

/// An open camera or stream.
pub trait VideoSource: Send {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<FrameRead>;

    /// Release the underlying handle. Best-effort: callers log and move on.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Opens `VideoSource`s for configured cameras.
pub trait SourceOpener: Send + Sync {
    fn open(&self, camera: &CameraSource) -> Result<Box<dyn VideoSource>>;
}

/// Opener that picks a backend from the camera's locator.
#[derive(Clone, Debug)]
pub struct DefaultSourceOpener {
    /// Nominal source frame rate, used to pace synthetic streams.
    pub fps: u32,
}

impl DefaultSourceOpener {
    pub fn new(fps: u32) -> Self {
        Self { fps }
    }
}

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, camera: &CameraSource) -> Result<Box<dyn VideoSource>> {
        match &camera.locator {
            Locator::Uri(uri) if uri.starts_with("stub://") => Ok(Box::new(
                SyntheticSource::from_uri(uri, camera.resolution, self.fps)?,
            )),
            _ => open_native(camera),
        }
    }
}

#[cfg(feature = "gstreamer")]
fn open_native(camera: &CameraSource) -> Result<Box<dyn VideoSource>> {
    Ok(Box::new(GstreamerSource::open(camera)?))
}

#[cfg(not(feature = "gstreamer"))]
fn open_native(camera: &CameraSource) -> Result<Box<dyn VideoSource>> {
    Err(anyhow!(
        "camera {} ({}) requires the gstreamer feature",
        camera.id,
        camera.locator
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_parses_device_index_and_uri() -> Result<()> {
        assert_eq!(Locator::parse("1")?, Locator::Device(1));
        assert_eq!(Locator::parse(" 0 ")?, Locator::Device(0));
        assert_eq!(
            Locator::parse("rtsp://192.168.1.91/streaming/channels/1")?,
            Locator::Uri("rtsp://192.168.1.91/streaming/channels/1".to_string())
        );
        assert!(Locator::parse("  ").is_err());
        Ok(())
    }

    #[test]
    fn default_opener_opens_stub_streams() -> Result<()> {
        let camera = CameraSource {
            id: "line1".to_string(),
            locator: Locator::Uri("stub://line1?fps=0".to_string()),
            resolution: Resolution::new(4, 2),
        };
        let mut source = DefaultSourceOpener::new(30).open(&camera)?;
        match source.read_frame()? {
            FrameRead::Frame(frame) => assert_eq!(frame.resolution(), Resolution::new(4, 2)),
            FrameRead::EndOfStream => panic!("stub stream ended early"),
        }
        source.close()?;
        Ok(())
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn native_locators_need_gstreamer() {
        let camera = CameraSource {
            id: "dock".to_string(),
            locator: Locator::Device(0),
            resolution: Resolution::new(640, 480),
        };
        let err = DefaultSourceOpener::new(30).open(&camera).err().unwrap();
        assert!(err.to_string().contains("gstreamer"));
    }
}
