//! GStreamer-backed camera source.
//!
//! Builds one pipeline per camera, scaled and converted to packed RGB at the
//! camera's configured resolution:
//! - device index: `v4l2src device=/dev/video<N>`
//! - `rtsp://`: `rtspsrc ! decodebin`
//! - any other URI: `uridecodebin`

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use super::{CameraSource, FrameRead, Locator, VideoSource};
use crate::frame::{Frame, Resolution};

/// Upper bound on a single blocking read before the stream counts as stalled.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct GstreamerSource {
    camera_id: String,
    resolution: Resolution,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

impl GstreamerSource {
    pub(crate) fn open(camera: &CameraSource) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = pipeline_description(&camera.locator, camera.resolution);
        log::debug!("camera {}: gstreamer pipeline `{}`", camera.id, description);

        let pipeline = gstreamer::parse::launch(&description)
            .with_context(|| format!("build pipeline for camera {}", camera.id))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("camera {} pipeline is not a Pipeline", camera.id))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start pipeline for camera {}", camera.id))?;
        log::info!("camera {}: connected to {}", camera.id, camera.locator);

        Ok(Self {
            camera_id: camera.id.clone(),
            resolution: camera.resolution,
            pipeline,
            appsink,
        })
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            if let MessageView::Error(err) = message.view() {
                return Err(anyhow!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
        }
        Ok(())
    }
}

impl VideoSource for GstreamerSource {
    fn read_frame(&mut self) -> Result<FrameRead> {
        self.check_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(FRAME_TIMEOUT.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Ok(FrameRead::EndOfStream);
            }
            return Err(anyhow!("camera {} stream stalled", self.camera_id));
        };

        let (pixels, resolution) = sample_to_pixels(&sample)?;
        if resolution != self.resolution {
            log::debug!(
                "camera {}: negotiated {} instead of {}",
                self.camera_id,
                resolution,
                self.resolution
            );
        }
        Ok(FrameRead::Frame(Frame::new(pixels, resolution)))
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Null)
            .with_context(|| format!("stop pipeline for camera {}", self.camera_id))?;
        Ok(())
    }
}

fn pipeline_description(locator: &Locator, resolution: Resolution) -> String {
    let source = match locator {
        Locator::Device(index) => format!("v4l2src device=/dev/video{}", index),
        Locator::Uri(uri) if uri.starts_with("rtsp://") => {
            format!("rtspsrc location={} latency=0 ! decodebin", uri)
        }
        Locator::Uri(uri) => format!("uridecodebin uri={}", uri),
    };
    format!(
        "{} ! videoconvert ! videoscale ! video/x-raw,format=RGB,width={},height={} ! \
         appsink name=appsink sync=false max-buffers=1 drop=true",
        source, resolution.width, resolution.height
    )
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, Resolution)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let resolution = Resolution::new(info.width(), info.height());
    let row_bytes = resolution.width as usize * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), resolution));
    }

    let mut pixels = Vec::with_capacity(resolution.rgb_len());
    for row in 0..resolution.height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("buffer row is out of bounds")?);
    }

    Ok((pixels, resolution))
}
