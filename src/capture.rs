//! Per-camera capture workers.
//!
//! Each worker owns one thread, one `VideoSource` and the write side of one
//! `FrameRingBuffer`. Lifecycle:
//!
//! ```text
//! Idle -> Opening -> Capturing -> Stopping -> Closed
//!            \-> Failed
//! ```
//!
//! Workers never talk to each other. The save path only reads their buffers
//! through `snapshot()`.

use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::FrameRingBuffer;
use crate::ingest::{CameraSource, FrameRead, SourceOpener, VideoSource};

/// Pause after a failed read before trying the source again.
const READ_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Opening,
    Capturing,
    Stopping,
    Closed,
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Opening => "opening",
            WorkerState::Capturing => "capturing",
            WorkerState::Stopping => "stopping",
            WorkerState::Closed => "closed",
            WorkerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State shared between the worker thread and its handle.
struct Shared {
    state: Mutex<WorkerState>,
    stop: AtomicBool,
    frames_captured: AtomicU64,
}

impl Shared {
    fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: WorkerState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = next;
    }
}

pub struct CaptureWorker {
    camera: CameraSource,
    buffer: Arc<FrameRingBuffer>,
    opener: Arc<dyn SourceOpener>,
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    /// Create an idle worker whose buffer holds `capacity` frames.
    pub fn new(camera: CameraSource, capacity: usize, opener: Arc<dyn SourceOpener>) -> Self {
        Self {
            camera,
            buffer: Arc::new(FrameRingBuffer::new(capacity)),
            opener,
            shared: Arc::new(Shared {
                state: Mutex::new(WorkerState::Idle),
                stop: AtomicBool::new(false),
                frames_captured: AtomicU64::new(0),
            }),
            join: None,
        }
    }

    pub fn camera(&self) -> &CameraSource {
        &self.camera
    }

    pub fn id(&self) -> &str {
        &self.camera.id
    }

    /// Read side of the worker's buffer.
    pub fn buffer(&self) -> &Arc<FrameRingBuffer> {
        &self.buffer
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.frames_captured.load(Ordering::Relaxed)
    }

    /// Spawn the capture thread. The source is opened on that thread; an open
    /// failure leaves the worker `Failed` and does not affect other cameras.
    pub fn start(&mut self) -> Result<()> {
        if self.shared.state() != WorkerState::Idle {
            return Err(anyhow!(
                "camera {} already started ({})",
                self.camera.id,
                self.shared.state()
            ));
        }
        self.shared.set_state(WorkerState::Opening);

        let camera = self.camera.clone();
        let buffer = Arc::clone(&self.buffer);
        let opener = Arc::clone(&self.opener);
        let shared = Arc::clone(&self.shared);
        let join = std::thread::Builder::new()
            .name(format!("capture-{}", camera.id))
            .spawn(move || run_capture(camera, buffer, opener, shared))
            .map_err(|e| {
                self.shared.set_state(WorkerState::Failed);
                anyhow!("failed to spawn capture thread for {}: {}", self.camera.id, e)
            })?;
        self.join = Some(join);
        Ok(())
    }

    /// Ask the thread to stop and wait for it. Waits for the in-flight read to
    /// finish; never interrupts it.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("camera {}: capture thread panicked", self.camera.id);
                self.shared.set_state(WorkerState::Failed);
            }
        }
        if self.shared.state() == WorkerState::Idle {
            self.shared.set_state(WorkerState::Closed);
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.stop();
        }
    }
}

fn run_capture(
    camera: CameraSource,
    buffer: Arc<FrameRingBuffer>,
    opener: Arc<dyn SourceOpener>,
    shared: Arc<Shared>,
) {
    let mut source = match opener.open(&camera) {
        Ok(source) => source,
        Err(e) => {
            log::error!("camera {}: failed to open {}: {:#}", camera.id, camera.locator, e);
            shared.set_state(WorkerState::Failed);
            return;
        }
    };

    shared.set_state(WorkerState::Capturing);
    log::info!(
        "camera {}: capturing from {} into {} frame buffer",
        camera.id,
        camera.locator,
        buffer.capacity()
    );

    capture_loop(&camera, source.as_mut(), &buffer, &shared);

    shared.set_state(WorkerState::Stopping);
    release(&camera, source);
    shared.set_state(WorkerState::Closed);
}

fn capture_loop(
    camera: &CameraSource,
    source: &mut dyn VideoSource,
    buffer: &FrameRingBuffer,
    shared: &Shared,
) {
    while !shared.stop.load(Ordering::SeqCst) {
        match source.read_frame() {
            Ok(FrameRead::Frame(frame)) => {
                buffer.push(frame);
                shared.frames_captured.fetch_add(1, Ordering::Relaxed);
            }
            Ok(FrameRead::EndOfStream) => {
                log::warn!("camera {}: end of stream", camera.id);
                break;
            }
            Err(e) => {
                log::warn!("camera {}: frame read failed: {:#}", camera.id, e);
                std::thread::sleep(READ_RETRY_DELAY);
            }
        }
    }
}

fn release(camera: &CameraSource, source: Box<dyn VideoSource>) {
    // The device may already be gone.
    match source.close() {
        Ok(()) => log::debug!("camera {}: source released", camera.id),
        Err(e) => log::debug!("camera {}: source release failed: {:#}", camera.id, e),
    }
}
