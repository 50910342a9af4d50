//! Fault-triggered rolling video capture.
//!
//! Every camera streams into its own bounded ring buffer, so the last few
//! seconds of footage are always in memory. A monitor polls a boolean fault
//! tag on an industrial controller; on each rising edge the buffers are
//! snapshotted and written to disk, old clips are pruned, and optionally the
//! newest clip paths are written back to controller tags.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and the bounded `FrameRingBuffer`
//! - `ingest`: video sources (synthetic `stub://`, GStreamer behind a feature)
//! - `capture`: one `CaptureWorker` thread per camera
//! - `encode`: clip encoders (Motion-JPEG)
//! - `save`: `SaveCoordinator`, multi-camera snapshot and save
//! - `retention`: newest-N clip retention per camera directory
//! - `controller`: the `Controller` tag interface, MQTT gateway and in-memory double
//! - `monitor`: the edge-triggered `FaultMonitor`
//! - `report`: `PathReporter`, newest clip paths back to controller tags
//! - `recorder`: wires the above into one fault response
//! - `config`, `logging`: runtime configuration and logger setup

pub mod capture;
pub mod config;
pub mod controller;
pub mod encode;
pub mod frame;
pub mod ingest;
pub mod logging;
pub mod monitor;
pub mod recorder;
pub mod report;
pub mod retention;
pub mod save;

pub use capture::{CaptureWorker, WorkerState};
pub use config::RecorderConfig;
pub use controller::{
    Controller, ControllerError, InMemoryController, MqttController, MqttControllerConfig,
    TagWrite,
};
pub use encode::{MjpegEncoder, VideoArtifact, VideoEncoder};
pub use frame::{Frame, FrameRingBuffer, Resolution, RingBuffer};
pub use ingest::{CameraSource, DefaultSourceOpener, Locator, SourceOpener, VideoSource};
pub use monitor::{
    FaultMonitor, FaultResponder, MonitorError, MonitorSettings, MonitorState, RetryPolicy,
};
pub use recorder::{CycleReport, FaultRecorder};
pub use report::{PathReporter, ReportOutcome};
pub use retention::{RetentionManager, RetentionPolicy};
pub use save::{SaveCoordinator, SaveOutcome};
