//! Wires capture, saving, retention and path reporting into one fault
//! response, and runs it under the fault monitor.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::capture::CaptureWorker;
use crate::config::RecorderConfig;
use crate::controller::{Controller, MqttController};
use crate::encode::{MjpegEncoder, VideoEncoder};
use crate::ingest::{DefaultSourceOpener, SourceOpener};
use crate::monitor::{FaultMonitor, FaultResponder, MonitorError, MonitorSettings};
use crate::report::{PathReporter, ReportOutcome};
use crate::retention::{PruneReport, RetentionManager, RetentionPolicy};
use crate::save::{SaveCoordinator, SaveOutcome};

/// Everything one fault response did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub saves: Vec<SaveOutcome>,
    pub pruned: Vec<PruneReport>,
    /// Newest clip per camera, in camera order, after pruning.
    pub newest: Vec<Option<PathBuf>>,
    pub reported: Vec<ReportOutcome>,
}

impl CycleReport {
    pub fn saved_count(&self) -> usize {
        self.saves.iter().filter(|s| s.artifact().is_some()).count()
    }
}

/// Owns the capture workers and answers faults by saving their buffers.
pub struct FaultRecorder {
    workers: Vec<CaptureWorker>,
    saver: SaveCoordinator,
    retention: RetentionManager,
    reporter: PathReporter,
    last_cycle: Option<CycleReport>,
}

impl FaultRecorder {
    pub fn new(
        workers: Vec<CaptureWorker>,
        saver: SaveCoordinator,
        retention: RetentionManager,
        reporter: PathReporter,
    ) -> Self {
        Self {
            workers,
            saver,
            retention,
            reporter,
            last_cycle: None,
        }
    }

    pub fn from_config(
        config: &RecorderConfig,
        opener: Arc<dyn SourceOpener>,
        encoder: Arc<dyn VideoEncoder>,
    ) -> Self {
        let capacity = config.buffer_capacity();
        let workers = config
            .cameras
            .iter()
            .map(|camera| CaptureWorker::new(camera.clone(), capacity, Arc::clone(&opener)))
            .collect();
        let retention = RetentionManager::new(
            RetentionPolicy {
                max_files: config.output.max_files,
            },
            encoder.extension(),
        );
        let saver = SaveCoordinator::new(
            config.output.root.clone(),
            encoder,
            config.video.fps,
            config.video.resolution,
        );
        let reporter = PathReporter::new(config.controller.video_path_tags.clone());
        Self::new(workers, saver, retention, reporter)
    }

    pub fn workers(&self) -> &[CaptureWorker] {
        &self.workers
    }

    pub fn last_cycle(&self) -> Option<&CycleReport> {
        self.last_cycle.as_ref()
    }

    /// Create every camera's output directory. Failure here is fatal: no
    /// clip could ever be written.
    pub fn prepare_output_dirs(&self) -> Result<()> {
        for worker in &self.workers {
            let dir = self.saver.camera_dir(worker.id());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create output directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Prepare output directories and start every capture worker. A camera
    /// that fails to open is logged by its worker and left out of saves.
    pub fn start(&mut self) -> Result<()> {
        self.prepare_output_dirs()?;
        for worker in &mut self.workers {
            log::info!("camera {}: {}", worker.id(), worker.camera().locator);
            worker.start()?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
    }

    /// Run the monitor over `controller` until shutdown or a fatal
    /// controller error. Returns the number of faults handled.
    pub fn monitor<C: Controller>(
        &mut self,
        controller: C,
        settings: MonitorSettings,
        shutdown: Arc<AtomicBool>,
    ) -> Result<u64, MonitorError> {
        let mut monitor = FaultMonitor::new(controller, settings, shutdown);
        monitor.run(self)?;
        Ok(monitor.faults_handled())
    }

    /// One full fault response: save, prune, then report newest paths.
    pub fn record(&mut self, controller: &mut dyn Controller) -> &CycleReport {
        for worker in &self.workers {
            let buffer = worker.buffer();
            log::debug!(
                "camera {} ({}): {}/{} frames buffered",
                worker.id(),
                worker.state(),
                buffer.len(),
                buffer.capacity()
            );
        }

        let saves = self.saver.save_all(&self.workers);

        let mut pruned = Vec::with_capacity(self.workers.len());
        let mut newest = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let dir = self.saver.camera_dir(worker.id());
            match self.retention.prune(&dir) {
                Ok(report) => pruned.push(report),
                Err(e) => log::error!("camera {}: retention failed: {:#}", worker.id(), e),
            }
            newest.push(self.newest_clip(&dir));
        }

        let reported = if self.reporter.is_enabled() {
            self.reporter.report(controller, &newest)
        } else {
            Vec::new()
        };

        self.last_cycle.insert(CycleReport {
            saves,
            pruned,
            newest,
            reported,
        })
    }

    fn newest_clip(&self, dir: &std::path::Path) -> Option<PathBuf> {
        match self.retention.newest(dir) {
            Ok(Some(path)) => Some(std::path::absolute(&path).unwrap_or(path)),
            Ok(None) => None,
            Err(e) => {
                log::error!("cannot list {}: {:#}", dir.display(), e);
                None
            }
        }
    }
}

impl FaultResponder for FaultRecorder {
    fn on_fault(&mut self, controller: &mut dyn Controller) {
        let saved = self.record(controller).saved_count();
        log::info!("{}/{} camera(s) saved", saved, self.workers.len());
    }
}

impl Drop for FaultRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the recorder described by `config` until `shutdown` is set or the
/// controller link fails. Cameras are stopped on every exit path.
pub fn run(config: &RecorderConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let opener: Arc<dyn SourceOpener> = Arc::new(DefaultSourceOpener::new(config.video.fps));
    let encoder: Arc<dyn VideoEncoder> = Arc::new(MjpegEncoder::new(config.video.jpeg_quality));
    let mut recorder = FaultRecorder::from_config(config, opener, encoder);
    recorder.start()?;

    let result = MqttController::connect(&config.mqtt_config())
        .map_err(MonitorError::from)
        .and_then(|controller| recorder.monitor(controller, config.monitor_settings(), shutdown));
    recorder.stop();

    let faults = result.context("fault monitor stopped")?;
    log::info!("shutdown complete after {} fault(s)", faults);
    Ok(())
}
