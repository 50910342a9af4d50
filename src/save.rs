//! Multi-camera clip saving.
//!
//! `SaveCoordinator::save_all` snapshots every camera buffer first and only
//! then starts encoding, so all clips end at the triggering edge even when
//! encoding one camera is slow. Clips land in
//! `<output_root>/<camera_id>/<YYYYMMDD_HHMMSS>.<ext>` with the timestamp in
//! UTC, so name order is chronological order even across DST changes. Saves
//! within one second get `_001`, `_002`, ... suffixes.

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::capture::{CaptureWorker, WorkerState};
use crate::encode::{EncodeRequest, VideoArtifact, VideoEncoder};
use crate::frame::{Frame, Resolution};

pub const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
/// Digits in a same-second collision suffix.
const SUFFIX_WIDTH: usize = 3;

/// UTC wall-clock source for artifact names.
pub type Clock = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// A camera buffer taken part in a save.
#[derive(Clone)]
pub struct SaveTarget {
    pub camera_id: String,
    pub frames: Vec<Frame>,
}

/// Result of saving one camera.
#[derive(Debug)]
pub enum SaveOutcome {
    Saved(VideoArtifact),
    Skipped { camera_id: String, reason: String },
    Failed { camera_id: String, error: String },
}

impl SaveOutcome {
    pub fn artifact(&self) -> Option<&VideoArtifact> {
        match self {
            SaveOutcome::Saved(artifact) => Some(artifact),
            _ => None,
        }
    }
}

pub struct SaveCoordinator {
    output_root: PathBuf,
    encoder: Arc<dyn VideoEncoder>,
    fps: u32,
    resolution: Resolution,
    clock: Clock,
}

impl SaveCoordinator {
    pub fn new(
        output_root: impl Into<PathBuf>,
        encoder: Arc<dyn VideoEncoder>,
        fps: u32,
        resolution: Resolution,
    ) -> Self {
        Self {
            output_root: output_root.into(),
            encoder,
            fps,
            resolution,
            clock: Box::new(|| Utc::now().naive_utc()),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn camera_dir(&self, camera_id: &str) -> PathBuf {
        self.output_root.join(camera_id)
    }

    pub fn extension(&self) -> &str {
        self.encoder.extension()
    }

    /// Snapshot every live camera, then encode each snapshot.
    pub fn save_all(&self, workers: &[CaptureWorker]) -> Vec<SaveOutcome> {
        let mut outcomes = Vec::new();
        let mut targets = Vec::with_capacity(workers.len());
        for worker in workers {
            match worker.state() {
                WorkerState::Failed | WorkerState::Idle => {
                    log::warn!("camera {}: {}, not saved", worker.id(), worker.state());
                    outcomes.push(SaveOutcome::Skipped {
                        camera_id: worker.id().to_string(),
                        reason: format!("camera is {}", worker.state()),
                    });
                }
                _ => targets.push(SaveTarget {
                    camera_id: worker.id().to_string(),
                    frames: worker.buffer().snapshot(),
                }),
            }
        }
        outcomes.extend(self.save_snapshots(targets));
        outcomes
    }

    /// Encode already-taken snapshots. A failure on one camera does not stop
    /// the others.
    pub fn save_snapshots(&self, targets: Vec<SaveTarget>) -> Vec<SaveOutcome> {
        let created_at = (self.clock)();
        targets
            .into_iter()
            .map(|target| self.save_one(target, created_at))
            .collect()
    }

    fn save_one(&self, target: SaveTarget, created_at: NaiveDateTime) -> SaveOutcome {
        if target.frames.is_empty() {
            log::warn!("camera {}: buffer empty, nothing to save", target.camera_id);
            return SaveOutcome::Skipped {
                camera_id: target.camera_id,
                reason: "buffer empty".to_string(),
            };
        }

        let result = self.artifact_path(&target.camera_id, created_at).and_then(|path| {
            self.encoder.encode(EncodeRequest {
                camera_id: &target.camera_id,
                frames: &target.frames,
                fps: self.fps,
                resolution: self.resolution,
                output_path: &path,
                created_at,
            })
        });

        match result {
            Ok(artifact) => {
                log::info!(
                    "camera {}: saved {} frames to {}",
                    artifact.camera_id,
                    artifact.frame_count,
                    artifact.path.display()
                );
                SaveOutcome::Saved(artifact)
            }
            Err(e) => {
                log::error!("camera {}: failed to save clip: {:#}", target.camera_id, e);
                SaveOutcome::Failed {
                    camera_id: target.camera_id,
                    error: format!("{:#}", e),
                }
            }
        }
    }

    /// Artifact path for `camera_id` that sorts after every clip already
    /// saved in the same second. The camera directory is created on demand.
    fn artifact_path(&self, camera_id: &str, created_at: NaiveDateTime) -> Result<PathBuf> {
        let dir = self.camera_dir(camera_id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        let stem = created_at.format(ARTIFACT_TIMESTAMP_FORMAT).to_string();
        let ext = self.encoder.extension();
        let name = match highest_suffix(&dir, &stem, ext)? {
            None => format!("{}.{}", stem, ext),
            // `_` sorts after `.`, so any suffix is newer than the bare stem.
            Some(n) => format!("{}_{:0width$}.{}", stem, n + 1, ext, width = SUFFIX_WIDTH),
        };
        Ok(dir.join(name))
    }
}

/// Highest collision suffix used by `<stem>*.<ext>` in `dir`; the bare stem
/// counts as 0. Names freed by retention are therefore never handed out again.
fn highest_suffix(dir: &Path, stem: &str, ext: &str) -> Result<Option<u32>> {
    let dotted_ext = format!(".{}", ext);
    let mut highest = None;
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let name = entry.with_context(|| format!("list {}", dir.display()))?.file_name();
        let Some(rest) = name
            .to_str()
            .and_then(|n| n.strip_prefix(stem))
            .and_then(|n| n.strip_suffix(dotted_ext.as_str()))
        else {
            continue;
        };
        let suffix = if rest.is_empty() {
            Some(0)
        } else {
            rest.strip_prefix('_').and_then(|n| n.parse::<u32>().ok())
        };
        highest = highest.max(suffix);
    }
    Ok(highest)
}
