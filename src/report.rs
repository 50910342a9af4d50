//! Write the newest clip paths back to controller tags.
//!
//! Tag `i` receives the newest clip of camera `i` (camera order is the
//! configured order). A camera without a clip leaves its tag untouched. Write
//! failures are logged per tag and never abort the fault cycle.

use std::path::PathBuf;

use crate::controller::Controller;

#[derive(Clone, Debug, Default)]
pub struct PathReporter {
    tags: Vec<String>,
}

/// What happened to one path tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReportOutcome {
    Written { tag: String, path: String },
    NoClip { tag: String },
    Failed { tag: String, error: String },
}

impl PathReporter {
    pub fn new(tags: Vec<String>) -> Self {
        Self { tags }
    }

    pub fn is_enabled(&self) -> bool {
        !self.tags.is_empty()
    }

    /// `newest_paths[i]` is camera `i`'s newest clip, if any. Extra cameras
    /// beyond the configured tags are ignored.
    pub fn report(
        &self,
        controller: &mut dyn Controller,
        newest_paths: &[Option<PathBuf>],
    ) -> Vec<ReportOutcome> {
        self.tags
            .iter()
            .zip(newest_paths)
            .map(|(tag, path)| {
                let Some(path) = path else {
                    return ReportOutcome::NoClip { tag: tag.clone() };
                };
                let path = path.display().to_string();
                match controller.write_string(tag, &path) {
                    Ok(()) => {
                        log::debug!("path tag {} <- {}", tag, path);
                        ReportOutcome::Written {
                            tag: tag.clone(),
                            path,
                        }
                    }
                    Err(e) => {
                        log::error!("failed to write path tag {}: {}", tag, e);
                        ReportOutcome::Failed {
                            tag: tag.clone(),
                            error: e.to_string(),
                        }
                    }
                }
            })
            .collect()
    }
}
