//! Saved-clip retention.
//!
//! Clip names are zero-padded timestamps, so a descending name sort is a
//! newest-first sort. Pruning keeps the first `max_files` names and deletes
//! the rest; it never consults filesystem timestamps.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_files: usize,
}

/// What one `prune` call did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub kept: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct RetentionManager {
    policy: RetentionPolicy,
    extension: String,
}

impl RetentionManager {
    pub fn new(policy: RetentionPolicy, extension: impl Into<String>) -> Self {
        Self {
            policy,
            extension: extension.into(),
        }
    }

    /// Clips in `camera_dir`, newest first. A missing directory has no clips.
    pub fn list_artifacts(&self, camera_dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(camera_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("list {}", camera_dir.display()));
            }
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("list {}", camera_dir.display()))?;
            let path = entry.path();
            let matches_ext = path
                .extension()
                .is_some_and(|ext| ext == self.extension.as_str());
            if matches_ext && path.is_file() {
                artifacts.push(path);
            }
        }
        artifacts.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        Ok(artifacts)
    }

    /// Newest clip in `camera_dir`, if any.
    pub fn newest(&self, camera_dir: &Path) -> Result<Option<PathBuf>> {
        Ok(self.list_artifacts(camera_dir)?.into_iter().next())
    }

    /// Delete all but the newest `max_files` clips. Per-file delete failures
    /// are logged and recorded; pruning continues with the next file.
    pub fn prune(&self, camera_dir: &Path) -> Result<PruneReport> {
        let mut artifacts = self.list_artifacts(camera_dir)?;
        let excess = if artifacts.len() > self.policy.max_files {
            artifacts.split_off(self.policy.max_files)
        } else {
            Vec::new()
        };

        let mut report = PruneReport {
            kept: artifacts,
            ..PruneReport::default()
        };
        for path in excess {
            match fs::remove_file(&path) {
                Ok(()) => {
                    log::debug!("retention: deleted {}", path.display());
                    report.deleted.push(path);
                }
                Err(e) => {
                    log::error!("retention: failed to delete {}: {}", path.display(), e);
                    report.failed.push(path);
                }
            }
        }
        if !report.deleted.is_empty() {
            log::info!(
                "retention: pruned {} clip(s) from {}",
                report.deleted.len(),
                camera_dir.display()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"clip").unwrap();
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn keeps_two_most_recent_per_camera() -> Result<()> {
        let root = TempDir::new()?;
        let manager = RetentionManager::new(RetentionPolicy { max_files: 2 }, "mjpeg");

        for camera in ["0", "1"] {
            let dir = root.path().join(camera);
            fs::create_dir_all(&dir)?;
            for stem in ["20240101_000000", "20240101_010000", "20240101_020000"] {
                touch(&dir, &format!("{}.mjpeg", stem));
            }

            let report = manager.prune(&dir)?;
            assert_eq!(
                names(&report.kept),
                vec!["20240101_020000.mjpeg", "20240101_010000.mjpeg"]
            );
            assert_eq!(names(&report.deleted), vec!["20240101_000000.mjpeg"]);
            assert!(!dir.join("20240101_000000.mjpeg").exists());
        }
        Ok(())
    }

    #[test]
    fn keeps_k_lexicographically_greatest() -> Result<()> {
        let dir = TempDir::new()?;
        let stems = [
            "20231231_235959",
            "20240102_000000",
            "20240101_120000",
            "20240101_120000_1",
            "20240315_080000",
            "20240101_000001",
        ];
        for stem in stems {
            touch(dir.path(), &format!("{}.mjpeg", stem));
        }

        let manager = RetentionManager::new(RetentionPolicy { max_files: 3 }, "mjpeg");
        let report = manager.prune(dir.path())?;

        let mut sorted: Vec<String> = stems.iter().map(|s| format!("{}.mjpeg", s)).collect();
        sorted.sort();
        sorted.reverse();
        assert_eq!(names(&report.kept), sorted[..3].to_vec());
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(manager.list_artifacts(dir.path())?.len(), 3);
        Ok(())
    }

    #[test]
    fn ignores_other_extensions_and_partials() -> Result<()> {
        let dir = TempDir::new()?;
        touch(dir.path(), "20240101_000000.mjpeg");
        touch(dir.path(), "20240101_010000.mjpeg.partial");
        touch(dir.path(), "notes.txt");

        let manager = RetentionManager::new(RetentionPolicy { max_files: 0 }, "mjpeg");
        let report = manager.prune(dir.path())?;

        assert_eq!(names(&report.deleted), vec!["20240101_000000.mjpeg"]);
        assert!(dir.path().join("20240101_010000.mjpeg.partial").exists());
        assert!(dir.path().join("notes.txt").exists());
        Ok(())
    }

    #[test]
    fn missing_directory_is_empty() -> Result<()> {
        let root = TempDir::new()?;
        let manager = RetentionManager::new(RetentionPolicy { max_files: 2 }, "mjpeg");
        let missing = root.path().join("nope");
        assert_eq!(manager.prune(&missing)?, PruneReport::default());
        assert_eq!(manager.newest(&missing)?, None);
        Ok(())
    }

    #[test]
    fn newest_is_greatest_name() -> Result<()> {
        let dir = TempDir::new()?;
        touch(dir.path(), "20240101_000000.mjpeg");
        touch(dir.path(), "20240101_000000_1.mjpeg");
        let manager = RetentionManager::new(RetentionPolicy { max_files: 5 }, "mjpeg");
        assert_eq!(
            manager.newest(dir.path())?,
            Some(dir.path().join("20240101_000000_1.mjpeg"))
        );
        Ok(())
    }
}
