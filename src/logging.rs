//! Logger setup: every record goes to stderr and to a size-rotated file.
//!
//! The file sink keeps `<name>`, `<name>.1` ... `<name>.<backups>`; `.1` is
//! the most recent backup. With zero backups the file is truncated in place.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::LogSettings;

pub const LOG_FILE_NAME: &str = "fault_monitor.log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A log file that rolls over once it would grow past `max_bytes`.
pub struct RotatingFileWriter {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RotatingFileWriter {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups == 0 {
            self.file = File::create(&self.path)?;
        } else {
            for index in (1..self.backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
            self.file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
        }
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0
            && self.written > 0
            && self.written + buf.len() as u64 > self.max_bytes
        {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Copies every record to stderr before writing it to the file.
struct TeeWriter {
    file: RotatingFileWriter,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.file.flush()
    }
}

/// Install the global logger. `RUST_LOG` wins over `level_override`, which
/// wins over the configured level; the fallback is `info`.
pub fn init(
    settings: &LogSettings,
    log_dir: &Path,
    level_override: Option<&str>,
) -> Result<PathBuf> {
    let path = log_dir.join(LOG_FILE_NAME);
    let file = RotatingFileWriter::open(&path, settings.max_bytes, settings.retention_count)
        .with_context(|| format!("cannot open log file {}", path.display()))?;
    let level = level_override
        .or(settings.level.as_deref())
        .unwrap_or("info");

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{}  {}: {}",
                Local::now().format(TIMESTAMP_FORMAT),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
        .try_init()
        .map_err(|e| anyhow!("logger already installed: {}", e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rotates_into_numbered_backups() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("x.log");
        let mut writer = RotatingFileWriter::open(&path, 10, 2)?;
        for line in ["aaaaaaaa\n", "bbbbbbbb\n", "cccccccc\n", "dddddddd\n"] {
            writer.write_all(line.as_bytes())?;
        }
        writer.flush()?;

        assert_eq!(fs::read_to_string(&path)?, "dddddddd\n");
        assert_eq!(fs::read_to_string(dir.path().join("x.log.1"))?, "cccccccc\n");
        assert_eq!(fs::read_to_string(dir.path().join("x.log.2"))?, "bbbbbbbb\n");
        assert!(!dir.path().join("x.log.3").exists());
        Ok(())
    }

    #[test]
    fn zero_backups_truncates() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("x.log");
        let mut writer = RotatingFileWriter::open(&path, 10, 0)?;
        writer.write_all(b"aaaaaaaa\n")?;
        writer.write_all(b"bbbbbbbb\n")?;
        writer.flush()?;
        assert_eq!(fs::read_to_string(&path)?, "bbbbbbbb\n");
        assert!(!dir.path().join("x.log.1").exists());
        Ok(())
    }

    #[test]
    fn reopening_counts_existing_bytes() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("x.log");
        {
            let mut writer = RotatingFileWriter::open(&path, 10, 1)?;
            writer.write_all(b"aaaaaaaa\n")?;
        }
        let mut writer = RotatingFileWriter::open(&path, 10, 1)?;
        writer.write_all(b"bbbbbbbb\n")?;
        writer.flush()?;
        assert_eq!(fs::read_to_string(writer.path())?, "bbbbbbbb\n");
        let backup = dir.path().join("nested").join("x.log.1");
        assert_eq!(fs::read_to_string(backup)?, "aaaaaaaa\n");
        Ok(())
    }
}
