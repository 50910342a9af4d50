use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::controller::{parse_bool_payload, MqttControllerConfig};
use crate::frame::Resolution;
use crate::ingest::{CameraSource, Locator};
use crate::monitor::{MonitorSettings, RetryPolicy};

const DEFAULT_CONTROLLER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_FAULT_TAG: &str = "fault_detected";
const DEFAULT_POLL_RATE_SECS: f64 = 1.0;
const DEFAULT_READ_TIMEOUT_SECS: f64 = 2.0;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_VIDEO_LENGTH_SECS: u32 = 15;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_OUTPUT_ROOT: &str = "output";
const DEFAULT_MAX_FILES: usize = 50;
const DEFAULT_LOG_RETENTION_COUNT: usize = 3;
const DEFAULT_LOG_MAX_BYTES: u64 = 10_000;
const DEFAULT_CAMERA_ID: &str = "0";
const DEFAULT_CAMERA_LOCATOR: &str = "stub://camera0";

pub const CONFIG_ENV: &str = "FAULT_VIDEO_CONFIG";

#[derive(Debug, Deserialize, Default)]
struct RecorderConfigFile {
    controller: Option<ControllerConfigFile>,
    video: Option<VideoConfigFile>,
    output: Option<OutputConfigFile>,
    log: Option<LogConfigFile>,
    cameras: Option<BTreeMap<String, LocatorValue>>,
}

#[derive(Debug, Deserialize, Default)]
struct ControllerConfigFile {
    address: Option<String>,
    slot: Option<u32>,
    topic_prefix: Option<String>,
    fault_tag: Option<String>,
    poll_rate_secs: Option<f64>,
    acknowledge: Option<bool>,
    read_timeout_secs: Option<f64>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    video_path_tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    length_secs: Option<u32>,
    fps: Option<u32>,
    buffer_frames: Option<usize>,
    resolution: Option<(u32, u32)>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    root: Option<PathBuf>,
    max_files: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct LogConfigFile {
    retention_count: Option<usize>,
    max_bytes: Option<u64>,
    level: Option<String>,
}

/// A camera locator as written in the config: a device index or a URI.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LocatorValue {
    Index(u32),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub controller: ControllerSettings,
    pub video: VideoSettings,
    /// Cameras in id order.
    pub cameras: Vec<CameraSource>,
    pub output: OutputSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub address: String,
    pub slot: u32,
    pub topic_prefix: Option<String>,
    pub fault_tag: String,
    pub poll_rate: Duration,
    pub acknowledge: bool,
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Tag `i` receives the newest clip path of camera `i`.
    pub video_path_tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub length_secs: u32,
    pub fps: u32,
    pub buffer_frames: Option<usize>,
    pub resolution: Resolution,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub root: PathBuf,
    pub max_files: usize,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub retention_count: usize,
    pub max_bytes: u64,
    pub level: Option<String>,
}

impl RecorderConfig {
    /// Load from `path`, or from `$FAULT_VIDEO_CONFIG` when `path` is `None`,
    /// then apply environment overrides and validate. Without any config file
    /// every setting takes its default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse TOML config text without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: RecorderConfigFile =
            toml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let mut cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RecorderConfigFile) -> Result<Self> {
        let ctl = file.controller.unwrap_or_default();
        let controller = ControllerSettings {
            address: ctl
                .address
                .unwrap_or_else(|| DEFAULT_CONTROLLER_ADDR.to_string()),
            slot: ctl.slot.unwrap_or(0),
            topic_prefix: ctl.topic_prefix,
            fault_tag: ctl
                .fault_tag
                .unwrap_or_else(|| DEFAULT_FAULT_TAG.to_string()),
            poll_rate: secs(
                "controller.poll_rate_secs",
                ctl.poll_rate_secs,
                DEFAULT_POLL_RATE_SECS,
            )?,
            acknowledge: ctl.acknowledge.unwrap_or(true),
            read_timeout: secs(
                "controller.read_timeout_secs",
                ctl.read_timeout_secs,
                DEFAULT_READ_TIMEOUT_SECS,
            )?,
            max_retries: ctl.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_backoff: Duration::from_millis(
                ctl.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
            ),
            video_path_tags: ctl.video_path_tags.unwrap_or_default(),
        };

        let vid = file.video.unwrap_or_default();
        let (width, height) = vid.resolution.unwrap_or((DEFAULT_WIDTH, DEFAULT_HEIGHT));
        let video = VideoSettings {
            length_secs: vid.length_secs.unwrap_or(DEFAULT_VIDEO_LENGTH_SECS),
            fps: vid.fps.unwrap_or(DEFAULT_FPS),
            buffer_frames: vid.buffer_frames,
            resolution: Resolution::new(width, height),
            jpeg_quality: vid.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let out = file.output.unwrap_or_default();
        let output = OutputSettings {
            root: out
                .root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_ROOT)),
            max_files: out.max_files.unwrap_or(DEFAULT_MAX_FILES),
        };

        let log_cfg = file.log.unwrap_or_default();
        let log = LogSettings {
            retention_count: log_cfg
                .retention_count
                .unwrap_or(DEFAULT_LOG_RETENTION_COUNT),
            max_bytes: log_cfg.max_bytes.unwrap_or(DEFAULT_LOG_MAX_BYTES),
            level: log_cfg.level,
        };

        let camera_table = file.cameras.unwrap_or_else(|| {
            BTreeMap::from([(
                DEFAULT_CAMERA_ID.to_string(),
                LocatorValue::Text(DEFAULT_CAMERA_LOCATOR.to_string()),
            )])
        });
        let cameras = camera_table
            .into_iter()
            .map(|(id, value)| {
                let locator = match value {
                    LocatorValue::Index(index) => Locator::Device(index),
                    LocatorValue::Text(text) => Locator::parse(&text)
                        .map_err(|e| anyhow!("camera {}: {}", id, e))?,
                };
                Ok(CameraSource {
                    id,
                    locator,
                    resolution: video.resolution,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            controller,
            video,
            cameras,
            output,
            log,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("FAULT_VIDEO_CONTROLLER_ADDR") {
            if !addr.trim().is_empty() {
                self.controller.address = addr;
            }
        }
        if let Ok(tag) = std::env::var("FAULT_VIDEO_FAULT_TAG") {
            if !tag.trim().is_empty() {
                self.controller.fault_tag = tag;
            }
        }
        if let Ok(rate) = std::env::var("FAULT_VIDEO_POLL_RATE_SECS") {
            let value: f64 = rate
                .parse()
                .map_err(|_| anyhow!("FAULT_VIDEO_POLL_RATE_SECS must be a number of seconds"))?;
            self.controller.poll_rate = secs("FAULT_VIDEO_POLL_RATE_SECS", Some(value), 0.0)?;
        }
        if let Ok(ack) = std::env::var("FAULT_VIDEO_ACKNOWLEDGE") {
            self.controller.acknowledge = parse_bool_payload(ack.as_bytes())
                .ok_or_else(|| anyhow!("FAULT_VIDEO_ACKNOWLEDGE must be true or false"))?;
        }
        if let Ok(max_files) = std::env::var("FAULT_VIDEO_MAX_FILES") {
            self.output.max_files = max_files
                .parse()
                .map_err(|_| anyhow!("FAULT_VIDEO_MAX_FILES must be a non-negative integer"))?;
        }
        if let Ok(root) = std::env::var("FAULT_VIDEO_OUTPUT_ROOT") {
            if !root.trim().is_empty() {
                self.output.root = PathBuf::from(root);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        for camera in &self.cameras {
            validate_camera_id(&camera.id)?;
        }
        if self.controller.fault_tag.trim().is_empty() {
            return Err(anyhow!("controller.fault_tag must not be empty"));
        }
        if self.controller.poll_rate.is_zero() {
            return Err(anyhow!("controller.poll_rate_secs must be greater than zero"));
        }
        if self.video.fps == 0 {
            return Err(anyhow!("video.fps must be greater than zero"));
        }
        if self.buffer_capacity() == 0 {
            return Err(anyhow!("video buffer must hold at least one frame"));
        }
        if self.video.resolution.width == 0 || self.video.resolution.height == 0 {
            return Err(anyhow!("video.resolution must be non-zero"));
        }
        if self.controller.video_path_tags.len() > self.cameras.len() {
            return Err(anyhow!(
                "{} video path tags configured for {} camera(s)",
                self.controller.video_path_tags.len(),
                self.cameras.len()
            ));
        }
        Ok(())
    }

    /// Frames kept per camera: `buffer_frames` if set, else `length_secs * fps`.
    pub fn buffer_capacity(&self) -> usize {
        self.video
            .buffer_frames
            .unwrap_or(self.video.length_secs as usize * self.video.fps as usize)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            fault_tag: self.controller.fault_tag.clone(),
            poll_interval: self.controller.poll_rate,
            acknowledge: self.controller.acknowledge,
            retry: RetryPolicy {
                max_retries: self.controller.max_retries,
                initial_backoff: self.controller.retry_backoff,
                max_backoff: MAX_RETRY_BACKOFF.max(self.controller.retry_backoff),
            },
        }
    }

    pub fn mqtt_config(&self) -> MqttControllerConfig {
        MqttControllerConfig {
            address: self.controller.address.clone(),
            slot: self.controller.slot,
            topic_prefix: self.controller.topic_prefix.clone(),
            read_timeout: self.controller.read_timeout,
            ..MqttControllerConfig::default()
        }
    }

    /// Log the effective configuration at debug level.
    pub fn log_summary(&self) {
        log::debug!("controller {} slot {}", self.controller.address, self.controller.slot);
        log::debug!("fault tag {}", self.controller.fault_tag);
        log::debug!("poll rate {:?}", self.controller.poll_rate);
        log::debug!(
            "video length {}s at {} fps ({} frames)",
            self.video.length_secs,
            self.video.fps,
            self.buffer_capacity()
        );
        log::debug!("resolution {}", self.video.resolution);
        log::debug!("acknowledge flag {}", self.controller.acknowledge);
        log::debug!("max files {}", self.output.max_files);
        if !self.controller.video_path_tags.is_empty() {
            log::debug!("video path tags {}", self.controller.video_path_tags.join(","));
        }
    }
}

fn read_config_file(path: &Path) -> Result<RecorderConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn secs(field: &str, value: Option<f64>, default: f64) -> Result<Duration> {
    let value = value.unwrap_or(default);
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds", field))
}

/// Camera ids name output directories, so each must be one plain path component.
fn validate_camera_id(id: &str) -> Result<()> {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !id.contains(['/', '\\']) => Ok(()),
        _ => Err(anyhow!("camera id '{}' is not a valid directory name", id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file() -> Result<()> {
        let cfg = RecorderConfig::from_toml_str("")?;
        assert_eq!(cfg.controller.fault_tag, "fault_detected");
        assert_eq!(cfg.controller.poll_rate, Duration::from_secs(1));
        assert!(cfg.controller.acknowledge);
        assert_eq!(cfg.buffer_capacity(), 450);
        assert_eq!(cfg.output.max_files, 50);
        assert_eq!(cfg.log.retention_count, 3);
        assert_eq!(cfg.cameras.len(), 1);
        assert_eq!(cfg.cameras[0].locator, Locator::Uri("stub://camera0".into()));
        Ok(())
    }

    #[test]
    fn cameras_accept_indices_and_uris_in_id_order() -> Result<()> {
        let cfg = RecorderConfig::from_toml_str(
            r#"
            [video]
            resolution = [1280, 720]

            [cameras]
            1 = "rtsp://192.168.1.91/streaming/channels/1"
            0 = 1
            "#,
        )?;
        let ids: Vec<&str> = cfg.cameras.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1"]);
        assert_eq!(cfg.cameras[0].locator, Locator::Device(1));
        assert_eq!(
            cfg.cameras[1].locator,
            Locator::Uri("rtsp://192.168.1.91/streaming/channels/1".into())
        );
        assert_eq!(cfg.cameras[1].resolution, Resolution::new(1280, 720));
        Ok(())
    }

    #[test]
    fn buffer_frames_overrides_length() -> Result<()> {
        let cfg =
            RecorderConfig::from_toml_str("[video]\nlength_secs = 10\nbuffer_frames = 300\n")?;
        assert_eq!(cfg.buffer_capacity(), 300);
        Ok(())
    }

    #[test]
    fn rejects_invalid_settings() {
        for raw in [
            "[cameras]\n",
            "[cameras]\n\"../etc\" = 0\n",
            "[controller]\npoll_rate_secs = 0.0\n",
            "[controller]\npoll_rate_secs = -1.0\n",
            "[video]\nfps = 0\n",
            "[video]\nlength_secs = 0\n",
            "[controller]\nvideo_path_tags = [\"a\", \"b\"]\n",
        ] {
            assert!(RecorderConfig::from_toml_str(raw).is_err(), "accepted: {raw}");
        }
    }

    #[test]
    fn monitor_settings_follow_controller_section() -> Result<()> {
        let cfg = RecorderConfig::from_toml_str(
            "[controller]\nacknowledge = false\nmax_retries = 0\npoll_rate_secs = 0.5\n",
        )?;
        let settings = cfg.monitor_settings();
        assert!(!settings.acknowledge);
        assert_eq!(settings.retry.max_retries, 0);
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        Ok(())
    }

    #[test]
    fn camera_ids_must_be_single_components() {
        assert!(validate_camera_id("press_1").is_ok());
        assert!(validate_camera_id("0").is_ok());
        assert!(validate_camera_id("").is_err());
        assert!(validate_camera_id("..").is_err());
        assert!(validate_camera_id("a/b").is_err());
        assert!(validate_camera_id("/abs").is_err());
    }
}
