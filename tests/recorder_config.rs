use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use fault_video::config::CONFIG_ENV;
use fault_video::{Locator, RecorderConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        CONFIG_ENV,
        "FAULT_VIDEO_CONTROLLER_ADDR",
        "FAULT_VIDEO_FAULT_TAG",
        "FAULT_VIDEO_POLL_RATE_SECS",
        "FAULT_VIDEO_ACKNOWLEDGE",
        "FAULT_VIDEO_MAX_FILES",
        "FAULT_VIDEO_OUTPUT_ROOT",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_toml_from_env_path_with_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(
        br#"
        [controller]
        address = "10.0.0.5:1883"
        slot = 1
        fault_tag = "Camera_Trigger"
        poll_rate_secs = 0.25
        video_path_tags = ["Cam0_Path", "Cam1_Path"]

        [video]
        length_secs = 10
        fps = 20

        [output]
        root = "/var/lib/fault_video"
        max_files = 20

        [cameras]
        0 = 0
        1 = "rtsp://192.168.1.91/streaming/channels/1"
        "#,
    )
    .expect("write config");

    std::env::set_var(CONFIG_ENV, file.path());
    std::env::set_var("FAULT_VIDEO_FAULT_TAG", "Line4_Fault");
    std::env::set_var("FAULT_VIDEO_ACKNOWLEDGE", "false");
    std::env::set_var("FAULT_VIDEO_MAX_FILES", "5");

    let cfg = RecorderConfig::load(None).expect("load config");

    assert_eq!(cfg.controller.address, "10.0.0.5:1883");
    assert_eq!(cfg.controller.slot, 1);
    assert_eq!(cfg.controller.fault_tag, "Line4_Fault");
    assert_eq!(cfg.controller.poll_rate, Duration::from_millis(250));
    assert!(!cfg.controller.acknowledge);
    assert_eq!(cfg.controller.video_path_tags, vec!["Cam0_Path", "Cam1_Path"]);
    assert_eq!(cfg.buffer_capacity(), 200);
    assert_eq!(cfg.output.root, PathBuf::from("/var/lib/fault_video"));
    assert_eq!(cfg.output.max_files, 5);
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].locator, Locator::Device(0));
    assert_eq!(cfg.mqtt_config().prefix(), "plc/1");

    clear_env();
}

#[test]
fn explicit_path_reads_json() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    file.write_all(
        br#"{
            "controller": { "acknowledge": false, "max_retries": 0 },
            "cameras": { "press": "stub://press?fps=15" }
        }"#,
    )
    .expect("write config");

    let cfg = RecorderConfig::load(Some(file.path())).expect("load config");

    assert!(!cfg.controller.acknowledge);
    assert_eq!(cfg.monitor_settings().retry.max_retries, 0);
    assert_eq!(cfg.cameras[0].id, "press");
    assert_eq!(cfg.cameras[0].locator, Locator::Uri("stub://press?fps=15".into()));

    clear_env();
}

#[test]
fn invalid_env_override_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FAULT_VIDEO_POLL_RATE_SECS", "fast");
    assert!(RecorderConfig::load(None).is_err());
    std::env::set_var("FAULT_VIDEO_POLL_RATE_SECS", "0");
    assert!(RecorderConfig::load(None).is_err());

    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = RecorderConfig::load(Some(std::path::Path::new("/nonexistent/fault_video.toml")))
        .unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}
