use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use detect_bridge::config::BridgeConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "DETECT_BRIDGE_CONFIG",
        "DETECT_BRIDGE_DETECTOR_ADDR",
        "DETECT_BRIDGE_FFMPEG",
        "DETECT_BRIDGE_SHM_DIR",
        "DETECT_BRIDGE_RESTART_BACKOFF_MS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "detector": {
            "addr": "10.0.0.5:8080",
            "connect_timeout_ms": 1500
        },
        "ffmpeg_bin": "/usr/bin/ffmpeg",
        "shm_dir": "/dev/shm/nvr",
        "restart_backoff_ms": 250,
        "event_queue": 4
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("DETECT_BRIDGE_CONFIG", file.path());
    std::env::set_var("DETECT_BRIDGE_DETECTOR_ADDR", "10.0.0.9:8080");
    std::env::set_var("DETECT_BRIDGE_SHM_DIR", "/tmp/detect");

    let cfg = BridgeConfig::load().expect("load config");

    assert_eq!(cfg.detector_addr, "10.0.0.9:8080");
    assert_eq!(cfg.detectors_url, "http://10.0.0.9:8080/detectors");
    assert_eq!(cfg.connect_timeout, Duration::from_millis(1500));
    assert_eq!(cfg.ffmpeg_bin, "/usr/bin/ffmpeg");
    assert_eq!(cfg.shm_dir.to_str(), Some("/tmp/detect"));
    assert_eq!(cfg.restart_backoff, Duration::from_millis(250));
    assert_eq!(cfg.event_queue, 4);

    clear_env();
}

#[test]
fn explicit_detectors_url_survives_address_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{"detector": {"addr": "a:1", "detectors_url": "http://lister/detectors"}}"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("DETECT_BRIDGE_DETECTOR_ADDR", "b:2");

    let cfg = BridgeConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.detector_addr, "b:2");
    assert_eq!(cfg.detectors_url, "http://lister/detectors");

    clear_env();
}

#[test]
fn rejects_invalid_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for json in [
        r#"{"detector": {"addr": " "}}"#,
        r#"{"event_queue": 0}"#,
        r#"{"detector": {"connect_timeout_ms": 0}}"#,
        r#"{"event_queue": "many"}"#,
    ] {
        let mut file = NamedTempFile::new().expect("temp config");
        std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
        assert!(
            BridgeConfig::load_from(Some(file.path())).is_err(),
            "accepted {}",
            json
        );
    }

    std::env::set_var("DETECT_BRIDGE_RESTART_BACKOFF_MS", "soon");
    assert!(BridgeConfig::load_from(None).is_err());

    clear_env();
}

#[test]
fn generates_missing_config_with_owner_only_permissions() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("conf/detect-bridge.json");

    let cfg = BridgeConfig::load_or_generate(&path).expect("generate config");
    assert_eq!(cfg.detector_addr, "127.0.0.1:8080");
    assert!(path.exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // An existing file is read, not regenerated.
    std::fs::write(&path, r#"{"detector": {"addr": "10.1.1.1:9000"}}"#).expect("edit config");
    let cfg = BridgeConfig::load_or_generate(&path).expect("reload config");
    assert_eq!(cfg.detector_addr, "10.1.1.1:9000");

    clear_env();
}
