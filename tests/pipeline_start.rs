#![cfg(unix)]

use std::os::unix::fs::FileTypeExt;
use std::time::Duration;

use detect_bridge::pipeline::fifo_path;
use detect_bridge::trigger;
use detect_bridge::{
    error_kind, BridgeConfig, CancelToken, DetectorSpec, DetectorTable, ErrorKind, FrameSize,
    MonitorConfig, MonitorInput, Pipeline, TaskGroup,
};

fn bridge(shm: &std::path::Path) -> BridgeConfig {
    BridgeConfig {
        // Exits immediately, so the supervisor keeps restarting it.
        ffmpeg_bin: "true".to_string(),
        detector_addr: "127.0.0.1:1".to_string(),
        shm_dir: shm.to_path_buf(),
        restart_backoff: Duration::from_millis(20),
        ..BridgeConfig::default()
    }
}

fn detectors() -> DetectorTable {
    DetectorTable::from_specs(vec![DetectorSpec {
        name: "default".to_string(),
        kind: "tflite".to_string(),
        labels: vec!["person".to_string()],
        width: 300,
        height: 300,
        channels: 3,
        ..DetectorSpec::default()
    }])
}

fn input<const N: usize>(pairs: [(&str, &str); N]) -> MonitorInput {
    MonitorInput {
        config: MonitorConfig::from(pairs),
        size: FrameSize {
            width: 640,
            height: 480,
        },
        is_sub_stream: false,
    }
}

#[test]
fn starts_enabled_monitor_and_stops_on_cancel() {
    let shm = tempfile::tempdir().expect("shm dir");
    let (tx, _rx) = trigger::channel(4);
    let cancel = CancelToken::new();
    let group = TaskGroup::new();

    let pipeline = Pipeline::start(
        &bridge(shm.path()),
        &detectors(),
        &input([
            ("id", "cam1"),
            ("detectEnable", "true"),
            ("detectDetectorName", "default"),
            ("detectThresholds", r#"{"person":50}"#),
            ("detectFeedRate", "1"),
            (
                "detectMask",
                r#"{"enable":true,"area":[[0,0],[50,0],[50,50],[0,50]]}"#,
            ),
        ]),
        tx,
        &cancel,
        &group,
    )
    .expect("start pipeline")
    .expect("detection enabled");

    let fifo = fifo_path(shm.path(), "cam1");
    assert_eq!(pipeline.fifo, fifo);
    let meta = std::fs::symlink_metadata(&fifo).expect("fifo exists");
    assert!(meta.file_type().is_fifo());

    let mask = pipeline.mask.clone().expect("mask written");
    let img = image::open(&mask).expect("mask png");
    assert_eq!(
        (img.width(), img.height()),
        (pipeline.geometry.scaled_width, pipeline.geometry.scaled_height)
    );

    assert!(pipeline.args.iter().any(|a| a == "-filter_complex"));
    assert_eq!(pipeline.args.last().map(String::as_str), Some("-"));
    assert_eq!(
        pipeline.fifo_output_args().last(),
        Some(&fifo.display().to_string())
    );
    assert_eq!(pipeline.config.sample_interval, Duration::from_secs(1));

    std::thread::sleep(Duration::from_millis(100));
    cancel.cancel();
    assert!(group.wait_timeout(Duration::from_secs(5)));
    pipeline.join();
}

#[test]
fn disabled_monitor_is_a_no_op() {
    let shm = tempfile::tempdir().expect("shm dir");
    let (tx, _rx) = trigger::channel(1);
    let group = TaskGroup::new();

    let started = Pipeline::start(
        &bridge(shm.path()),
        &detectors(),
        &input([("id", "cam1"), ("detectEnable", "false")]),
        tx,
        &CancelToken::new(),
        &group,
    )
    .expect("no error");

    assert!(started.is_none());
    assert!(!fifo_path(shm.path(), "cam1").exists());
    assert_eq!(group.active(), 0);
}

#[test]
fn invalid_configuration_never_starts_tasks() {
    let shm = tempfile::tempdir().expect("shm dir");
    let group = TaskGroup::new();

    let cases = [
        input([
            ("id", "cam1"),
            ("detectEnable", "true"),
            ("detectDetectorName", "missing"),
        ]),
        input([
            ("id", "cam1"),
            ("detectEnable", "true"),
            ("detectDetectorName", "default"),
            ("detectThresholds", "nil"),
        ]),
        MonitorInput {
            size: FrameSize {
                width: 200,
                height: 200,
            },
            ..input([
                ("id", "cam1"),
                ("detectEnable", "true"),
                ("detectDetectorName", "default"),
            ])
        },
    ];
    for case in cases {
        let (tx, _rx) = trigger::channel(1);
        let err = Pipeline::start(
            &bridge(shm.path()),
            &detectors(),
            &case,
            tx,
            &CancelToken::new(),
            &group,
        )
        .err()
        .expect("invalid configuration");
        assert_eq!(error_kind(&err), Some(ErrorKind::InvalidConfiguration));
    }
    assert_eq!(group.active(), 0);
    assert!(!fifo_path(shm.path(), "cam1").exists());
}
