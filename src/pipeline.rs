//! Wiring of one detection pipeline instance.
//!
//! A pipeline is started for every input stream of a monitor. It only runs
//! when detection is enabled and the stream matches the monitor's main/sub
//! stream preference.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::client::DetectionClient;
use crate::config::BridgeConfig;
use crate::detector::DetectorTable;
use crate::ffmpeg::{self, FilterSettings};
use crate::geometry::{self, FrameGeometry, FrameGeometryInput, FrameSize};
use crate::mask;
use crate::monitor::{MonitorConfig, PipelineConfig};
use crate::rpc::{Connector, TcpConnector};
use crate::source::{FfmpegRunner, FrameSupervisor};
use crate::supervise::{CancelToken, TaskGroup};
use crate::trigger::{TriggerFilter, TriggerSender};
use crate::PipelineError;

/// What the monitor knows about one of its input streams.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitorInput {
    pub config: MonitorConfig,
    /// Decoded size of this stream.
    pub size: FrameSize,
    pub is_sub_stream: bool,
}

impl MonitorInput {
    /// True when detection should read from this stream.
    pub fn should_run(&self) -> bool {
        self.config.detection_enabled() && self.is_sub_stream == self.config.use_sub_stream()
    }
}

/// Named pipe the monitor copies its stream into.
pub fn fifo_path(shm_dir: &Path, monitor_id: &str) -> PathBuf {
    shm_dir.join("detect").join(monitor_id).join("main.fifo")
}

pub fn mask_path(shm_dir: &Path, monitor_id: &str) -> PathBuf {
    shm_dir.join("detect").join(format!("{}_mask.png", monitor_id))
}

/// A running pipeline instance.
pub struct Pipeline {
    pub config: PipelineConfig,
    pub geometry: FrameGeometry,
    pub fifo: PathBuf,
    pub mask: Option<PathBuf>,
    /// Transcoder arguments, without the binary.
    pub args: Vec<String>,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

impl Pipeline {
    /// Validates the monitor's settings, prepares the pipe and mask, and
    /// starts the frame source supervisor.
    ///
    /// Returns `Ok(None)` when this stream should not run detection. Any
    /// configuration problem fails before a task is started.
    pub fn start(
        bridge: &BridgeConfig,
        detectors: &DetectorTable,
        input: &MonitorInput,
        trigger: TriggerSender,
        cancel: &CancelToken,
        group: &TaskGroup,
    ) -> Result<Option<Self>> {
        if !input.should_run() {
            return Ok(None);
        }
        let config = PipelineConfig::parse(&input.config, &bridge.detector_addr)?;
        let id = config.monitor_id.clone();
        if id.is_empty() {
            return Err(PipelineError::invalid_config("monitor id must not be empty").into());
        }

        let detector = detectors.by_name(&config.detector_name)?;
        let (output_width, output_height) = detector.input_size()?;

        let geometry = geometry::calculate(&FrameGeometryInput::new(
            input.size,
            config.crop,
            output_width,
            output_height,
        ))
        .with_context(|| format!("{}: frame geometry", id))?;

        let fifo = fifo_path(&bridge.shm_dir, &id);
        if let Some(dir) = fifo.parent() {
            ffmpeg::make_dir(dir)?;
        }
        ffmpeg::make_pipe(&fifo)?;

        let mask = mask::write_mask(
            &mask_path(&bridge.shm_dir, &id),
            &config.mask,
            geometry.scaled_width,
            geometry.scaled_height,
        )?;

        let args = ffmpeg::build_args(
            &geometry,
            &FilterSettings {
                input: fifo.clone(),
                sample_rate: config.sample_rate,
                log_level: config.log_level.clone(),
                hwaccel: config.hwaccel.clone(),
                mask: mask.clone(),
                gray: config.gray,
            },
        );

        let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(
            config.detector_ip.clone(),
            bridge.connect_timeout,
        ));
        let client = DetectionClient {
            monitor_id: id.clone(),
            connector,
            detector_name: config.detector_name.clone(),
            filter: TriggerFilter {
                monitor_id: id.clone(),
                thresholds: config.thresholds.clone(),
                geometry: geometry.clone(),
                trigger_duration: config.sample_interval,
                recording_duration: config.recording_duration,
                sender: trigger,
            },
            timestamp_offset: config.timestamp_offset,
            pipeline_delay: config.pipeline_delay,
            backoff: bridge.restart_backoff,
        };

        log::info!(
            "{}: detector: starting pipeline with '{}' {}x{} on {}",
            id,
            config.detector_name,
            output_width,
            output_height,
            if input.is_sub_stream { "sub stream" } else { "main stream" }
        );

        let cancel = cancel.child();
        let handle = FrameSupervisor {
            monitor_id: id.clone(),
            runner: FfmpegRunner {
                monitor_id: id,
                bin: bridge.ffmpeg_bin.clone(),
                args: args.clone(),
                log_level: config.log_level.clone(),
                client,
                group: group.clone(),
            },
            cancel: cancel.clone(),
            backoff: bridge.restart_backoff,
        }
        .spawn(group);

        Ok(Some(Self {
            config,
            geometry,
            fifo,
            mask,
            args,
            cancel,
            handle,
        }))
    }

    /// Arguments the monitor appends to its transcoder to feed this pipeline.
    pub fn fifo_output_args(&self) -> Vec<String> {
        ffmpeg::fifo_output_args(&self.fifo)
    }

    /// Requests shutdown. Tasks wind down at their next iteration boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the supervisor thread to return.
    pub fn join(self) {
        if self.handle.join().is_err() {
            log::error!("{}: detector: supervisor panicked", self.config.monitor_id);
        }
    }
}
