//! detect_bridge - object detection bridge daemon
//!
//! This daemon:
//! 1. Loads the bridge config (generating a default one when missing)
//! 2. Fetches the detector table from the detector service
//! 3. Starts a detection pipeline for every monitor with detection enabled
//! 4. Prints every trigger event as one JSON line on stdout
//! 5. Stops all pipelines on Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use detect_bridge::detector::FETCH_RETRY;
use detect_bridge::{
    trigger, BridgeConfig, CancelToken, DetectorTable, FrameSize, MonitorConfig, MonitorInput,
    Pipeline, TaskGroup, TriggerSender,
};

const EVENT_POLL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Bridge config file. Written with defaults when it does not exist.
    #[arg(long, env = "DETECT_BRIDGE_CONFIG")]
    config: Option<PathBuf>,
    /// Monitor definition files, `{"size", "subSize", "config"}`.
    #[arg(required = true)]
    monitors: Vec<PathBuf>,
    /// Seconds to wait for pipelines to wind down on shutdown.
    #[arg(long, default_value_t = 5)]
    shutdown_timeout_s: u64,
}

#[derive(Debug, Deserialize)]
struct MonitorFile {
    size: String,
    #[serde(default, rename = "subSize")]
    sub_size: Option<String>,
    config: MonitorConfig,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BridgeConfig::load_or_generate(path)?,
        None => BridgeConfig::load()?,
    };

    let cancel = CancelToken::new();
    let stopper = cancel.clone();
    ctrlc::set_handler(move || stopper.cancel()).context("set Ctrl-C handler")?;

    log::info!("detector: fetching detectors from {}", config.detectors_url);
    let Some(detectors) =
        DetectorTable::fetch_with_retry(&config.detectors_url, FETCH_RETRY, &cancel)
    else {
        log::info!("shutdown signal received before detectors were available");
        return Ok(());
    };

    let group = TaskGroup::new();
    let (events_tx, events_rx) = trigger::channel(config.event_queue);
    let mut pipelines = Vec::new();
    for path in &args.monitors {
        match start_monitor(path, &config, &detectors, &events_tx, &cancel, &group) {
            Ok(started) => pipelines.extend(started),
            Err(e) => log::error!("{}: {:#}", path.display(), e),
        }
    }
    drop(events_tx);
    log::info!("detect_bridge running {} pipelines", pipelines.len());

    while !cancel.is_cancelled() {
        match events_rx.recv_timeout(EVENT_POLL) {
            Ok(Some(event)) => println!("{}", serde_json::to_string(&event)?),
            Ok(None) => {}
            Err(_) => {
                log::warn!("no pipelines running");
                break;
            }
        }
    }

    log::info!("shutdown signal received, stopping pipelines...");
    for pipeline in &pipelines {
        pipeline.stop();
    }
    cancel.cancel();
    // Unblock clients waiting on a full queue.
    drop(events_rx);
    if !group.wait_timeout(Duration::from_secs(args.shutdown_timeout_s)) {
        log::warn!("{} pipeline tasks still running at exit", group.active());
    }
    Ok(())
}

/// Starts a pipeline for each input stream of the monitor that should run detection.
fn start_monitor(
    path: &Path,
    config: &BridgeConfig,
    detectors: &DetectorTable,
    events: &TriggerSender,
    cancel: &CancelToken,
    group: &TaskGroup,
) -> Result<Vec<Pipeline>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read monitor file {}", path.display()))?;
    let file: MonitorFile = serde_json::from_str(&raw)
        .with_context(|| format!("parse monitor file {}", path.display()))?;

    let mut inputs = vec![MonitorInput {
        config: file.config.clone(),
        size: FrameSize::parse(&file.size)?,
        is_sub_stream: false,
    }];
    if let Some(sub_size) = file.sub_size.as_deref().filter(|_| file.config.sub_input_enabled()) {
        inputs.push(MonitorInput {
            config: file.config.clone(),
            size: FrameSize::parse(sub_size)?,
            is_sub_stream: true,
        });
    }

    let mut started = Vec::new();
    for input in &inputs {
        if let Some(pipeline) =
            Pipeline::start(config, detectors, input, events.clone(), cancel, group)?
        {
            log::info!(
                "{}: detector: monitor output args: {}",
                pipeline.config.monitor_id,
                pipeline.fifo_output_args().join(" ")
            );
            started.push(pipeline);
        }
    }
    Ok(started)
}
