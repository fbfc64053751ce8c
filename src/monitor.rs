//! Per-monitor detection settings.
//!
//! Monitors carry their configuration as a flat string map owned by the
//! monitor manager. This module reads the detection keys out of it and
//! validates them into an immutable [`PipelineConfig`].

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::geometry::Crop;
use crate::mask::Mask;
use crate::PipelineError;

/// Keys read from the monitor configuration map.
pub mod keys {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const LOG_LEVEL: &str = "logLevel";
    pub const HWACCEL: &str = "hwaccel";
    pub const SUB_INPUT: &str = "subInput";
    pub const TIMESTAMP_OFFSET: &str = "timestampOffset";

    pub const ENABLE: &str = "detectEnable";
    pub const DETECTOR_NAME: &str = "detectDetectorName";
    pub const THRESHOLDS: &str = "detectThresholds";
    pub const FEED_RATE: &str = "detectFeedRate";
    pub const DURATION: &str = "detectDuration";
    pub const USE_SUB_STREAM: &str = "detectUseSubStream";
    pub const CROP: &str = "detectCrop";
    pub const MASK: &str = "detectMask";
    pub const DELAY: &str = "detectDelay";
}

const DEFAULT_LOG_LEVEL: &str = "error";
const DEFAULT_FEED_RATE: f64 = 0.2;
const DEFAULT_RECORDING_DURATION: Duration = Duration::from_secs(120);
const DEFAULT_CROP_SIZE: f64 = 100.0;

/// Threshold sentinel that disables a label.
const DISABLED_THRESHOLD: f64 = -1.0;

/// Detectors with this name prefix expect grayscale input.
const GRAY_DETECTOR_PREFIX: &str = "gray_";

/// Raw monitor configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct MonitorConfig(HashMap<String, String>);

impl From<HashMap<String, String>> for MonitorConfig {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for MonitorConfig {
    fn from(entries: [(&str, &str); N]) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl MonitorConfig {
    /// Value of `key`, or an empty string when unset.
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn id(&self) -> &str {
        self.get(keys::ID)
    }

    pub fn name(&self) -> &str {
        self.get(keys::NAME)
    }

    pub fn log_level(&self) -> &str {
        match self.get(keys::LOG_LEVEL) {
            "" => DEFAULT_LOG_LEVEL,
            level => level,
        }
    }

    pub fn hwaccel(&self) -> &str {
        self.get(keys::HWACCEL)
    }

    pub fn sub_input_enabled(&self) -> bool {
        !self.get(keys::SUB_INPUT).is_empty()
    }

    pub fn detection_enabled(&self) -> bool {
        self.get(keys::ENABLE) == "true"
    }

    /// True when detection should run on the sub stream instead of the main one.
    pub fn use_sub_stream(&self) -> bool {
        self.sub_input_enabled() && self.get(keys::USE_SUB_STREAM) == "true"
    }
}

/// Label to minimum confidence, in percent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Thresholds(HashMap<String, f64>);

impl Thresholds {
    /// Parses a JSON object of label thresholds.
    ///
    /// Labels set to `-1` are disabled and dropped. An empty string yields an
    /// empty map.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut map: HashMap<String, f64> = serde_json::from_str(raw)
            .map_err(|e| PipelineError::invalid_config(format!("unmarshal thresholds: {}", e)))?;
        map.retain(|_, thresh| *thresh != DISABLED_THRESHOLD);

        if let Some((label, thresh)) = map.iter().find(|(_, t)| !(0.0..=100.0).contains(*t)) {
            return Err(PipelineError::invalid_config(format!(
                "threshold for '{}' out of range: {}",
                label, thresh
            ))
            .into());
        }
        Ok(Self(map))
    }

    pub fn get(&self, label: &str) -> Option<f64> {
        self.0.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, f64); N]> for Thresholds {
    fn from(entries: [(&str, f64); N]) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

/// Validated settings for one pipeline instance.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub monitor_id: String,
    pub monitor_name: String,
    pub detector_ip: String,
    pub detector_name: String,
    /// Frames per second fed to the detector.
    pub sample_rate: f64,
    /// Time between two sampled frames, the lifetime of one trigger.
    pub sample_interval: Duration,
    pub recording_duration: Duration,
    pub thresholds: Thresholds,
    /// Camera clock latency in milliseconds. Negative values move capture
    /// times forward.
    pub timestamp_offset: i64,
    pub pipeline_delay: i64,
    pub crop: Crop,
    pub mask: Mask,
    pub gray: bool,
    pub log_level: String,
    pub hwaccel: String,
}

impl PipelineConfig {
    pub fn parse(c: &MonitorConfig, detector_ip: &str) -> Result<Self> {
        let thresholds = Thresholds::parse(c.get(keys::THRESHOLDS))?;

        let sample_rate = parse_float(c.get(keys::FEED_RATE), keys::FEED_RATE)?
            .unwrap_or(DEFAULT_FEED_RATE);
        if !(sample_rate > 0.0 && sample_rate.is_finite()) {
            return Err(
                PipelineError::invalid_config(format!("invalid feed rate: {}", sample_rate)).into(),
            );
        }
        let sample_interval = seconds(1.0 / sample_rate, keys::FEED_RATE)?;

        let recording_duration = match parse_float(c.get(keys::DURATION), keys::DURATION)? {
            None => DEFAULT_RECORDING_DURATION,
            Some(secs) => seconds(secs, keys::DURATION)?,
        };

        let timestamp_offset = parse_millis(c.get(keys::TIMESTAMP_OFFSET), keys::TIMESTAMP_OFFSET)?;
        let pipeline_delay = parse_millis(c.get(keys::DELAY), keys::DELAY)?;

        let crop = parse_crop(c.get(keys::CROP))?;
        let mask = Mask::parse(c.get(keys::MASK))?;

        let detector_name = c.get(keys::DETECTOR_NAME).to_string();
        let gray = detector_name.len() > GRAY_DETECTOR_PREFIX.len()
            && detector_name.starts_with(GRAY_DETECTOR_PREFIX);

        Ok(Self {
            monitor_id: c.id().to_string(),
            monitor_name: c.name().to_string(),
            detector_ip: detector_ip.to_string(),
            detector_name,
            sample_rate,
            sample_interval,
            recording_duration,
            thresholds,
            timestamp_offset,
            pipeline_delay,
            crop,
            mask,
            gray,
            log_level: c.log_level().to_string(),
            hwaccel: c.hwaccel().to_string(),
        })
    }
}

fn parse_float(raw: &str, key: &str) -> Result<Option<f64>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    raw.trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|e| PipelineError::invalid_config(format!("parse {}: {}", key, e)).into())
}

fn seconds(secs: f64, key: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| PipelineError::invalid_config(format!("invalid {}: {}: {}", key, secs, e)).into())
}

fn parse_millis(raw: &str, key: &str) -> Result<i64> {
    if raw.trim().is_empty() {
        return Ok(0);
    }
    raw.trim()
        .parse::<i64>()
        .map_err(|e| PipelineError::invalid_config(format!("parse {}: {}", key, e)).into())
}

fn parse_crop(raw: &str) -> Result<Crop> {
    if raw.trim().is_empty() {
        return Ok(Crop::default());
    }
    let mut crop: Crop = serde_json::from_str(raw)
        .map_err(|e| PipelineError::invalid_config(format!("unmarshal crop values: {}", e)))?;
    if crop.size == 0.0 {
        crop.size = DEFAULT_CROP_SIZE;
    }
    for (name, value) in [("crop size", crop.size), ("crop x", crop.x), ("crop y", crop.y)] {
        if !(0.0..=100.0).contains(&value) {
            return Err(
                PipelineError::invalid_config(format!("invalid {}: {}", name, value)).into(),
            );
        }
    }
    Ok(crop)
}
