//! Detector table fetched from the detector service at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::supervise::CancelToken;
use crate::PipelineError;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
pub const FETCH_RETRY: Duration = Duration::from_secs(3);

/// One model served by the detector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    pub labels: Vec<String>,
    /// Input tensor width. Non-positive values mean the detector accepts any size.
    pub width: i32,
    pub height: i32,
    pub channels: i32,
}

impl DetectorSpec {
    /// Fixed input size of the detector, required to build a pipeline.
    pub fn input_size(&self) -> Result<(u32, u32)> {
        match (u32::try_from(self.width), u32::try_from(self.height)) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => Ok((w, h)),
            _ => Err(PipelineError::invalid_config(format!(
                "detector '{}' has no fixed input size: {}x{}",
                self.name, self.width, self.height
            ))
            .into()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DetectorsResponse {
    #[serde(default)]
    detectors: Vec<DetectorSpec>,
}

/// Process-wide, read-only list of detectors. Cloning shares the list.
#[derive(Clone, Debug, Default)]
pub struct DetectorTable {
    detectors: Arc<Vec<DetectorSpec>>,
}

impl DetectorTable {
    pub fn from_specs(specs: Vec<DetectorSpec>) -> Self {
        Self {
            detectors: Arc::new(specs),
        }
    }

    /// Lists the detectors served at `url`.
    pub fn fetch(url: &str, timeout: Duration) -> Result<Self> {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let body = agent
            .get(url)
            .call()
            .with_context(|| format!("fetch detectors from {}", url))?
            .into_string()
            .context("read detectors response")?;
        let resp: DetectorsResponse =
            serde_json::from_str(&body).context("decode detectors response")?;
        Ok(Self::from_specs(resp.detectors))
    }

    /// Calls [`DetectorTable::fetch`] until it succeeds. `None` when cancelled.
    pub fn fetch_with_retry(url: &str, retry: Duration, cancel: &CancelToken) -> Option<Self> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match Self::fetch(url, FETCH_TIMEOUT) {
                Ok(table) => {
                    let names: Vec<&str> = table.iter().map(|d| d.name.as_str()).collect();
                    log::info!(
                        "detector: {} detectors available: {}",
                        table.len(),
                        names.join(", ")
                    );
                    return Some(table);
                }
                Err(e) => log::error!("detector: could not get detectors: {:#}", e),
            }
            if cancel.sleep(retry) {
                return None;
            }
        }
    }

    pub fn by_name(&self, name: &str) -> Result<&DetectorSpec> {
        self.detectors
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| {
                PipelineError::invalid_config(format!("could not find detector '{}'", name)).into()
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectorSpec> {
        self.detectors.iter()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}
