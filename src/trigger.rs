//! Detection filtering and trigger events.
//!
//! Raw detections are filtered against the monitor's label thresholds and
//! mapped back to original-frame coordinates. A frame with at least one
//! surviving detection becomes a [`TriggerEvent`] for the recorder.

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::time::{Duration, SystemTime};

use crate::geometry::FrameGeometry;
use crate::monitor::Thresholds;
use crate::rpc::RawDetection;

/// Bounding box in original-frame fixed-point percent, `0..=10000`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Region {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub score: f64,
    pub region: Region,
}

/// Signal that starts or extends a recording.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TriggerEvent {
    pub time: SystemTime,
    pub detections: Vec<Detection>,
    /// How long this trigger keeps the recording alive.
    pub trigger_duration: Duration,
    pub recording_duration: Duration,
}

/// Creates the trigger queue.
///
/// The queue holds at most `capacity` events. Once full, [`TriggerSender::send`]
/// blocks until the recorder catches up, which stalls the detection client.
pub fn channel(capacity: usize) -> (TriggerSender, TriggerReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (TriggerSender(tx), TriggerReceiver(rx))
}

#[derive(Clone, Debug)]
pub struct TriggerSender(Sender<TriggerEvent>);

impl TriggerSender {
    /// Blocking send. Fails only when the receiver is gone.
    pub fn send(&self, event: TriggerEvent) -> Result<()> {
        self.0
            .send(event)
            .map_err(|_| anyhow::anyhow!("trigger receiver closed"))
    }
}

#[derive(Clone, Debug)]
pub struct TriggerReceiver(Receiver<TriggerEvent>);

impl TriggerReceiver {
    /// Blocks for the next event. `None` once every sender is dropped.
    pub fn recv(&self) -> Option<TriggerEvent> {
        self.0.recv().ok()
    }

    /// Waits up to `timeout`. `Ok(None)` on timeout, `Err` once every sender is dropped.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<TriggerEvent>> {
        match self.0.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => anyhow::bail!("trigger senders closed"),
        }
    }

    pub fn try_recv(&self) -> Option<TriggerEvent> {
        self.0.try_recv().ok()
    }
}

/// Keeps detections whose label is configured and whose confidence reaches
/// the label's threshold, mapped to original-frame coordinates.
pub fn parse_detections(
    raw: &[RawDetection],
    thresholds: &Thresholds,
    g: &FrameGeometry,
) -> Vec<Detection> {
    raw.iter()
        .filter(|d| {
            thresholds
                .get(&d.label)
                .is_some_and(|thresh| f64::from(d.confidence) >= thresh)
        })
        .map(|d| Detection {
            label: d.label.clone(),
            score: f64::from(d.confidence),
            region: Region {
                top: g.frame_y(d.top),
                left: g.frame_x(d.left),
                bottom: g.frame_y(d.bottom),
                right: g.frame_x(d.right),
            },
        })
        .collect()
}

/// Per-pipeline filter that turns detector responses into trigger events.
#[derive(Clone, Debug)]
pub struct TriggerFilter {
    pub monitor_id: String,
    pub thresholds: Thresholds,
    pub geometry: FrameGeometry,
    pub trigger_duration: Duration,
    pub recording_duration: Duration,
    pub sender: TriggerSender,
}

impl TriggerFilter {
    /// Filters one frame's detections and emits a trigger when any survive.
    ///
    /// Returns true when an event was sent.
    pub fn handle(&self, time: SystemTime, raw: &[RawDetection]) -> Result<bool> {
        let detections = parse_detections(raw, &self.thresholds, &self.geometry);
        let Some(first) = detections.first() else {
            return Ok(false);
        };
        log::info!(
            "{}: detector: trigger label:{} score:{:.1}",
            self.monitor_id,
            first.label,
            first.score
        );
        self.sender.send(TriggerEvent {
            time,
            detections,
            trigger_duration: self.trigger_duration,
            recording_duration: self.recording_duration,
        })?;
        Ok(true)
    }
}
