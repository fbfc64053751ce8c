//! Streaming detection client.
//!
//! Reads fixed-size RGB24 frames from the transcoder, sends each one to the
//! detector as a PNG and waits for its response before reading the next.
//! Connection failures are retried after a fixed backoff until cancelled.

use anyhow::{Context, Result};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder};
use std::io::Read;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::rpc::{Connector, DetectRequest, DetectStream};
use crate::supervise::{CancelToken, TaskGroup};
use crate::trigger::TriggerFilter;
use crate::PipelineError;

#[derive(Clone)]
pub struct DetectionClient {
    pub monitor_id: String,
    pub connector: Arc<dyn Connector>,
    pub detector_name: String,
    pub filter: TriggerFilter,
    /// Milliseconds subtracted from the wall clock to get a frame's capture
    /// time. Negative values add to it.
    pub timestamp_offset: i64,
    pub pipeline_delay: i64,
    pub backoff: Duration,
}

impl DetectionClient {
    /// Runs [`DetectionClient::run`] on its own thread, registered with `group`.
    pub fn spawn<R>(self, frames: R, cancel: CancelToken, group: &TaskGroup) -> JoinHandle<()>
    where
        R: Read + Send + 'static,
    {
        let guard = group.enter();
        std::thread::spawn(move || {
            let _guard = guard;
            self.run(frames, &cancel);
        })
    }

    /// Connection loop. Returns once `cancel` is set.
    pub fn run<R: Read>(&self, mut frames: R, cancel: &CancelToken) {
        loop {
            if cancel.is_cancelled() {
                log::debug!("{}: detector: client cancelled", self.monitor_id);
                return;
            }
            match self.run_once(&mut frames, cancel) {
                Ok(()) => log::info!("{}: detector: client stopped", self.monitor_id),
                Err(e) => log::error!("{}: detector: client crashed: {:#}", self.monitor_id, e),
            }
            if cancel.sleep(self.backoff) {
                log::debug!("{}: detector: client cancelled", self.monitor_id);
                return;
            }
        }
    }

    /// One connection: streams frames until the source or the server ends.
    pub fn run_once<R: Read>(&self, frames: &mut R, cancel: &CancelToken) -> Result<()> {
        let mut stream = self.connector.connect()?;
        let result = self.stream_frames(stream.as_mut(), frames, cancel);
        if let Err(e) = stream.close_send() {
            log::debug!("{}: detector: close send: {:#}", self.monitor_id, e);
        }
        result
    }

    fn stream_frames<R: Read>(
        &self,
        stream: &mut dyn DetectStream,
        frames: &mut R,
        cancel: &CancelToken,
    ) -> Result<()> {
        let g = &self.filter.geometry;
        let mut buf = vec![0u8; g.frame_size()];
        while !cancel.is_cancelled() {
            if !read_frame(frames, &mut buf)? {
                return Ok(());
            }
            let time = capture_time(SystemTime::now(), self.timestamp_offset, self.pipeline_delay);
            let data = encode_frame(&buf, g.output_width, g.output_height)?;

            stream.send(&DetectRequest::wildcard(&self.detector_name, data))?;
            let Some(resp) = stream.recv()? else {
                return Ok(());
            };
            self.filter.handle(time, &resp.detections)?;
        }
        Ok(())
    }
}

/// Fills `buf` with the next frame. Returns false when the source ended,
/// including in the middle of a frame.
pub fn read_frame<R: Read>(frames: &mut R, buf: &mut [u8]) -> Result<bool> {
    match frames.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(PipelineError::process(format!("read frame: {}", e)).into()),
    }
}

/// PNG-encodes an RGB24 frame with the fastest compression settings.
pub fn encode_frame(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(pixels.len() / 2);
    PngEncoder::new_with_quality(&mut out, CompressionType::Fast, FilterType::NoFilter)
        .write_image(pixels, width, height, ExtendedColorType::Rgb8)
        .context("encode frame")?;
    Ok(out)
}

/// Wall clock corrected for the camera and pipeline latency, both in
/// milliseconds. A negative net correction moves the time forward.
pub fn capture_time(now: SystemTime, offset_ms: i64, delay_ms: i64) -> SystemTime {
    let correction = offset_ms.saturating_add(delay_ms);
    let shift = Duration::from_millis(correction.unsigned_abs());
    if correction >= 0 {
        now.checked_sub(shift).unwrap_or(SystemTime::UNIX_EPOCH)
    } else {
        now.checked_add(shift).unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{calculate, Crop, FrameGeometryInput, FrameSize};
    use crate::monitor::Thresholds;
    use crate::rpc::{DetectResponse, RawDetection};
    use crate::trigger::{self, TriggerReceiver};
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Replies from a script and records every request.
    struct ScriptedStream {
        replies: VecDeque<Result<Option<DetectResponse>>>,
        sent: Arc<Mutex<Vec<DetectRequest>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl DetectStream for ScriptedStream {
        fn send(&mut self, req: &DetectRequest) -> Result<()> {
            self.sent.lock().unwrap().push(req.clone());
            Ok(())
        }

        fn recv(&mut self) -> Result<Option<DetectResponse>> {
            self.replies.pop_front().unwrap_or(Ok(None))
        }

        fn close_send(&mut self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    struct ScriptedConnector {
        stream: Mutex<Option<ScriptedStream>>,
    }

    impl Connector for ScriptedConnector {
        fn connect(&self) -> Result<Box<dyn DetectStream>> {
            match self.stream.lock().unwrap().take() {
                Some(s) => Ok(Box::new(s)),
                None => Err(PipelineError::connection("refused").into()),
            }
        }
    }

    struct Harness {
        client: DetectionClient,
        events: TriggerReceiver,
        sent: Arc<Mutex<Vec<DetectRequest>>>,
        closed: Arc<Mutex<bool>>,
    }

    fn harness(replies: Vec<Result<Option<DetectResponse>>>) -> Harness {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let connector = ScriptedConnector {
            stream: Mutex::new(Some(ScriptedStream {
                replies: replies.into(),
                sent: sent.clone(),
                closed: closed.clone(),
            })),
        };
        let geometry = calculate(&FrameGeometryInput::new(
            FrameSize {
                width: 8,
                height: 4,
            },
            Crop::default(),
            4,
            4,
        ))
        .unwrap();
        let (tx, rx) = trigger::channel(8);
        let client = DetectionClient {
            monitor_id: "cam1".to_string(),
            connector: Arc::new(connector),
            detector_name: "default".to_string(),
            filter: TriggerFilter {
                monitor_id: "cam1".to_string(),
                thresholds: Thresholds::from([("person", 50.0)]),
                geometry,
                trigger_duration: Duration::from_secs(1),
                recording_duration: Duration::from_secs(120),
                sender: tx,
            },
            timestamp_offset: 0,
            pipeline_delay: 0,
            backoff: Duration::from_millis(10),
        };
        Harness {
            client,
            events: rx,
            sent,
            closed,
        }
    }

    fn person() -> DetectResponse {
        DetectResponse {
            detections: vec![RawDetection {
                top: 0.0,
                left: 0.0,
                bottom: 1.0,
                right: 1.0,
                label: "person".to_string(),
                confidence: 80.0,
            }],
            error: String::new(),
        }
    }

    fn frames(n: usize) -> Cursor<Vec<u8>> {
        Cursor::new((0..4 * 4 * 3 * n).map(|i| i as u8).collect())
    }

    #[test]
    fn encoded_frame_decodes_to_identical_pixels() -> Result<()> {
        let (w, h) = (17, 9);
        let pixels: Vec<u8> = (0..w * h * 3).map(|i| (i * 7 % 251) as u8).collect();

        let png = encode_frame(&pixels, w, h)?;
        let decoded = image::load_from_memory_with_format(&png, image::ImageFormat::Png)?;
        let rgb = decoded.to_rgb8();
        assert_eq!(rgb.dimensions(), (w, h));
        assert_eq!(rgb.into_raw(), pixels);
        Ok(())
    }

    #[test]
    fn short_read_ends_the_source() -> Result<()> {
        let mut buf = [0u8; 6];
        let mut src = Cursor::new(vec![1u8; 9]);
        assert!(read_frame(&mut src, &mut buf)?);
        assert!(!read_frame(&mut src, &mut buf)?);
        assert!(!read_frame(&mut Cursor::new(Vec::new()), &mut buf)?);
        Ok(())
    }

    #[test]
    fn capture_time_subtracts_latency() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let t = capture_time(now, 300, 200);
        assert_eq!(t, SystemTime::UNIX_EPOCH + Duration::from_millis(9_500));
    }

    #[test]
    fn negative_latency_moves_capture_time_forward() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        assert_eq!(
            capture_time(now, -100, 0),
            SystemTime::UNIX_EPOCH + Duration::from_millis(10_100)
        );
        assert_eq!(
            capture_time(now, -300, 100),
            SystemTime::UNIX_EPOCH + Duration::from_millis(10_200)
        );
        assert_eq!(capture_time(now, 250, -250), now);
    }

    #[test]
    fn streams_one_request_per_frame() -> Result<()> {
        let h = harness(vec![Ok(Some(person())), Ok(Some(DetectResponse::default()))]);
        h.client.run_once(&mut frames(2), &CancelToken::new())?;

        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].detector_name, "default");
        assert_eq!(sent[0].detect.get("*"), Some(&10.0));
        assert!(sent[0].data.starts_with(b"\x89PNG"));
        assert!(*h.closed.lock().unwrap());

        let event = h.events.try_recv().expect("one trigger");
        assert_eq!(event.detections[0].label, "person");
        assert!(h.events.try_recv().is_none());
        Ok(())
    }

    #[test]
    fn server_end_of_stream_is_not_an_error() -> Result<()> {
        let h = harness(vec![Ok(None)]);
        h.client.run_once(&mut frames(3), &CancelToken::new())?;
        assert_eq!(h.sent.lock().unwrap().len(), 1);
        assert!(*h.closed.lock().unwrap());
        Ok(())
    }

    #[test]
    fn receive_error_fails_the_iteration_and_closes() {
        let h = harness(vec![Err(PipelineError::connection("reset").into())]);
        let err = h
            .client
            .run_once(&mut frames(1), &CancelToken::new())
            .unwrap_err();
        assert_eq!(
            crate::error_kind(&err),
            Some(crate::ErrorKind::ConnectionFailure)
        );
        assert!(*h.closed.lock().unwrap());
    }

    #[test]
    fn run_returns_once_cancelled() {
        let h = harness(vec![]);
        let cancel = CancelToken::new();
        let group = TaskGroup::new();
        let stopper = cancel.clone();

        // Every reconnect is refused after the first connection.
        let handle = h.client.spawn(frames(0), cancel, &group);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(group.active(), 1);
        stopper.cancel();
        handle.join().unwrap();
        assert_eq!(group.active(), 0);
    }
}
