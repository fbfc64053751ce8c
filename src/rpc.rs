//! Streaming detection call.
//!
//! One TCP connection carries one call. The client writes a request frame per
//! image and reads exactly one response frame before sending the next image.
//!
//! ```text
//! request:  u32 BE header_len | header JSON | u32 BE data_len | image bytes
//! response: u32 BE len | response JSON
//! ```
//!
//! A clean EOF before a response length prefix ends the stream.
//!
//! This framing is not gRPC. It cannot talk to a detector that only serves
//! the gRPC `odrpc` streaming API; such a detector needs a shim that speaks
//! this protocol.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::PipelineError;

/// Upper bound for any single frame on the wire.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Per-label floor sent with every request. Filtering happens locally.
pub const WILDCARD_LABEL: &str = "*";
pub const WILDCARD_MIN_SCORE: f32 = 10.0;

/// One image for the detector.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectRequest {
    pub detector_name: String,
    /// Minimum score per label, in percent.
    pub detect: HashMap<String, f32>,
    /// Encoded image.
    pub data: Vec<u8>,
}

impl DetectRequest {
    /// Request that asks for every label above the wildcard floor.
    pub fn wildcard(detector_name: &str, data: Vec<u8>) -> Self {
        Self {
            detector_name: detector_name.to_string(),
            detect: HashMap::from([(WILDCARD_LABEL.to_string(), WILDCARD_MIN_SCORE)]),
            data,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RequestHeader {
    detector_name: String,
    detect: HashMap<String, f32>,
}

/// Detection in detector-normalized `0..=1` coordinates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub top: f32,
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
    pub label: String,
    /// Percent.
    pub confidence: f32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub detections: Vec<RawDetection>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Client side of one open detection call.
pub trait DetectStream: Send {
    fn send(&mut self, req: &DetectRequest) -> Result<()>;

    /// Next response, or `None` when the server ended the stream.
    fn recv(&mut self) -> Result<Option<DetectResponse>>;

    /// Half-closes the send side.
    fn close_send(&mut self) -> Result<()>;
}

/// Opens detection calls.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn DetectStream>>;
}

/// Connects to a detector over TCP with a bounded connect timeout.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    pub addr: String,
    pub timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = self
            .addr
            .to_socket_addrs()
            .map_err(|e| PipelineError::connection(format!("resolve {}: {}", self.addr, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(
                PipelineError::connection(format!("no address for {}", self.addr)).into(),
            );
        }
        Ok(addrs)
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> Result<Box<dyn DetectStream>> {
        let mut last_err = None;
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(Box::new(TcpDetectStream::new(stream)?)),
                Err(e) => last_err = Some(e),
            }
        }
        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(PipelineError::connection(format!("connect {}: {}", self.addr, reason)).into())
    }
}

pub struct TcpDetectStream {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl TcpDetectStream {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        let read_half = stream.try_clone().context("clone detector stream")?;
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(stream),
        })
    }
}

impl DetectStream for TcpDetectStream {
    fn send(&mut self, req: &DetectRequest) -> Result<()> {
        write_request(&mut self.writer, req)
            .map_err(|e| PipelineError::connection(format!("send: {:#}", e)))?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<DetectResponse>> {
        let resp = read_response(&mut self.reader)
            .map_err(|e| PipelineError::connection(format!("receive: {:#}", e)))?;
        match resp {
            Some(resp) if !resp.error.is_empty() => Err(PipelineError::connection(format!(
                "detector error: {}",
                resp.error
            ))
            .into()),
            other => Ok(other),
        }
    }

    fn close_send(&mut self) -> Result<()> {
        self.writer.flush().context("flush detector stream")?;
        self.writer
            .get_ref()
            .shutdown(Shutdown::Write)
            .context("half-close detector stream")
    }
}

// -------------------- Framing --------------------

fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!("message too large: {} bytes", payload.len());
    }
    let len = u32::try_from(payload.len()).context("message length")?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

/// Reads one length-prefixed frame. `None` on EOF before the prefix.
fn read_frame<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match r.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => anyhow::bail!("truncated length prefix"),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("read length prefix"),
        }
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        anyhow::bail!("message too large: {} bytes", len);
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).context("read message body")?;
    Ok(Some(payload))
}

pub fn write_request<W: Write>(w: &mut W, req: &DetectRequest) -> Result<()> {
    let header = serde_json::to_vec(&RequestHeader {
        detector_name: req.detector_name.clone(),
        detect: req.detect.clone(),
    })?;
    write_frame(w, &header)?;
    write_frame(w, &req.data)?;
    w.flush()?;
    Ok(())
}

/// Server side of [`write_request`]. `None` when the client half-closed.
pub fn read_request<R: Read>(r: &mut R) -> Result<Option<DetectRequest>> {
    let Some(header) = read_frame(r)? else {
        return Ok(None);
    };
    let header: RequestHeader = serde_json::from_slice(&header).context("decode request header")?;
    let data = read_frame(r)?.context("missing request body")?;
    Ok(Some(DetectRequest {
        detector_name: header.detector_name,
        detect: header.detect,
        data,
    }))
}

pub fn write_response<W: Write>(w: &mut W, resp: &DetectResponse) -> Result<()> {
    write_frame(w, &serde_json::to_vec(resp)?)?;
    w.flush()?;
    Ok(())
}

pub fn read_response<R: Read>(r: &mut R) -> Result<Option<DetectResponse>> {
    let Some(payload) = read_frame(r)? else {
        return Ok(None);
    };
    let resp = serde_json::from_slice(&payload).context("decode response")?;
    Ok(Some(resp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_frames_header_then_image() -> Result<()> {
        let req = DetectRequest::wildcard("default", vec![1, 2, 3]);
        let mut buf = Vec::new();
        write_request(&mut buf, &req)?;

        let header_len = u32::from_be_bytes(buf[..4].try_into()?) as usize;
        let header: serde_json::Value = serde_json::from_slice(&buf[4..4 + header_len])?;
        assert_eq!(header["detector_name"], "default");
        assert_eq!(header["detect"]["*"], 10.0);
        assert_eq!(&buf[4 + header_len..8 + header_len], &3u32.to_be_bytes());
        assert_eq!(&buf[8 + header_len..], &[1, 2, 3]);

        assert_eq!(read_request(&mut Cursor::new(buf))?, Some(req));
        Ok(())
    }

    #[test]
    fn clean_eof_ends_stream() -> Result<()> {
        assert_eq!(read_response(&mut Cursor::new(Vec::new()))?, None);
        assert_eq!(read_request(&mut Cursor::new(Vec::new()))?, None);
        Ok(())
    }

    #[test]
    fn truncated_messages_fail() {
        assert!(read_response(&mut Cursor::new(vec![0, 0])).is_err());
        assert!(read_response(&mut Cursor::new(vec![0, 0, 0, 9, b'{'])).is_err());
    }

    #[test]
    fn oversized_messages_fail() {
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        let err = read_response(&mut Cursor::new(len.to_vec())).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn response_defaults_missing_fields() -> Result<()> {
        let mut buf = Vec::new();
        write_frame(&mut buf, br#"{}"#)?;
        let resp = read_response(&mut Cursor::new(buf))?;
        assert_eq!(resp, Some(DetectResponse::default()));
        Ok(())
    }

    #[test]
    fn connect_failure_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let connector = TcpConnector::new(addr.to_string(), Duration::from_millis(500));
        let err = connector.connect().err().expect("connect should fail");
        assert_eq!(
            crate::error_kind(&err),
            Some(crate::ErrorKind::ConnectionFailure)
        );
    }
}
