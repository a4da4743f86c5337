//! Debug Adapter Protocol wire format.
//!
//! Every message is a `Content-Length: <n>\r\n\r\n` header followed by
//! exactly `n` bytes of UTF-8 JSON. Reads arrive in arbitrary pieces, so
//! [`FrameDecoder`] keeps its buffer between calls.

pub mod client;

pub use client::{ClientEvent, DapClient};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Maximum message size (64 MB), matching what adapters send for large variable dumps.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Header bytes tolerated before the terminator must have appeared.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors produced while decoding a frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Message too large: {0} bytes (max {MAX_MESSAGE_SIZE})")]
    TooLarge(usize),

    #[error("Invalid Content-Length header: {0}")]
    InvalidLength(String),

    #[error("Header exceeds {MAX_HEADER_SIZE} bytes without a terminator ({0} buffered)")]
    HeaderTooLarge(usize),
}

/// Incremental frame splitter.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Body length announced by the last header, while its body is incomplete.
    pending_len: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete message body, or `None` until more bytes arrive.
    ///
    /// A header block without `Content-Length` is logged and skipped. A header
    /// that runs past [`MAX_HEADER_SIZE`] is an error, so a peer that never
    /// sends the terminator cannot grow the buffer without bound.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            if let Some(len) = self.pending_len {
                if self.buffer.len() < len {
                    return Ok(None);
                }
                let body: Vec<u8> = self.buffer.drain(..len).collect();
                self.pending_len = None;
                return Ok(Some(body));
            }

            let Some(end) = find(&self.buffer, HEADER_TERMINATOR) else {
                if self.buffer.len() > MAX_HEADER_SIZE {
                    return Err(FrameError::HeaderTooLarge(self.buffer.len()));
                }
                return Ok(None);
            };
            if end > MAX_HEADER_SIZE {
                return Err(FrameError::HeaderTooLarge(end));
            }
            let header = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
            self.buffer.drain(..end + HEADER_TERMINATOR.len());

            match parse_content_length(&header)? {
                Some(len) if len > MAX_MESSAGE_SIZE => return Err(FrameError::TooLarge(len)),
                Some(len) => self.pending_len = Some(len),
                None => warn!(header = %header, "Skipping header block without Content-Length"),
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(header: &str) -> Result<Option<usize>, FrameError> {
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| FrameError::InvalidLength(value.trim().to_string()));
        }
    }
    Ok(None)
}

/// Serialize a message with its `Content-Length` header.
pub fn encode_frame<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Any message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolMessage {
    Request(Request),
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub seq: i64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    /// Decode the body into a typed struct. A missing body decodes from `{}`.
    pub fn body_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        match &self.body {
            Some(body) => T::deserialize(body),
            None => serde_json::from_value(Value::Object(serde_json::Map::new())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputEventBody {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub source: Option<Source>,
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub column: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceResponse {
    #[serde(default)]
    pub stack_frames: Vec<StackFrame>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: i64,
    #[serde(default)]
    pub expensive: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScopesResponse {
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariablesResponse {
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluateResponse {
    pub result: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}
