//! Decoding of streamed answers.
//!
//! The answer endpoint sends `data: <json>` lines. Some deployments buffer
//! the whole response into a gateway envelope
//! (`{"statusCode":200,"body":"...","isBase64Encoded":false}`); in that case
//! the envelope's body is decoded as if it had been streamed.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// One decoded line of an answer stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Token {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolStart {
        #[serde(default)]
        tool: Option<String>,
    },
    ToolEnd {
        #[serde(default)]
        tool: Option<String>,
    },
    TraceId {
        content: String,
    },
    Done,
    Error {
        #[serde(default)]
        content: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Nothing but whitespace seen so far.
    Sniffing,
    Live,
    Envelope,
}

/// Incremental decoder for one stream.
#[derive(Debug)]
pub struct FrameDecoder {
    mode: Mode,
    /// Raw bytes held back while sniffing or collecting an envelope.
    raw: Vec<u8>,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    utf8_tail: Vec<u8>,
    line: String,
    skipped: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            mode: Mode::Sniffing,
            raw: Vec::new(),
            utf8_tail: Vec::new(),
            line: String::new(),
            skipped: 0,
        }
    }

    /// Malformed frames seen so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feed one chunk; returns the frames completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        match self.mode {
            Mode::Live => self.push_live(chunk),
            Mode::Envelope => {
                self.raw.extend_from_slice(chunk);
                Vec::new()
            }
            Mode::Sniffing => {
                self.raw.extend_from_slice(chunk);
                let Some(first) = self.raw.iter().find(|b| !b.is_ascii_whitespace()) else {
                    return Vec::new();
                };
                if *first == b'{' {
                    self.mode = Mode::Envelope;
                    Vec::new()
                } else {
                    self.mode = Mode::Live;
                    let buffered = std::mem::take(&mut self.raw);
                    self.push_live(&buffered)
                }
            }
        }
    }

    /// Flush at end of stream, including a final line without a newline.
    pub fn finish(&mut self) -> Vec<StreamFrame> {
        let mut frames = match self.mode {
            Mode::Live => Vec::new(),
            Mode::Sniffing => {
                self.raw.clear();
                Vec::new()
            }
            Mode::Envelope => {
                let raw = std::mem::take(&mut self.raw);
                self.mode = Mode::Live;
                match unwrap_envelope(&raw) {
                    Ok(body) => self.push_live(&body),
                    Err(e) => {
                        tracing::warn!("{}", e);
                        self.skipped += 1;
                        Vec::new()
                    }
                }
            }
        };

        if !self.utf8_tail.is_empty() {
            let tail = std::mem::take(&mut self.utf8_tail);
            self.line.push_str(&String::from_utf8_lossy(&tail));
        }
        let rest = std::mem::take(&mut self.line);
        if let Some(frame) = self.parse_line(&rest) {
            frames.push(frame);
        }
        frames
    }

    fn push_live(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        let text = self.decode_utf8(chunk);
        self.line.push_str(&text);

        let mut frames = Vec::new();
        while let Some(pos) = self.line.find('\n') {
            let line: String = self.line.drain(..=pos).collect();
            if let Some(frame) = self.parse_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Decode as much of the pending bytes as forms complete characters.
    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        self.utf8_tail.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.utf8_tail) {
                Ok(text) => {
                    out.push_str(text);
                    self.utf8_tail.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.utf8_tail[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.utf8_tail.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.utf8_tail.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn parse_line(&mut self, line: &str) -> Option<StreamFrame> {
        let line = line.trim_end_matches(['\n', '\r']);
        let payload = line.strip_prefix("data:")?.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return None;
        }
        match serde_json::from_str::<StreamFrame>(payload) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.skipped += 1;
                let err = ProtocolError::MalformedFrame {
                    line: payload.chars().take(120).collect(),
                    reason: e.to_string(),
                };
                tracing::warn!("Skipping stream frame: {}", err);
                None
            }
        }
    }
}

fn unwrap_envelope(raw: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| ProtocolError::InvalidEnvelope {
            reason: e.to_string(),
        })?;
    let body = value
        .get("body")
        .and_then(|b| b.as_str())
        .ok_or_else(|| ProtocolError::InvalidEnvelope {
            reason: "missing string field 'body'".to_string(),
        })?;
    let encoded = value
        .get("isBase64Encoded")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if encoded {
        base64::engine::general_purpose::STANDARD
            .decode(body.trim())
            .map_err(|e| ProtocolError::InvalidEnvelope {
                reason: format!("body is not valid base64: {e}"),
            })
    } else {
        Ok(body.as_bytes().to_vec())
    }
}
