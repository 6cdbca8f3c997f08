// SSE framing - incremental line/frame parsing and frame encoding

use serde_json::Value;
use thiserror::Error;

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.data).ok()
    }
}

/// Upper bound on stream bytes held while waiting for a line or frame to
/// complete.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upstream stream buffered more than {limit} bytes without completing a line")]
pub struct BufferLimitExceeded {
    pub limit: usize,
}

/// Splits a byte stream into complete lines. Bytes are held until the
/// terminating newline arrives, so multi-byte characters split across
/// chunks are never decoded early.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_BUFFERED_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Complete lines, without their `\n` / `\r\n` terminator. Fails once the
    /// unterminated tail grows past the limit; the tail is discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, BufferLimitExceeded> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut search = self.scanned;
        while let Some(offset) = self.pending[search..].iter().position(|b| *b == b'\n') {
            let end = search + offset;
            let line = &self.pending[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
            search = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();

        if self.pending.len() > self.limit {
            self.pending = Vec::new();
            self.scanned = 0;
            return Err(BufferLimitExceeded { limit: self.limit });
        }
        Ok(lines)
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest);
        Some(String::from_utf8_lossy(rest).into_owned())
    }
}

/// Incremental SSE parser.
#[derive(Debug)]
pub struct SseParser {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
    data_bytes: usize,
    limit: usize,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_BUFFERED_BYTES)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// `limit` bounds both an unterminated line and one frame's data.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            lines: LineBuffer::with_limit(limit),
            event: None,
            data: Vec::new(),
            data_bytes: 0,
            limit,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, BufferLimitExceeded> {
        let mut frames = Vec::new();
        for line in self.lines.feed(chunk)? {
            if let Some(frame) = self.push_line(&line)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Flush a trailing frame the upstream did not terminate.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if let Some(line) = self.lines.finish() {
            if let Ok(Some(frame)) = self.push_line(&line) {
                return Some(frame);
            }
        }
        self.take_frame()
    }

    fn push_line(&mut self, line: &str) -> Result<Option<SseFrame>, BufferLimitExceeded> {
        if line.is_empty() {
            return Ok(self.take_frame());
        }
        if line.starts_with(':') {
            return Ok(None);
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_bytes += value.len();
                if self.data_bytes > self.limit {
                    self.data.clear();
                    self.data_bytes = 0;
                    self.event = None;
                    return Err(BufferLimitExceeded { limit: self.limit });
                }
                self.data.push(value.to_string());
            }
            _ => {}
        }
        Ok(None)
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        self.data_bytes = 0;
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let frame = SseFrame {
            event: self.event.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(frame)
    }
}

/// `event: <name>` + `data: <json>` frame, as Anthropic and Responses use.
pub fn encode_event(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

/// Data-only frame, as Chat Completions uses.
pub fn encode_data(data: &Value) -> String {
    format!("data: {}\n\n", data)
}
