//! Incremental parser for the camera's multipart alarm stream.
//!
//! The camera answers an alarm subscription with an endless
//! `multipart/x-mixed-replace` body. Each part carries a short header block
//! and either a text body of `key=value` pairs or an image. The parser is
//! fed whatever chunks the socket produces and hands back complete frames;
//! it never buffers more than one part plus a bounded look-ahead window.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Errors raised while framing the stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Content-Type has no multipart boundary: {0}")]
    MissingBoundary(String),

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// One boundary-delimited unit of the alarm stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEventFrame {
    /// Part headers, keys lowercased
    pub part_headers: HashMap<String, String>,

    /// `key=value` fields from the text body
    pub fields: HashMap<String, String>,

    /// Binary payload (snapshot image), if any
    pub payload: Option<Bytes>,

    /// Bytes consumed from the wire for this frame
    pub raw_len: usize,
}

impl RawEventFrame {
    /// Look up a body field, preferring an exact key match.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str).or_else(|| {
            self.fields
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }

    /// Whether the frame carries neither fields nor payload.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.payload.is_none()
    }
}

/// Limits applied while scanning the stream.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    /// Largest accepted part body
    pub max_part_bytes: usize,
    /// Bytes scanned for a boundary or header terminator
    pub boundary_window: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_part_bytes: 4 * 1024 * 1024,
            boundary_window: 64 * 1024,
        }
    }
}

#[derive(Debug)]
enum Phase {
    /// Looking for the next delimiter; bytes before it are skipped.
    SeekBoundary,
    /// A length-delimited body was consumed; only line breaks may precede the
    /// next delimiter.
    ExpectBoundary,
    /// Delimiter found, the rest of its line decides close vs. next part.
    DelimiterLine,
    Headers,
    Body {
        headers: HashMap<String, String>,
        length: Option<usize>,
        consumed: usize,
    },
    Closed,
}

/// Extract the boundary token from a `Content-Type` header value.
pub fn boundary_from_content_type(content_type: &str) -> Result<String, FrameError> {
    let mut parts = content_type.split(';');
    let mime = parts.next().unwrap_or_default().trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return Err(FrameError::MissingBoundary(content_type.to_string()));
    }

    parts
        .filter_map(|param| param.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| FrameError::MissingBoundary(content_type.to_string()))
}

/// Incremental multipart frame parser, one instance per connection.
pub struct MultipartParser {
    delimiter: Vec<u8>,
    limits: ParserLimits,
    buffer: BytesMut,
    phase: Phase,
    boundary_seen: bool,
    part_start_len: usize,
    /// Completed text frame waiting to see if an image part follows
    pending: Option<RawEventFrame>,
    ready: VecDeque<RawEventFrame>,
}

impl MultipartParser {
    /// Create a parser for the given boundary token.
    pub fn new(boundary: &str, limits: ParserLimits) -> Self {
        let delimiter = format!("--{}", boundary).into_bytes();

        Self {
            delimiter,
            limits,
            buffer: BytesMut::with_capacity(8 * 1024),
            phase: Phase::SeekBoundary,
            boundary_seen: false,
            part_start_len: 0,
            pending: None,
            ready: VecDeque::new(),
        }
    }

    /// Append bytes read from the connection.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// True once the first well-formed delimiter has been read.
    pub fn boundary_seen(&self) -> bool {
        self.boundary_seen
    }

    /// True when a text frame is being held back for a possible image.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Release a held text frame without waiting for an image part.
    pub fn flush_pending(&mut self) -> Option<RawEventFrame> {
        self.pending.take()
    }

    /// True after the closing delimiter was read.
    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// Produce the next complete frame from buffered bytes, if any.
    pub fn next_frame(&mut self) -> Result<Option<RawEventFrame>, FrameError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            if !self.step()? {
                return Ok(None);
            }
        }
    }

    /// Signal a clean end of stream.
    ///
    /// Frames not yet taken, including a held text frame, are returned in
    /// order; a part cut off mid-way is discarded.
    pub fn finish(&mut self) -> Vec<RawEventFrame> {
        self.phase = Phase::Closed;
        self.buffer.clear();
        let mut frames: Vec<RawEventFrame> = self.ready.drain(..).collect();
        frames.extend(self.pending.take());
        frames
    }

    /// Advance the state machine by one step. Returns false when more input
    /// is needed.
    fn step(&mut self) -> Result<bool, FrameError> {
        match std::mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Closed => Ok(false),
            Phase::SeekBoundary => self.seek_boundary(),
            Phase::ExpectBoundary => self.expect_boundary(),
            Phase::DelimiterLine => self.delimiter_line(),
            Phase::Headers => self.headers(),
            Phase::Body {
                headers,
                length,
                consumed,
            } => self.body(headers, length, consumed),
        }
    }

    fn seek_boundary(&mut self) -> Result<bool, FrameError> {
        match find(&self.buffer, &self.delimiter) {
            Some(pos) => {
                self.part_start_len = pos;
                self.buffer.advance(pos + self.delimiter.len());
                self.phase = Phase::DelimiterLine;
                Ok(true)
            }
            None => {
                if self.buffer.len() > self.limits.boundary_window {
                    return Err(FrameError::Malformed(format!(
                        "boundary not found within {} bytes",
                        self.limits.boundary_window
                    )));
                }
                self.phase = Phase::SeekBoundary;
                Ok(false)
            }
        }
    }

    fn expect_boundary(&mut self) -> Result<bool, FrameError> {
        let skip = self
            .buffer
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        self.buffer.advance(skip);
        self.part_start_len += skip;

        let available = self.buffer.len().min(self.delimiter.len());
        if self.buffer[..available] != self.delimiter[..available] {
            return Err(FrameError::Malformed(
                "declared Content-Length does not end at a boundary".to_string(),
            ));
        }
        if available < self.delimiter.len() {
            self.phase = Phase::ExpectBoundary;
            return Ok(false);
        }

        self.buffer.advance(self.delimiter.len());
        self.phase = Phase::DelimiterLine;
        Ok(true)
    }

    fn delimiter_line(&mut self) -> Result<bool, FrameError> {
        if self.buffer.starts_with(b"--") {
            self.boundary_seen = true;
            self.ready.extend(self.pending.take());
            self.phase = Phase::Closed;
            return Ok(true);
        }

        match find(&self.buffer, b"\n") {
            Some(pos) => {
                // Transport padding after the delimiter is allowed, nothing else.
                let line = &self.buffer[..pos];
                if line.iter().any(|b| !matches!(b, b' ' | b'\t' | b'\r')) {
                    return Err(FrameError::Malformed(
                        "unexpected data after boundary".to_string(),
                    ));
                }
                self.buffer.advance(pos + 1);
                self.part_start_len += self.delimiter.len() + pos + 1;
                self.boundary_seen = true;
                self.phase = Phase::Headers;
                Ok(true)
            }
            None => {
                if self.buffer.len() > self.limits.boundary_window {
                    return Err(FrameError::Malformed(
                        "boundary line is not terminated".to_string(),
                    ));
                }
                self.phase = Phase::DelimiterLine;
                Ok(false)
            }
        }
    }

    fn headers(&mut self) -> Result<bool, FrameError> {
        let (block_len, terminator_len) = if self.buffer.starts_with(b"\r\n") {
            (0, 2)
        } else if self.buffer.starts_with(b"\n") {
            (0, 1)
        } else if let Some(pos) = find(&self.buffer, b"\r\n\r\n") {
            (pos, 4)
        } else if let Some(pos) = find(&self.buffer, b"\n\n") {
            (pos, 2)
        } else {
            if self.buffer.len() > self.limits.boundary_window {
                return Err(FrameError::Malformed(format!(
                    "header block exceeds {} bytes",
                    self.limits.boundary_window
                )));
            }
            self.phase = Phase::Headers;
            return Ok(false);
        };

        let block = String::from_utf8_lossy(&self.buffer[..block_len]).into_owned();
        self.buffer.advance(block_len + terminator_len);
        self.part_start_len += block_len + terminator_len;

        let headers: HashMap<String, String> = block
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();

        let length = match headers.get("content-length") {
            Some(raw) => {
                let length = raw.parse::<usize>().map_err(|_| {
                    FrameError::Malformed(format!("invalid Content-Length: {}", raw))
                })?;
                if length > self.limits.max_part_bytes {
                    return Err(FrameError::Malformed(format!(
                        "part of {} bytes exceeds limit of {}",
                        length, self.limits.max_part_bytes
                    )));
                }
                Some(length)
            }
            None => None,
        };

        self.phase = Phase::Body {
            headers,
            length,
            consumed: 0,
        };
        Ok(true)
    }

    fn body(
        &mut self,
        headers: HashMap<String, String>,
        length: Option<usize>,
        consumed: usize,
    ) -> Result<bool, FrameError> {
        let body = match length {
            Some(length) => {
                if self.buffer.len() < length {
                    self.phase = Phase::Body {
                        headers,
                        length: Some(length),
                        consumed,
                    };
                    return Ok(false);
                }
                let body = self.buffer.split_to(length).freeze();
                self.phase = Phase::ExpectBoundary;
                body
            }
            None => match self.delimited_body(consumed)? {
                Some(body) => body,
                None => {
                    let consumed = if consumed == 0 && self.delimiter.starts_with(&self.buffer) {
                        0
                    } else {
                        self.buffer.len()
                    };
                    self.phase = Phase::Body {
                        headers,
                        length: None,
                        consumed,
                    };
                    return Ok(false);
                }
            },
        };

        let raw_len = self.part_start_len + body.len();
        self.part_start_len = 0;
        self.complete_part(headers, body, raw_len);
        Ok(true)
    }

    /// Split off a body that runs until the next delimiter. `consumed` bytes
    /// were already scanned by an earlier call.
    fn delimited_body(&mut self, consumed: usize) -> Result<Option<Bytes>, FrameError> {
        if consumed == 0 {
            if self.buffer.starts_with(&self.delimiter) {
                // Empty body directly followed by the next delimiter.
                self.phase = Phase::SeekBoundary;
                return Ok(Some(Bytes::new()));
            }
            if self.delimiter.starts_with(&self.buffer) {
                // Could still become a bare delimiter; wait for more bytes.
                return Ok(None);
            }
        }

        let mut marker = b"\r\n".to_vec();
        marker.extend_from_slice(&self.delimiter);
        // Resume the search where the previous attempt stopped.
        let from = consumed.saturating_sub(marker.len());
        match find(&self.buffer[from..], &marker).map(|p| p + from) {
            Some(pos) => {
                let body = self.buffer.split_to(pos).freeze();
                // Leave the delimiter in place for the next step.
                self.buffer.advance(2);
                self.phase = Phase::SeekBoundary;
                Ok(Some(body))
            }
            None if self.buffer.len() > self.limits.max_part_bytes => {
                Err(FrameError::Malformed(format!(
                    "no boundary within {} bytes of part body",
                    self.limits.max_part_bytes
                )))
            }
            None => Ok(None),
        }
    }

    fn complete_part(&mut self, headers: HashMap<String, String>, body: Bytes, raw_len: usize) {
        let is_image = headers
            .get("content-type")
            .map(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"))
            .unwrap_or(false);

        if is_image {
            match self.pending.take() {
                Some(mut frame) => {
                    frame.payload = Some(body);
                    frame.raw_len += raw_len;
                    self.ready.push_back(frame);
                }
                None => {
                    self.ready.push_back(RawEventFrame {
                        part_headers: headers,
                        fields: HashMap::new(),
                        payload: Some(body),
                        raw_len,
                    });
                }
            }
            return;
        }

        let frame = RawEventFrame {
            fields: parse_fields(&body),
            part_headers: headers,
            payload: None,
            raw_len,
        };

        if frame.fields.is_empty() {
            // Heartbeats never carry attachments and do not separate a held
            // frame from its image; emit right away.
            self.ready.push_back(frame);
            return;
        }

        // A new text part releases the previously held one.
        self.ready.extend(self.pending.take());
        self.pending = Some(frame);
    }
}

/// Parse `key=value` pairs separated by line breaks or `;`.
///
/// A `data` key swallows the rest of its line since it holds JSON.
pub fn parse_fields(body: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(body);
    let mut fields = HashMap::new();

    for line in text.lines() {
        let mut rest = line.trim();
        while !rest.is_empty() {
            let (pair, tail) = if rest.starts_with("data=") {
                (rest, "")
            } else {
                match rest.split_once(';') {
                    Some((pair, tail)) => (pair, tail),
                    None => (rest, ""),
                }
            };

            if let Some((key, value)) = pair.split_once('=') {
                let key = key.trim();
                if !key.is_empty() {
                    fields.insert(key.to_string(), value.trim().to_string());
                }
            }
            rest = tail.trim_start();
        }
    }

    fields
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
