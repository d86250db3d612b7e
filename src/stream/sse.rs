//! SSE line scanning, frame splitting and frame encoding.
//!
//! Upstream bodies are read through a bounded, growable buffer. The
//! translation path consumes payload lines; the passthrough path consumes
//! whole frames and forwards them untouched.
use std::fmt::Display;
use std::sync::LazyLock;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use memchr::{memchr, memchr_iter, memmem};

use crate::error::RelayError;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

const DATA_PREFIX: &[u8] = b"data:";
const DONE_MARKER: &[u8] = b"[DONE]";
/// Lines shorter than this cannot hold a data frame or the done marker.
const MIN_LINE_LEN: usize = 6;

/// Buffer limits for reading upstream bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerLimits {
    pub initial_capacity: usize,
    pub max_line_bytes: usize,
}

impl Default for ScannerLimits {
    fn default() -> Self {
        Self {
            initial_capacity: 64 * 1024,
            max_line_bytes: 64 * 1024 * 1024,
        }
    }
}

/// One meaningful line of an upstream SSE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannedLine {
    Payload(String),
    Done,
}

/// Classify a raw line: `None` for lines that carry nothing.
#[must_use]
pub fn classify_line(line: &[u8]) -> Option<ScannedLine> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.len() < MIN_LINE_LEN {
        return None;
    }
    let payload = if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
        rest
    } else if line.starts_with(DONE_MARKER) {
        line
    } else {
        return None;
    };
    let payload = String::from_utf8_lossy(payload);
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Some(ScannedLine::Done);
    }
    if payload.is_empty() {
        return None;
    }
    Some(ScannedLine::Payload(payload.to_string()))
}

/// Incremental newline splitter over a growable byte buffer.
#[derive(Debug)]
pub struct LineScanner {
    buffer: BytesMut,
    scan_from: usize,
    max_line_bytes: usize,
}

impl LineScanner {
    #[must_use]
    pub fn new(limits: ScannerLimits) -> Self {
        Self {
            buffer: BytesMut::with_capacity(limits.initial_capacity.min(limits.max_line_bytes)),
            scan_from: 0,
            max_line_bytes: limits.max_line_bytes,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete line, without its terminator.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BadResponseBody`] when a line grows past the cap.
    pub fn next_line(&mut self) -> Result<Option<Bytes>, RelayError> {
        if let Some(rel) = memchr(b'\n', &self.buffer[self.scan_from..]) {
            let end = self.scan_from + rel;
            let mut line = self.buffer.split_to(end + 1);
            line.truncate(end);
            self.scan_from = 0;
            if line.len() > self.max_line_bytes {
                return Err(line_too_long(self.max_line_bytes));
            }
            return Ok(Some(line.freeze()));
        }
        self.scan_from = self.buffer.len();
        if self.buffer.len() > self.max_line_bytes {
            return Err(line_too_long(self.max_line_bytes));
        }
        Ok(None)
    }

    /// Take whatever is left once the body ended without a final newline.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scan_from = 0;
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }
}

fn line_too_long(cap: usize) -> RelayError {
    RelayError::BadResponseBody(format!("upstream line exceeds {cap} bytes"))
}

fn read_error(err: impl Display) -> RelayError {
    RelayError::BadResponseBody(format!("failed to read upstream body: {err}"))
}

struct ScanState<S> {
    body: std::pin::Pin<Box<S>>,
    scanner: LineScanner,
    finished: bool,
}

/// Turn an upstream body into a stream of payload lines.
///
/// The stream ends after `[DONE]` or at end of body. A read error or an
/// over-long line yields one `Err` and then ends.
pub fn payload_line_stream<S, E>(
    body: S,
    limits: ScannerLimits,
) -> impl Stream<Item = Result<ScannedLine, RelayError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = ScanState {
        body: Box::pin(body),
        scanner: LineScanner::new(limits),
        finished: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            match state.scanner.next_line() {
                Ok(Some(line)) => {
                    if let Some(scanned) = classify_line(&line) {
                        if scanned == ScannedLine::Done {
                            state.finished = true;
                        }
                        return Some((Ok(scanned), state));
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
            }
            match state.body.as_mut().next().await {
                Some(Ok(chunk)) => state.scanner.push(&chunk),
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(read_error(err)), state));
                }
                None => {
                    state.finished = true;
                    let tail = state.scanner.finish()?;
                    let scanned = classify_line(&tail)?;
                    return Some((Ok(scanned), state));
                }
            }
        }
    })
}

#[inline]
fn find_frame_terminator_from(buffer: &[u8], scan_from: usize) -> Option<(usize, usize)> {
    static LF_LF_FINDER: LazyLock<memmem::Finder<'static>> =
        LazyLock::new(|| memmem::Finder::new(b"\n\n"));
    static CRLF_CRLF_FINDER: LazyLock<memmem::Finder<'static>> =
        LazyLock::new(|| memmem::Finder::new(b"\r\n\r\n"));

    let scan_from = scan_from.min(buffer.len());
    let haystack = &buffer[scan_from..];
    let lf_lf_pos = LF_LF_FINDER.find(haystack).map(|rel| scan_from + rel);
    let crlf_crlf_pos = CRLF_CRLF_FINDER.find(haystack).map(|rel| scan_from + rel);

    match (lf_lf_pos, crlf_crlf_pos) {
        (Some(lf_pos), Some(crlf_pos)) => {
            if lf_pos <= crlf_pos {
                Some((lf_pos, 2))
            } else {
                Some((crlf_pos, 4))
            }
        }
        (Some(lf_pos), None) => Some((lf_pos, 2)),
        (None, Some(crlf_pos)) => Some((crlf_pos, 4)),
        (None, None) => None,
    }
}

struct FrameState<S> {
    body: std::pin::Pin<Box<S>>,
    buffer: BytesMut,
    scan_from: usize,
    max_frame_bytes: usize,
    finished: bool,
}

/// Split an upstream body into raw SSE frames, each including its
/// blank-line separator, for byte-exact forwarding.
pub fn raw_frame_stream<S, E>(
    body: S,
    limits: ScannerLimits,
) -> impl Stream<Item = Result<Bytes, RelayError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = FrameState {
        body: Box::pin(body),
        buffer: BytesMut::with_capacity(limits.initial_capacity.min(limits.max_line_bytes)),
        scan_from: 0,
        max_frame_bytes: limits.max_line_bytes,
        finished: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            if let Some((start, len)) = find_frame_terminator_from(&state.buffer, state.scan_from)
            {
                let frame = state.buffer.split_to(start + len).freeze();
                state.scan_from = 0;
                return Some((Ok(frame), state));
            }
            if state.buffer.len() > state.max_frame_bytes {
                state.finished = true;
                return Some((Err(line_too_long(state.max_frame_bytes)), state));
            }
            // Keep a small overlap so terminators split across chunks are found.
            state.scan_from = state.buffer.len().saturating_sub(3);
            match state.body.as_mut().next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(read_error(err)), state));
                }
                None => {
                    state.finished = true;
                    if state.buffer.is_empty() {
                        return None;
                    }
                    let frame = state.buffer.split().freeze();
                    return Some((Ok(frame), state));
                }
            }
        }
    })
}

/// A parsed SSE frame: optional event name and joined data lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse the fields of one raw frame.
///
/// - `event:` sets the event name
/// - `data:` lines are joined with `\n` (one leading space stripped)
/// - comment lines and unknown fields are ignored
#[must_use]
pub fn parse_frame(raw: &[u8]) -> Option<SseEvent> {
    let mut event = None;
    let mut data = String::new();
    let mut has_data = false;
    let mut line_start = 0usize;
    let mut handle = |line: &[u8]| {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = String::from_utf8_lossy(line);
        if let Some(value) = text.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if has_data {
                data.push('\n');
            }
            has_data = true;
            data.push_str(value);
        } else if let Some(value) = text.strip_prefix("event:") {
            event = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    };
    for pos in memchr_iter(b'\n', raw) {
        handle(&raw[line_start..pos]);
        line_start = pos + 1;
    }
    if line_start < raw.len() {
        handle(&raw[line_start..]);
    }
    if has_data || event.is_some() {
        Some(SseEvent { event, data })
    } else {
        None
    }
}

/// Encode an unnamed data frame.
#[must_use]
pub fn data_frame(json: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(8 + json.len());
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(json);
    out.extend_from_slice(b"\n\n");
    out.freeze()
}

/// Encode a named frame (`event: ...` then `data: ...`).
#[must_use]
pub fn event_frame(event: &str, json: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(18 + event.len() + json.len());
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(event.as_bytes());
    out.extend_from_slice(b"\ndata: ");
    out.extend_from_slice(json);
    out.extend_from_slice(b"\n\n");
    out.freeze()
}

#[must_use]
pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME)
}
