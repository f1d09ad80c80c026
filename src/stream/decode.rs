//! Incremental frame decoder (Bytes -> deltas).

use super::{DeltaSink, StreamError};
use crate::BoxStream;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

const DELIMITER: &[u8] = b"\n\n";
const DONE_MARKER: &str = "data: [DONE]";
const SNIPPET_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Payload carrying the cumulative text so far.
    Data { cumulative: String },
    Done,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPhase {
    AwaitingFrame,
    EmittingDelta,
    Done,
    Errored,
}

fn snippet(s: &str) -> String {
    s.chars().take(SNIPPET_LEN).collect()
}

/// Classify one trimmed frame. Blank frames yield `None`.
pub fn parse_frame(raw: &str) -> Result<Option<StreamFrame>, StreamError> {
    let frame = raw.trim();
    if frame.is_empty() {
        return Ok(None);
    }
    if let Some(message) = frame.strip_prefix("error:") {
        return Ok(Some(StreamFrame::Error(message.trim().to_string())));
    }
    if frame.starts_with(DONE_MARKER) {
        return Ok(Some(StreamFrame::Done));
    }
    if let Some(payload) = frame.strip_prefix("data:").map(str::trim_start) {
        if payload.starts_with('{') {
            let value: Value = serde_json::from_str(payload)
                .map_err(|e| StreamError::InvalidJson(format!("{}: {}", e, snippet(payload))))?;
            if let Some(exception) = value.get("exception").filter(|v| !v.is_null()) {
                let message = match exception {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                return Ok(Some(StreamFrame::Error(message)));
            }
            if let Some(Value::String(text)) = value.get("completion") {
                return Ok(Some(StreamFrame::Data {
                    cumulative: text.clone(),
                }));
            }
        }
    }
    Err(StreamError::UnexpectedFrame(snippet(frame)))
}

/// Decoder state owned by a single decode run.
#[derive(Debug)]
pub struct StreamState {
    buffer: Vec<u8>,
    last_cumulative: String,
    phase: DecoderPhase,
    done_seen: bool,
    /// Bytes of `buffer` already searched for a delimiter.
    scanned: usize,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            last_cumulative: String::new(),
            phase: DecoderPhase::AwaitingFrame,
            done_seen: false,
            scanned: 0,
        }
    }

    pub fn phase(&self) -> DecoderPhase {
        self.phase
    }

    pub fn last_cumulative(&self) -> &str {
        &self.last_cumulative
    }

    /// Whether a `[DONE]` marker has been received.
    pub fn done_seen(&self) -> bool {
        self.done_seen
    }

    fn ensure_live(&self) -> Result<(), StreamError> {
        match self.phase {
            DecoderPhase::Errored => Err(StreamError::Errored),
            _ => Ok(()),
        }
    }

    /// Feed one chunk and emit the deltas of every frame it completes.
    pub fn push<S>(&mut self, chunk: &[u8], sink: &mut S) -> Result<(), StreamError>
    where
        S: DeltaSink + ?Sized,
    {
        self.ensure_live()?;
        self.buffer.extend_from_slice(chunk);
        let result = self.drain_frames(sink, true);
        self.record_failure(result)
    }

    fn record_failure<T>(&mut self, result: Result<T, StreamError>) -> Result<T, StreamError> {
        if let Err(ref e) = result {
            warn!(error = %e, "stream decode failed");
            self.phase = DecoderPhase::Errored;
        }
        result
    }

    fn strip_leading_newlines(&mut self) {
        let n = self
            .buffer
            .iter()
            .take_while(|b| **b == b'\n' || **b == b'\r')
            .count();
        if n > 0 {
            self.buffer.drain(..n);
            self.scanned = self.scanned.saturating_sub(n);
        }
    }

    /// Search for the next delimiter, resuming where the previous search
    /// stopped so a frame arriving in many small chunks is scanned once.
    fn next_delimiter(&mut self) -> Option<usize> {
        let start = self.scanned.min(self.buffer.len());
        match find(&self.buffer[start..], DELIMITER) {
            Some(offset) => Some(start + offset),
            None => {
                self.scanned = self.buffer.len().saturating_sub(DELIMITER.len() - 1);
                None
            }
        }
    }

    /// Extract and handle every complete frame in the buffer. With
    /// `stop_at_done`, frames after a `[DONE]` stay buffered.
    fn drain_frames<S>(&mut self, sink: &mut S, stop_at_done: bool) -> Result<(), StreamError>
    where
        S: DeltaSink + ?Sized,
    {
        loop {
            self.strip_leading_newlines();
            let Some(pos) = self.next_delimiter() else {
                return Ok(());
            };
            let frame: Vec<u8> = self.buffer.drain(..pos + DELIMITER.len()).take(pos).collect();
            self.scanned = 0;
            let text = std::str::from_utf8(&frame).map_err(|_| StreamError::InvalidUtf8)?;

            match parse_frame(text)? {
                None => continue,
                Some(StreamFrame::Error(message)) => return Err(StreamError::Upstream(message)),
                Some(StreamFrame::Done) => {
                    self.done_seen = true;
                    if stop_at_done {
                        // Later frames wait for the next chunk or for end of stream.
                        return Ok(());
                    }
                }
                Some(StreamFrame::Data { cumulative }) => self.emit(cumulative, &mut *sink)?,
            }
        }
    }

    fn emit<S>(&mut self, cumulative: String, sink: &mut S) -> Result<(), StreamError>
    where
        S: DeltaSink + ?Sized,
    {
        let Some(delta) = cumulative.strip_prefix(self.last_cumulative.as_str()) else {
            return Err(StreamError::PrefixViolation {
                previous_len: self.last_cumulative.len(),
                received: snippet(&cumulative),
            });
        };
        self.phase = DecoderPhase::EmittingDelta;
        sink.on_delta(delta, &cumulative)?;
        self.last_cumulative = cumulative;
        self.phase = DecoderPhase::AwaitingFrame;
        Ok(())
    }

    /// Signal end of stream and take the final text.
    ///
    /// Complete frames still buffered (for example behind a `[DONE]` in the
    /// last chunk) are decoded first. Anything but whitespace left after that
    /// means the stream was cut mid-frame; the one exception is a closing
    /// `[DONE]` marker sent without its trailing blank line.
    pub fn finish<S>(&mut self, sink: &mut S) -> Result<String, StreamError>
    where
        S: DeltaSink + ?Sized,
    {
        self.ensure_live()?;
        let drained = self.drain_frames(sink, false);
        self.record_failure(drained)?;
        let rest = String::from_utf8_lossy(&self.buffer).trim().to_string();
        if !rest.is_empty() {
            if rest == DONE_MARKER {
                self.done_seen = true;
            } else {
                warn!(leftover = %snippet(&rest), "stream ended mid-frame");
                self.phase = DecoderPhase::Errored;
                return Err(StreamError::Truncated(snippet(&rest)));
            }
        }
        self.buffer.clear();
        self.scanned = 0;
        self.phase = DecoderPhase::Done;
        debug!(
            bytes = self.last_cumulative.len(),
            done_marker = self.done_seen,
            "stream complete"
        );
        Ok(std::mem::take(&mut self.last_cumulative))
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Drives a [`StreamState`] over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamDecoder;

impl StreamDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode the whole stream, invoking `sink` per delta, and return the final text.
    pub async fn decode<S>(
        &self,
        mut input: BoxStream<'_, Bytes>,
        sink: &mut S,
    ) -> Result<String, StreamError>
    where
        S: DeltaSink + ?Sized,
    {
        let mut state = StreamState::new();
        while let Some(chunk) = input.next().await {
            let bytes = chunk.map_err(|e| StreamError::Transport(e.to_string()))?;
            state.push(&bytes, &mut *sink)?;
        }
        state.finish(sink)
    }
}
