//! Streamed response decoding.
//!
//! Providers that stream completions send blank-line-delimited frames whose
//! `completion` field carries the *whole* text generated so far. The decoder
//! turns those cumulative snapshots back into ordered deltas, hands each one
//! to a [`DeltaSink`] as soon as its frame is complete, and returns the final
//! text once the stream ends cleanly.
//!
//! ```text
//! data: {"completion":"Hi"}          -> sink("Hi", "Hi")
//!
//! data: {"completion":"Hi there"}    -> sink(" there", "Hi there")
//!
//! data: [DONE]                       -> decode() returns "Hi there"
//! ```

pub mod decode;

pub use decode::{parse_frame, DecoderPhase, StreamDecoder, StreamFrame, StreamState};

/// Stream protocol violations. Any of these discards the partial response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("upstream reported an error: {0}")]
    Upstream(String),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("frame payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("cumulative text does not extend the previous {previous_len} bytes: {received:?}")]
    PrefixViolation { previous_len: usize, received: String },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("stream ended with unprocessed data: {0}")]
    Truncated(String),

    #[error("stream transport failed: {0}")]
    Transport(String),

    #[error("delta sink rejected output: {0}")]
    Sink(String),

    #[error("decoder already failed")]
    Errored,
}

/// Receives deltas synchronously, in arrival order.
pub trait DeltaSink: Send {
    fn on_delta(&mut self, delta: &str, cumulative: &str) -> Result<(), StreamError>;
}

impl<F> DeltaSink for F
where
    F: FnMut(&str, &str) + Send,
{
    fn on_delta(&mut self, delta: &str, cumulative: &str) -> Result<(), StreamError> {
        self(delta, cumulative);
        Ok(())
    }
}

/// Discards every delta.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DeltaSink for NoopSink {
    fn on_delta(&mut self, _: &str, _: &str) -> Result<(), StreamError> {
        Ok(())
    }
}
