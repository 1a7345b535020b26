//! Error types for the realtime transport and the chunk streamer.
//!
//! Per-frame and per-cycle failures are logged and absorbed where they
//! happen. Only the variants below ever reach a caller.

use thiserror::Error;

/// Failure to encode or decode a single wire frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame is not valid JSON or does not match the envelope.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    /// An audio payload was not valid base64.
    #[error("invalid audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A frame of a known type lacked a field it requires.
    #[error("{kind} frame is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Terminal transport conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The retry budget ran out; no further reconnects will be attempted.
    #[error("connection failed after {attempts} consecutive attempts")]
    RetriesExhausted { attempts: u32 },

    /// The client's driver task has stopped and accepts no more commands.
    #[error("transport client has shut down")]
    Shutdown,
}

/// Conditions that end a streaming run.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The source reported fewer bytes than it did previously.
    #[error("source length decreased from {previous} to {current} bytes")]
    SourceShrank { previous: u64, current: u64 },

    /// A read did not line up with the cursor, so bytes would be duplicated or skipped.
    #[error("chunk read at {offset} returned {returned} bytes, expected {expected} at cursor {position}")]
    Overlap {
        offset: u64,
        position: u64,
        expected: u64,
        returned: u64,
    },

    /// The sink can no longer accept chunks.
    #[error("chunk sink closed: {0}")]
    SinkClosed(#[from] TransportError),
}

/// Why a session was torn down without being asked to.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("capture streaming failed: {0}")]
    Stream(#[from] StreamError),
}
