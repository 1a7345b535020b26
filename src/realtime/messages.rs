use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Frame sent to the realtime server
///
/// Audio frames carry base64-encoded bytes in `data`; a commit-only frame
/// omits `data` entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Audio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit: Option<bool>,
    },
    Text {
        data: String,
    },
}

/// Frame received from the realtime server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Audio {
        #[serde(default)]
        data: Option<String>,
    },
    Text {
        #[serde(default)]
        data: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        data: Option<String>,
    },
    AudioDone,
}

/// Message queued for delivery to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text { body: String },
    AudioChunk { payload: Vec<u8>, commit: bool },
}

impl OutboundMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// Uncommitted audio chunk
    pub fn audio(payload: Vec<u8>) -> Self {
        Self::AudioChunk {
            payload,
            commit: false,
        }
    }

    /// Empty audio frame asking the server to commit its input buffer
    pub fn commit() -> Self {
        Self::AudioChunk {
            payload: Vec::new(),
            commit: true,
        }
    }
}

/// Message decoded from a server frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Audio { payload: Vec<u8> },
    AudioDone,
    Text { body: String },
    Error { detail: String },
}

impl From<&OutboundMessage> for ClientFrame {
    fn from(message: &OutboundMessage) -> Self {
        match message {
            OutboundMessage::Text { body } => ClientFrame::Text { data: body.clone() },
            OutboundMessage::AudioChunk { payload, commit } => ClientFrame::Audio {
                data: (!payload.is_empty() || !commit)
                    .then(|| base64::engine::general_purpose::STANDARD.encode(payload)),
                commit: commit.then_some(true),
            },
        }
    }
}

impl TryFrom<ServerFrame> for InboundMessage {
    type Error = CodecError;

    fn try_from(frame: ServerFrame) -> Result<Self, CodecError> {
        let message = match frame {
            ServerFrame::Audio { data } => {
                let data = data.ok_or(CodecError::MissingField {
                    kind: "audio",
                    field: "data",
                })?;
                InboundMessage::Audio {
                    payload: base64::engine::general_purpose::STANDARD.decode(data)?,
                }
            }
            ServerFrame::Text { data } => InboundMessage::Text {
                body: data.ok_or(CodecError::MissingField {
                    kind: "text",
                    field: "data",
                })?,
            },
            // Some servers put the error text in `data`
            ServerFrame::Error { message, data } => InboundMessage::Error {
                detail: message.or(data).ok_or(CodecError::MissingField {
                    kind: "error",
                    field: "message",
                })?,
            },
            ServerFrame::AudioDone => InboundMessage::AudioDone,
        };

        Ok(message)
    }
}

/// Serialize an outbound message into a JSON text frame
pub fn encode(message: &OutboundMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&ClientFrame::from(message))?)
}

/// Parse a JSON text frame into an inbound message
///
/// Either the whole frame is understood or an error is returned; there is
/// no partially decoded result.
pub fn decode(frame: &str) -> Result<InboundMessage, CodecError> {
    let frame: ServerFrame = serde_json::from_str(frame)?;
    frame.try_into()
}
