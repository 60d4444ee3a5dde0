//! Wire messages exchanged between peers.
//!
//! Two planes are involved in a transfer:
//!
//! - **Signaling**: [`SignalEnvelope`]s carried by the external encrypted
//!   message bus. They announce requests, answers and opaque
//!   connection-establishment blobs.
//! - **In-band**: once the data channel is up, small JSON [`ControlFrame`]s
//!   travel as text messages and everything else is raw chunk data.
//!
//! ## Control frames
//!
//! | Frame | Direction | Meaning |
//! |-------|-----------|---------|
//! | `meta` | up → down | size and hash of what follows |
//! | `done` | up → down | no more bytes will be sent |
//! | `flow_pause` | down → up | stop sending |
//! | `flow_resume` | down → up | continue sending |

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transfer::{AttachmentId, RequestId, UserId};

/// Control message sent as a text frame on the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Declares the content about to be streamed
    Meta {
        /// File name
        file_name: String,
        /// Total bytes that will follow
        size_bytes: u64,
        /// Lowercase hex SHA-256 of the content
        content_hash: String,
    },
    /// End of transfer
    Done,
    /// Receiver backlog is high
    FlowPause,
    /// Receiver backlog has drained
    FlowResume,
}

impl ControlFrame {
    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolError`] for anything that is not a known frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::ProtocolError(format!("bad frame: {e}")))
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Meta { .. } => "meta",
            Self::Done => "done",
            Self::FlowPause => "flow_pause",
            Self::FlowResume => "flow_resume",
        }
    }
}

/// A message received from a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Text frame (control plane)
    Text(String),
    /// Binary frame (chunk data)
    Binary(Vec<u8>),
}

/// Payload of a signaling message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Downloader asks for an attachment
    TransferRequest {
        /// Attachment wanted
        attachment_id: AttachmentId,
    },
    /// Uploader answers a request
    TransferResponse {
        /// Whether the uploader will serve the content
        accepted: bool,
    },
    /// Opaque connection-establishment data for the transport
    TransferSignal {
        /// Blob produced by the remote transport adapter
        blob: Vec<u8>,
    },
}

/// Signaling message keyed by request and counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Request the message belongs to
    pub request_id: RequestId,
    /// Sending user
    pub from_user: UserId,
    /// Receiving user
    pub to_user: UserId,
    /// Message body
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    /// Create an envelope.
    #[must_use]
    pub fn new(
        request_id: RequestId,
        from_user: impl Into<UserId>,
        to_user: impl Into<UserId>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            request_id,
            from_user: from_user.into(),
            to_user: to_user.into(),
            payload,
        }
    }
}
