//! Transport and signaling seams.
//!
//! The engine never talks to a network directly. It consumes three
//! collaborators supplied by the host application:
//!
//! - [`TransportAdapter`] opens one ordered point-to-point [`DataChannel`]
//!   per transfer request.
//! - [`SignalingBus`] delivers [`SignalEnvelope`]s over the encrypted chat
//!   message bus.
//! - Both report what happens on their side by pushing [`EngineEvent`]s into
//!   the engine's event queue.
//!
//! [`memory`] provides an in-process implementation of all three.

pub mod memory;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{ChannelMessage, SignalEnvelope};
use crate::transfer::{RequestId, UserId};

/// An established, ordered byte channel for one transfer request.
pub trait DataChannel: Send + Sync + std::fmt::Debug {
    /// Send a text (control) frame.
    fn send_text(&self, text: &str) -> Result<()>;

    /// Send a binary (chunk) frame.
    fn send_binary(&self, data: &[u8]) -> Result<()>;

    /// Bytes queued locally and not yet handed to the network.
    fn buffered_amount(&self) -> u64;

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// Shared handle to a data channel.
pub type ChannelHandle = Arc<dyn DataChannel>;

/// Establishes data channels.
pub trait TransportAdapter: Send {
    /// Start establishing the channel for `request_id` with `counterpart`.
    ///
    /// The returned handle may not be usable until
    /// [`EngineEvent::ChannelOpened`] is delivered for the request.
    fn open(
        &mut self,
        request_id: RequestId,
        counterpart: &UserId,
        initiator: bool,
    ) -> Result<ChannelHandle>;

    /// Feed a connection-establishment blob received from the peer.
    fn apply_remote_signal(&mut self, request_id: RequestId, blob: &[u8]) -> Result<()>;

    /// Release everything held for `request_id`.
    fn close(&mut self, request_id: RequestId);
}

/// Sends signaling messages to other users.
pub trait SignalingBus: Send {
    /// Deliver an envelope to `envelope.to_user`.
    fn send(&mut self, envelope: SignalEnvelope) -> Result<()>;
}

/// Everything that can happen to the engine from the outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A signaling message arrived for the local user
    Signal(SignalEnvelope),
    /// The data channel for a request is open
    ChannelOpened {
        /// Request the channel belongs to
        request_id: RequestId,
    },
    /// A frame arrived on a data channel
    ChannelMessage {
        /// Request the channel belongs to
        request_id: RequestId,
        /// The frame
        message: ChannelMessage,
    },
    /// A data channel closed or failed
    ChannelClosed {
        /// Request the channel belongs to
        request_id: RequestId,
        /// Transport-provided reason, if any
        reason: Option<String>,
    },
    /// The local transport produced a blob the peer needs
    LocalSignal {
        /// Request being established
        request_id: RequestId,
        /// User the blob must reach
        counterpart: UserId,
        /// Opaque blob
        blob: Vec<u8>,
    },
}

impl EngineEvent {
    /// Request the event refers to.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        match self {
            Self::Signal(envelope) => envelope.request_id,
            Self::ChannelOpened { request_id }
            | Self::ChannelMessage { request_id, .. }
            | Self::ChannelClosed { request_id, .. }
            | Self::LocalSignal { request_id, .. } => *request_id,
        }
    }
}

/// Sending half of the engine's event queue, handed to adapters.
pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Receiving half of the engine's event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;
