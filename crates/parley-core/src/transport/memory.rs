//! In-process transport and signaling.
//!
//! A [`MemoryHub`] connects any number of local users. Each user joins once
//! and gets a [`MemoryPeer`]: a transport adapter, a signaling bus and the
//! receiving end of its event queue. Channels are open as soon as both ends
//! have called [`TransportAdapter::open`]; frames are delivered in order as
//! [`EngineEvent::ChannelMessage`]s.
//!
//! Delivery is immediate, so a channel has no send queue of its own. Its
//! buffered amount is whatever was last set through
//! [`MemoryHub::set_buffered_amount`], which lets hosts simulate a congested
//! link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::{
    ChannelHandle, DataChannel, EngineEvent, EventReceiver, EventSender, SignalingBus,
    TransportAdapter,
};
use crate::error::{Error, Result};
use crate::protocol::{ChannelMessage, SignalEnvelope};
use crate::transfer::{RequestId, UserId};

#[derive(Debug, Default)]
struct HubInner {
    mailboxes: HashMap<UserId, EventSender>,
    channels: HashMap<RequestId, HashMap<UserId, Arc<MemoryChannel>>>,
}

/// Shared switchboard for in-process peers.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

/// Everything one user needs to run an engine on a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryPeer {
    /// Transport adapter for the engine
    pub transport: MemoryTransport,
    /// Signaling bus for the engine
    pub signaling: MemorySignaling,
    /// Events addressed to this user
    pub events: EventReceiver,
    /// Sender feeding `events`
    pub sender: EventSender,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` and return its adapters.
    #[must_use]
    pub fn join(&self, user: impl Into<UserId>) -> MemoryPeer {
        let user = user.into();
        let (sender, events) = mpsc::unbounded_channel();
        self.lock().mailboxes.insert(user.clone(), sender.clone());

        MemoryPeer {
            transport: MemoryTransport {
                user: user.clone(),
                hub: self.clone(),
            },
            signaling: MemorySignaling {
                hub: self.clone(),
            },
            events,
            sender,
        }
    }

    /// Report `bytes` as queued on `user`'s end of the channel for
    /// `request_id`. Returns `false` if that end is not open.
    pub fn set_buffered_amount(&self, request_id: RequestId, user: &str, bytes: u64) -> bool {
        let end = self
            .lock()
            .channels
            .get(&request_id)
            .and_then(|ends| ends.get(user).cloned());
        let Some(end) = end else {
            return false;
        };
        end.buffered.store(bytes, Ordering::Release);
        true
    }

    /// Number of requests with at least one open channel end.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, user: &UserId, event: EngineEvent) -> Result<()> {
        let inner = self.lock();
        let mailbox = inner
            .mailboxes
            .get(user)
            .ok_or_else(|| Error::ChannelSend(format!("user '{user}' is not connected")))?;
        mailbox
            .send(event)
            .map_err(|_| Error::ChannelSend(format!("user '{user}' stopped listening")))
    }

    fn detach(&self, request_id: RequestId, user: &UserId) {
        let mut inner = self.lock();
        if let Some(ends) = inner.channels.get_mut(&request_id) {
            ends.remove(user);
            if ends.is_empty() {
                inner.channels.remove(&request_id);
            }
        }
    }
}

/// One end of an in-process channel.
#[derive(Debug)]
pub struct MemoryChannel {
    request_id: RequestId,
    owner: UserId,
    peer: UserId,
    hub: MemoryHub,
    closed: AtomicBool,
    bytes_sent: AtomicU64,
    buffered: AtomicU64,
}

impl MemoryChannel {
    /// Total binary bytes sent from this end.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::ChannelSend("channel is closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn send_message(&self, message: ChannelMessage) -> Result<()> {
        self.ensure_open()?;
        self.hub.deliver(
            &self.peer,
            EngineEvent::ChannelMessage {
                request_id: self.request_id,
                message,
            },
        )
    }
}

impl DataChannel for MemoryChannel {
    fn send_text(&self, text: &str) -> Result<()> {
        self.send_message(ChannelMessage::Text(text.to_string()))
    }

    fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send_message(ChannelMessage::Binary(data.to_vec()))?;
        self.bytes_sent
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.detach(self.request_id, &self.owner);

        let peer_open = self
            .hub
            .lock()
            .channels
            .get(&self.request_id)
            .and_then(|ends| ends.get(&self.peer))
            .is_some_and(|end| !end.closed.load(Ordering::Acquire));
        if peer_open {
            let _ = self.hub.deliver(
                &self.peer,
                EngineEvent::ChannelClosed {
                    request_id: self.request_id,
                    reason: Some("closed by peer".to_string()),
                },
            );
        }
    }
}

/// [`TransportAdapter`] backed by a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryTransport {
    user: UserId,
    hub: MemoryHub,
}

impl TransportAdapter for MemoryTransport {
    fn open(
        &mut self,
        request_id: RequestId,
        counterpart: &UserId,
        _initiator: bool,
    ) -> Result<ChannelHandle> {
        let channel = Arc::new(MemoryChannel {
            request_id,
            owner: self.user.clone(),
            peer: counterpart.clone(),
            hub: self.hub.clone(),
            closed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
        });

        let both_ready = {
            let mut inner = self.hub.lock();
            let ends = inner.channels.entry(request_id).or_default();
            if ends.contains_key(&self.user) {
                return Err(Error::ChannelOpenFailed(format!(
                    "channel for {request_id} already open"
                )));
            }
            ends.insert(self.user.clone(), Arc::clone(&channel));
            ends.contains_key(counterpart)
        };

        if both_ready {
            tracing::debug!(request_id = %request_id, "Memory channel connected");
            self.hub
                .deliver(&self.user, EngineEvent::ChannelOpened { request_id })?;
            self.hub
                .deliver(counterpart, EngineEvent::ChannelOpened { request_id })?;
        }

        Ok(channel)
    }

    fn apply_remote_signal(&mut self, _request_id: RequestId, _blob: &[u8]) -> Result<()> {
        Ok(())
    }

    fn close(&mut self, request_id: RequestId) {
        let channel = self
            .hub
            .lock()
            .channels
            .get(&request_id)
            .and_then(|ends| ends.get(&self.user).cloned());
        if let Some(channel) = channel {
            channel.close();
        }
    }
}

/// [`SignalingBus`] backed by a [`MemoryHub`].
#[derive(Debug)]
pub struct MemorySignaling {
    hub: MemoryHub,
}

impl SignalingBus for MemorySignaling {
    fn send(&mut self, envelope: SignalEnvelope) -> Result<()> {
        let to = envelope.to_user.clone();
        self.hub.deliver(&to, EngineEvent::Signal(envelope))
    }
}
