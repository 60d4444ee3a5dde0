//! Upload session pool.
//!
//! Every attachment being served has exactly one [`session`], shared by all
//! requests for it, so N concurrent downloaders cost one read stream and one
//! bounded cache. At most `max_running` sessions pump at a time; the rest
//! wait in arrival order for a slot.
//!
//! ## Pump iteration
//!
//! 1. Send the `meta` frame to subscribers that have not received it.
//! 2. Read one chunk at the lowest offset an active subscriber still needs,
//!    if the cache budget allows.
//! 3. Send cached chunks to each ready, unpaused subscriber while its channel
//!    is under the high-water mark.
//! 4. Send `done` to subscribers that reached the end and drop them.
//! 5. Evict blocks behind every remaining subscriber.
//!
//! A session with no subscribers left is torn down immediately. A session
//! making no progress for `idle_timeout` fails all of its subscribers.

mod session;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use session::UploadSession;

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::storage::ContentSource;
use crate::transfer::{AttachmentId, AttachmentMeta, RequestId};
use crate::transport::ChannelHandle;

/// Limits applied to every session.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Bytes per content read
    pub chunk_size: usize,
    /// Cache budget per session
    pub cache_budget: u64,
    /// Channel buffered amount at which sending stops
    pub high_water: u64,
    /// Session-wide no-progress timeout
    pub idle_timeout: Duration,
    /// Sessions pumping at once
    pub max_running: usize,
}

impl From<&TransferConfig> for PoolSettings {
    fn from(config: &TransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            cache_budget: config.session_cache_bytes,
            high_water: config.channel_high_water,
            idle_timeout: config.idle_timeout,
            max_running: config.max_running_sessions,
        }
    }
}

/// Something that happened to a subscriber during [`UploadSessionPool::pump`].
#[derive(Debug)]
pub enum PumpOutcome {
    /// Chunks were sent
    Progress {
        /// Subscriber
        request_id: RequestId,
        /// Bytes sent so far
        sent: u64,
        /// Content size
        total: u64,
        /// Channel buffered amount after sending
        buffered: u64,
    },
    /// Every byte and the `done` frame were sent; the subscriber is gone
    Completed {
        /// Subscriber
        request_id: RequestId,
    },
    /// The subscriber was dropped because of an error
    Failed {
        /// Subscriber
        request_id: RequestId,
        /// Cause
        error: Error,
    },
}

/// Observable state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes held in the read-ahead cache
    pub cache_bytes: u64,
    /// Subscribers attached
    pub subscribers: usize,
    /// Highest offset read so far
    pub next_read_offset: u64,
    /// Chunks read from the content source, re-reads included
    pub chunks_read: u64,
    /// Whether the whole content has been read at least once
    pub eof: bool,
    /// Whether the session is pumping (not waiting for a slot)
    pub running: bool,
}

/// All upload sessions of the local user.
#[derive(Debug)]
pub struct UploadSessionPool {
    settings: PoolSettings,
    sessions: HashMap<AttachmentId, UploadSession>,
    running: Vec<AttachmentId>,
    waiting: VecDeque<AttachmentId>,
    owners: HashMap<RequestId, AttachmentId>,
}

impl UploadSessionPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(mut settings: PoolSettings) -> Self {
        settings.chunk_size = settings.chunk_size.max(1);
        settings.cache_budget = settings.cache_budget.max(settings.chunk_size as u64);
        settings.max_running = settings.max_running.max(1);
        Self {
            settings,
            sessions: HashMap::new(),
            running: Vec::new(),
            waiting: VecDeque::new(),
            owners: HashMap::new(),
        }
    }

    /// Attach `request_id` to the session serving `meta.attachment_id`.
    ///
    /// Creates the session if needed; it starts pumping right away when a
    /// slot is free and waits otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is already subscribed.
    pub fn subscribe(
        &mut self,
        meta: AttachmentMeta,
        request_id: RequestId,
        channel: ChannelHandle,
        now: Instant,
    ) -> Result<()> {
        if self.owners.contains_key(&request_id) {
            return Err(Error::Internal(format!(
                "request {request_id} is already subscribed"
            )));
        }

        let attachment_id = meta.attachment_id.clone();
        if !self.sessions.contains_key(&attachment_id) {
            let session = UploadSession::new(meta, now);
            self.sessions.insert(attachment_id.clone(), session);
            if self.running.len() < self.settings.max_running {
                self.running.push(attachment_id.clone());
            } else {
                tracing::debug!(attachment_id = %attachment_id, "Upload session waiting for a slot");
                self.waiting.push_back(attachment_id.clone());
            }
        }

        if let Some(session) = self.sessions.get_mut(&attachment_id) {
            session.add_subscriber(request_id, channel);
            tracing::debug!(
                attachment_id = %attachment_id,
                request_id = %request_id,
                subscribers = session.subscribers.len(),
                "Subscribed to upload session"
            );
        }
        self.owners.insert(request_id, attachment_id);
        Ok(())
    }

    /// Detach a request. Tears its session down if it was the last subscriber.
    ///
    /// Returns whether the request was subscribed.
    pub fn unsubscribe(&mut self, request_id: &RequestId, now: Instant) -> bool {
        let Some(attachment_id) = self.owners.remove(request_id) else {
            return false;
        };
        let empty = self.sessions.get_mut(&attachment_id).is_some_and(|session| {
            session.remove_subscriber(request_id);
            session.is_empty()
        });
        if empty {
            self.teardown(&attachment_id, now);
        }
        true
    }

    /// Apply a flow pause or resume from the subscriber's receiver.
    pub fn set_flow_paused(&mut self, request_id: &RequestId, paused: bool) -> bool {
        let Some(sub) = self
            .owners
            .get(request_id)
            .and_then(|id| self.sessions.get_mut(id))
            .and_then(|session| session.subscribers.get_mut(request_id))
        else {
            return false;
        };
        sub.flow_paused = paused;
        tracing::debug!(request_id = %request_id, paused, "Upload flow control");
        true
    }

    /// Whether the downloader behind `request_id` asked to pause.
    #[must_use]
    pub fn is_flow_paused(&self, request_id: &RequestId) -> Option<bool> {
        let attachment_id = self.owners.get(request_id)?;
        self.sessions
            .get(attachment_id)?
            .subscribers
            .get(request_id)
            .map(|sub| sub.flow_paused)
    }

    /// Run every running session for one scheduler step.
    pub fn pump(&mut self, source: &mut dyn ContentSource, now: Instant) -> Vec<PumpOutcome> {
        let mut outcomes = Vec::new();

        for attachment_id in self.running.clone() {
            let Some(session) = self.sessions.get_mut(&attachment_id) else {
                continue;
            };
            session.pump(source, &self.settings, now, &mut outcomes);
            if session.is_empty() {
                self.teardown(&attachment_id, now);
            }
        }

        for outcome in &outcomes {
            if let PumpOutcome::Completed { request_id } | PumpOutcome::Failed { request_id, .. } =
                outcome
            {
                self.owners.remove(request_id);
            }
        }
        outcomes
    }

    /// Whether a request is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, request_id: &RequestId) -> bool {
        self.owners.contains_key(request_id)
    }

    /// Bytes sent so far to a subscriber.
    #[must_use]
    pub fn subscriber_offset(&self, request_id: &RequestId) -> Option<u64> {
        let attachment_id = self.owners.get(request_id)?;
        self.sessions
            .get(attachment_id)?
            .subscribers
            .get(request_id)
            .map(|sub| sub.next_send_offset)
    }

    /// State of the session serving `attachment_id`.
    #[must_use]
    pub fn session_stats(&self, attachment_id: &str) -> Option<SessionStats> {
        let session = self.sessions.get(attachment_id)?;
        Some(SessionStats {
            cache_bytes: session.cache_bytes,
            subscribers: session.subscribers.len(),
            next_read_offset: session.next_read_offset,
            chunks_read: session.chunks_read,
            eof: session.eof,
            running: self.running.iter().any(|id| id == attachment_id),
        })
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions waiting for a slot.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Drop every session without notifying anyone.
    pub fn reset(&mut self) {
        self.sessions.clear();
        self.running.clear();
        self.waiting.clear();
        self.owners.clear();
    }

    fn teardown(&mut self, attachment_id: &str, now: Instant) {
        if let Some(session) = self.sessions.remove(attachment_id) {
            for request_id in session.subscribers.keys() {
                self.owners.remove(request_id);
            }
        }
        self.running.retain(|id| id != attachment_id);
        self.waiting.retain(|id| id != attachment_id);
        tracing::debug!(attachment_id = %attachment_id, "Upload session torn down");

        while self.running.len() < self.settings.max_running {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            if let Some(session) = self.sessions.get_mut(&next) {
                session.last_progress = now;
                tracing::debug!(attachment_id = %next, "Upload session started");
                self.running.push(next);
            }
        }
    }
}
