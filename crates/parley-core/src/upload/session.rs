//! One shared upload session.
//!
//! A session serves one attachment to every request subscribed to it.
//! Chunks read from the content source land in a sparse cache keyed by
//! offset; each subscriber drains the cache at its own pace and blocks fall
//! out of the cache once every subscriber is past them.
//!
//! When subscribers are spread across the file, reads alternate between the
//! lowest missing block and the block the furthest subscriber needs next, so
//! a late joiner catching up never freezes a download that is almost done.

use std::collections::BTreeMap;
use std::time::Instant;

use super::{PoolSettings, PumpOutcome};
use crate::error::{Error, Result};
use crate::protocol::ControlFrame;
use crate::storage::ContentSource;
use crate::transfer::{AttachmentMeta, RequestId};
use crate::transport::ChannelHandle;

/// Upper bound on pump iterations per session per scheduler step.
const MAX_ITERATIONS_PER_PUMP: usize = 64;

/// A request receiving content from a session.
#[derive(Debug)]
pub(crate) struct UploadSubscriber {
    pub(crate) channel: ChannelHandle,
    /// Meta frame delivered
    pub(crate) ready: bool,
    pub(crate) flow_paused: bool,
    pub(crate) next_send_offset: u64,
    pub(crate) done: bool,
}

impl UploadSubscriber {
    const fn wants_bytes(&self) -> bool {
        self.ready && !self.done && !self.flow_paused
    }
}

/// Read-ahead cache and subscribers for one attachment.
#[derive(Debug)]
pub(crate) struct UploadSession {
    pub(crate) meta: AttachmentMeta,
    cache: BTreeMap<u64, Vec<u8>>,
    pub(crate) cache_bytes: u64,
    pub(crate) next_read_offset: u64,
    pub(crate) chunks_read: u64,
    pub(crate) eof: bool,
    pub(crate) subscribers: BTreeMap<RequestId, UploadSubscriber>,
    pub(crate) last_progress: Instant,
    /// Next read goes to the furthest subscriber first
    favor_frontier: bool,
}

impl UploadSession {
    pub(crate) fn new(meta: AttachmentMeta, now: Instant) -> Self {
        Self {
            meta,
            cache: BTreeMap::new(),
            cache_bytes: 0,
            next_read_offset: 0,
            chunks_read: 0,
            eof: false,
            subscribers: BTreeMap::new(),
            last_progress: now,
            favor_frontier: false,
        }
    }

    pub(crate) const fn total_bytes(&self) -> u64 {
        self.meta.size_bytes
    }

    pub(crate) fn add_subscriber(&mut self, request_id: RequestId, channel: ChannelHandle) {
        self.subscribers.insert(
            request_id,
            UploadSubscriber {
                channel,
                ready: false,
                flow_paused: false,
                next_send_offset: 0,
                done: false,
            },
        );
    }

    pub(crate) fn remove_subscriber(&mut self, request_id: &RequestId) -> bool {
        let removed = self.subscribers.remove(request_id).is_some();
        if removed {
            self.evict_consumed();
        }
        removed
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Run pump iterations until nothing moves, then check the idle timeout.
    pub(crate) fn pump(
        &mut self,
        source: &mut dyn ContentSource,
        settings: &PoolSettings,
        now: Instant,
        outcomes: &mut Vec<PumpOutcome>,
    ) {
        let sent_before: Vec<(RequestId, u64)> = self
            .subscribers
            .iter()
            .map(|(id, s)| (*id, s.next_send_offset))
            .collect();

        let mut progressed = false;
        for _ in 0..MAX_ITERATIONS_PER_PUMP {
            if self.subscribers.is_empty() || !self.iterate(source, settings, outcomes) {
                break;
            }
            progressed = true;
        }

        for (request_id, before) in sent_before {
            if let Some(sub) = self.subscribers.get(&request_id) {
                if sub.next_send_offset > before {
                    outcomes.push(PumpOutcome::Progress {
                        request_id,
                        sent: sub.next_send_offset,
                        total: self.total_bytes(),
                        buffered: sub.channel.buffered_amount(),
                    });
                }
            }
        }

        if progressed {
            self.last_progress = now;
        } else if !self.subscribers.is_empty()
            && now.saturating_duration_since(self.last_progress) >= settings.idle_timeout
        {
            tracing::warn!(
                attachment_id = %self.meta.attachment_id,
                subscribers = self.subscribers.len(),
                "Upload session stalled"
            );
            let secs = settings.idle_timeout.as_secs();
            for (request_id, _) in std::mem::take(&mut self.subscribers) {
                outcomes.push(PumpOutcome::Failed {
                    request_id,
                    error: Error::Stalled(secs),
                });
            }
            self.cache.clear();
            self.cache_bytes = 0;
        }
    }

    /// One pump iteration. Returns whether anything moved.
    fn iterate(
        &mut self,
        source: &mut dyn ContentSource,
        settings: &PoolSettings,
        outcomes: &mut Vec<PumpOutcome>,
    ) -> bool {
        let mut progressed = self.send_pending_meta();

        match self.read_ahead(source, settings) {
            Ok(read) => progressed |= read,
            Err(e) => {
                tracing::warn!(
                    attachment_id = %self.meta.attachment_id,
                    error = %e,
                    "Content read failed, failing all subscribers"
                );
                let reason = e.to_string();
                for (request_id, _) in std::mem::take(&mut self.subscribers) {
                    outcomes.push(PumpOutcome::Failed {
                        request_id,
                        error: Error::ContentRead {
                            attachment_id: self.meta.attachment_id.clone(),
                            reason: reason.clone(),
                        },
                    });
                }
                self.cache.clear();
                self.cache_bytes = 0;
                return true;
            }
        }

        progressed |= self.send_cached(settings, outcomes);
        progressed |= self.send_done(outcomes);
        self.evict_consumed();
        progressed
    }

    fn send_pending_meta(&mut self) -> bool {
        let frame = ControlFrame::Meta {
            file_name: self.meta.file_name.clone(),
            size_bytes: self.meta.size_bytes,
            content_hash: self.meta.content_hash.clone(),
        };
        let Ok(text) = frame.encode() else {
            return false;
        };

        let mut sent = false;
        for (request_id, sub) in &mut self.subscribers {
            if sub.ready {
                continue;
            }
            match sub.channel.send_text(&text) {
                Ok(()) => {
                    sub.ready = true;
                    sent = true;
                }
                Err(e) => tracing::warn!(
                    request_id = %request_id,
                    error = %e,
                    "Meta frame not sent, will retry"
                ),
            }
        }
        sent
    }

    /// First uncached block at or after `offset`.
    fn first_missing(&self, mut offset: u64, chunk_size: u64) -> Option<u64> {
        while offset < self.total_bytes() {
            if !self.cache.contains_key(&offset) {
                return Some(offset);
            }
            offset += chunk_size;
        }
        None
    }

    /// Read candidates: the smallest uncached block any active subscriber
    /// still needs, and the next uncached block of the furthest one.
    fn read_targets(&self, chunk_size: u64) -> (Option<u64>, Option<u64>) {
        let active = || self.subscribers.values().filter(|s| s.wants_bytes());
        let lowest = active()
            .filter_map(|s| self.first_missing(s.next_send_offset, chunk_size))
            .min();
        let frontier = active()
            .map(|s| s.next_send_offset)
            .max()
            .and_then(|offset| self.first_missing(offset, chunk_size));
        (lowest, frontier)
    }

    fn read_ahead(&mut self, source: &mut dyn ContentSource, settings: &PoolSettings) -> Result<bool> {
        let chunk_size = settings.chunk_size as u64;
        let (lowest, frontier) = self.read_targets(chunk_size);
        let (first, second) = if self.favor_frontier {
            (frontier, lowest)
        } else {
            (lowest, frontier)
        };

        for offset in [first, second.filter(|o| Some(*o) != first)].into_iter().flatten() {
            if self.read_block(source, settings, offset)? {
                self.favor_frontier = !self.favor_frontier;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Read the block at `offset` into the cache if the budget allows.
    fn read_block(
        &mut self,
        source: &mut dyn ContentSource,
        settings: &PoolSettings,
        offset: u64,
    ) -> Result<bool> {
        let length = (settings.chunk_size as u64).min(self.total_bytes() - offset);

        // Make room by dropping the furthest block above `offset` that no
        // subscriber is about to send; it is re-read when needed.
        while self.cache_bytes + length > settings.cache_budget {
            let victim = self
                .cache
                .range(offset + 1..)
                .rev()
                .map(|(&key, _)| key)
                .find(|key| self.subscribers.values().all(|s| s.next_send_offset != *key));
            let Some(victim) = victim else {
                return Ok(false);
            };
            if let Some(block) = self.cache.remove(&victim) {
                self.cache_bytes -= block.len() as u64;
            }
        }

        let data = source.read_chunk(&self.meta.attachment_id, offset, length as usize)?;
        if data.len() as u64 != length {
            return Err(Error::ContentRead {
                attachment_id: self.meta.attachment_id.clone(),
                reason: format!(
                    "expected {length} bytes at offset {offset}, got {}",
                    data.len()
                ),
            });
        }

        tracing::debug!(
            attachment_id = %self.meta.attachment_id,
            offset,
            length,
            "Read chunk into session cache"
        );
        self.cache_bytes += length;
        self.chunks_read += 1;
        self.cache.insert(offset, data);
        self.next_read_offset = self.next_read_offset.max(offset + length);
        if self.next_read_offset >= self.total_bytes() {
            self.eof = true;
        }
        Ok(true)
    }

    fn send_cached(&mut self, settings: &PoolSettings, outcomes: &mut Vec<PumpOutcome>) -> bool {
        let total = self.meta.size_bytes;
        let mut sent = false;
        let mut failed = Vec::new();

        for (request_id, sub) in &mut self.subscribers {
            if !sub.wants_bytes() {
                continue;
            }
            while sub.next_send_offset < total
                && sub.channel.buffered_amount() < settings.high_water
            {
                let Some(block) = self.cache.get(&sub.next_send_offset) else {
                    break;
                };
                if let Err(e) = sub.channel.send_binary(block) {
                    failed.push((*request_id, e));
                    break;
                }
                sub.next_send_offset += block.len() as u64;
                sent = true;
            }
        }

        for (request_id, error) in failed {
            tracing::warn!(request_id = %request_id, error = %error, "Chunk send failed");
            self.subscribers.remove(&request_id);
            outcomes.push(PumpOutcome::Failed { request_id, error });
        }
        sent
    }

    fn send_done(&mut self, outcomes: &mut Vec<PumpOutcome>) -> bool {
        let total = self.meta.size_bytes;
        let Ok(text) = ControlFrame::Done.encode() else {
            return false;
        };

        let mut finished = Vec::new();
        for (request_id, sub) in &mut self.subscribers {
            if !sub.ready || sub.done || sub.next_send_offset < total {
                continue;
            }
            match sub.channel.send_text(&text) {
                Ok(()) => {
                    sub.done = true;
                    finished.push(*request_id);
                }
                Err(e) => tracing::warn!(
                    request_id = %request_id,
                    error = %e,
                    "Done frame not sent, will retry"
                ),
            }
        }

        for request_id in &finished {
            self.subscribers.remove(request_id);
            outcomes.push(PumpOutcome::Completed {
                request_id: *request_id,
            });
        }
        !finished.is_empty()
    }

    /// Drop every block all remaining subscribers have moved past.
    fn evict_consumed(&mut self) {
        let Some(min_offset) = self.subscribers.values().map(|s| s.next_send_offset).min() else {
            self.cache.clear();
            self.cache_bytes = 0;
            return;
        };
        let keep = self.cache.split_off(&min_offset);
        let dropped: u64 = self.cache.values().map(|b| b.len() as u64).sum();
        self.cache = keep;
        self.cache_bytes -= dropped;
    }
}
