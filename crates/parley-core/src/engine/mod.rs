//! Transfer engine facade.
//!
//! [`TransferEngine`] owns every per-user component (registry, admission
//! queue, upload session pool, stream writers, estimators, history and the
//! content cache) together with the host-supplied collaborators. It is a
//! synchronous state machine: the host feeds it UI commands,
//! [`EngineEvent`]s and periodic [`TransferEngine::tick`]s, passing the
//! current [`Instant`] each time. [`crate::runtime`] wraps it in a tokio task.
//!
//! ## Request flow
//!
//! ```text
//! downloader                                   uploader
//! request_download -> queued | requesting
//!            --- transfer_request ------------->  requesting (consent)
//!            <-- transfer_response(accepted) ---  connecting, open channel
//! connecting, open channel
//!            <== meta, chunks..., done ========  transferring (session pool)
//! transferring, drain to storage                 completed
//! completed, cache content hash
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::cache::ContentCache;
use crate::config::Config;
use crate::download::DownloadStream;
use crate::error::{Error, Result};
use crate::history::{HistoryStore, TransferHistoryEntry};
use crate::protocol::{ChannelMessage, ControlFrame, SignalEnvelope, SignalPayload};
use crate::queue::{Admission, DownloadQueue};
use crate::registry::TransferRegistry;
use crate::storage::{ContentSource, StorageSink};
use crate::telemetry::TelemetryEstimator;
use crate::transfer::{
    AttachmentMeta, AttachmentRef, RequestId, TransferDirection, TransferState, TransferStatus,
    UserId,
};
use crate::transport::{ChannelHandle, EngineEvent, SignalingBus, TransportAdapter};
use crate::upload::{PoolSettings, PumpOutcome, UploadSessionPool};

/// Host-supplied collaborators.
pub struct Collaborators {
    /// Opens data channels
    pub transport: Box<dyn TransportAdapter>,
    /// Delivers signaling envelopes
    pub signaling: Box<dyn SignalingBus>,
    /// Reads local attachment content
    pub source: Box<dyn ContentSource>,
    /// Writes downloaded files
    pub storage: Box<dyn StorageSink>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct DownloadJob {
    attachment: AttachmentRef,
    channel: Option<ChannelHandle>,
    connecting_since: Option<Instant>,
    stream: DownloadStream,
    telemetry: TelemetryEstimator,
}

#[derive(Debug)]
struct UploadJob {
    meta: AttachmentMeta,
    channel: Option<ChannelHandle>,
    connecting_since: Option<Instant>,
    telemetry: TelemetryEstimator,
}

/// Attachment-transfer engine of one local user.
#[derive(Debug)]
pub struct TransferEngine {
    local_user: UserId,
    config: Config,
    registry: TransferRegistry,
    queue: DownloadQueue,
    pool: UploadSessionPool,
    downloads: HashMap<RequestId, DownloadJob>,
    uploads: HashMap<RequestId, UploadJob>,
    history: HistoryStore,
    cache: ContentCache,
    io: Collaborators,
}

impl TransferEngine {
    /// Create an engine for `local_user`.
    ///
    /// The content cache is seeded from completed downloads in `history` and
    /// from everything the content source shares.
    #[must_use]
    pub fn new(
        local_user: impl Into<UserId>,
        config: Config,
        io: Collaborators,
        history: HistoryStore,
    ) -> Self {
        let queue = DownloadQueue::new(
            config.transfer.max_concurrent_downloads,
            config.transfer.max_queued_downloads,
        );
        let pool = UploadSessionPool::new(PoolSettings::from(&config.transfer));
        let cache = ContentCache::from_history(history.list(None));

        let mut engine = Self {
            local_user: local_user.into(),
            config,
            registry: TransferRegistry::new(),
            queue,
            pool,
            downloads: HashMap::new(),
            uploads: HashMap::new(),
            history,
            cache,
            io,
        };
        engine.refresh_shared_content();
        engine
    }

    /// The local user.
    #[must_use]
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot of every live transfer, oldest first.
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferState> {
        self.registry.snapshot()
    }

    /// One live transfer.
    #[must_use]
    pub fn transfer(&self, request_id: &RequestId) -> Option<&TransferState> {
        self.registry.get(request_id)
    }

    /// Persisted history, newest first.
    #[must_use]
    pub fn history(&self) -> &[TransferHistoryEntry] {
        self.history.list(None)
    }

    /// The upload session pool.
    #[must_use]
    pub const fn upload_pool(&self) -> &UploadSessionPool {
        &self.pool
    }

    /// The download admission queue.
    #[must_use]
    pub const fn download_queue(&self) -> &DownloadQueue {
        &self.queue
    }

    /// Whether no transfer is in a non-terminal state.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.registry.snapshot().iter().all(TransferState::is_terminal)
    }

    /// Register everything the content source shares in the content cache.
    pub fn refresh_shared_content(&mut self) {
        for (hash, path) in self.io.source.shared_content() {
            self.cache.register_shared(&hash, path);
        }
    }

    /// Request the download of an attachment into the default directory.
    ///
    /// See [`Self::request_download_to`].
    ///
    /// # Errors
    ///
    /// Returns an error if the admission queue is full.
    pub fn request_download(&mut self, attachment: AttachmentRef, now: Instant) -> Result<RequestId> {
        self.request_download_to(attachment, None, now)
    }

    /// Request the download of an attachment.
    ///
    /// Returns the id of an already live download of the same attachment if
    /// there is one. Content already on disk under the announced hash
    /// completes immediately without contacting the peer. Otherwise the
    /// download starts now or waits for admission.
    ///
    /// # Errors
    ///
    /// Returns an error if the admission queue is full.
    pub fn request_download_to(
        &mut self,
        attachment: AttachmentRef,
        dest_dir: Option<PathBuf>,
        now: Instant,
    ) -> Result<RequestId> {
        if let Some(existing) = self.registry.find_live_download(&attachment.attachment_id) {
            tracing::debug!(request_id = %existing, "Download already in progress");
            return Ok(existing);
        }

        for stale in self.registry.remove_superseded(&attachment.attachment_id) {
            tracing::debug!(request_id = %stale, "Superseded previous download");
        }

        let request_id = Uuid::new_v4();
        let mut state = TransferState::new(
            request_id,
            attachment.attachment_id.clone(),
            attachment.file_name.clone(),
            TransferDirection::Download,
            attachment.owner.clone(),
            TransferStatus::Requesting,
        );
        state.size_bytes = attachment.size_bytes;
        state.content_hash.clone_from(&attachment.content_hash);

        if let Some(path) = self.cached_copy(attachment.content_hash.as_deref()) {
            tracing::info!(
                request_id = %request_id,
                path = %path.display(),
                "Content already available locally"
            );
            self.registry.insert(state);
            self.record(&request_id);
            self.registry.complete(&request_id, Some(path))?;
            self.record(&request_id);
            return Ok(request_id);
        }

        let admission = self.queue.enqueue(request_id, attachment.size_bytes)?;
        if admission == Admission::Queued {
            state.status = TransferStatus::Queued;
        }
        self.registry.insert(state);
        self.downloads.insert(
            request_id,
            DownloadJob {
                attachment,
                channel: None,
                connecting_since: None,
                stream: DownloadStream::new(request_id, dest_dir),
                telemetry: TelemetryEstimator::new(
                    TransferDirection::Download,
                    &self.config.telemetry,
                ),
            },
        );
        self.record(&request_id);

        if admission == Admission::Immediate {
            self.send_transfer_request(request_id, now);
        }
        Ok(request_id)
    }

    /// Cancel a transfer in any state and forget it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRequest`] if the request is not known.
    pub fn cancel(&mut self, request_id: &RequestId, now: Instant) -> Result<()> {
        let state = self
            .registry
            .remove(request_id)
            .ok_or_else(|| Error::UnknownRequest(request_id.to_string()))?;
        tracing::info!(request_id = %request_id, status = %state.status, "Transfer cancelled");
        self.decline_if_pending(&state);

        match state.direction {
            TransferDirection::Download => {
                self.queue.remove(request_id);
                self.release_download(request_id, now);
            }
            TransferDirection::Upload => self.release_upload(request_id, now),
        }

        if !state.is_terminal() {
            self.history.remove(request_id);
        }
        Ok(())
    }

    /// Serve an incoming request waiting for consent.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is not an upload awaiting consent.
    pub fn accept_request(&mut self, request_id: &RequestId, now: Instant) -> Result<()> {
        let counterpart = self.pending_upload(request_id)?;
        self.send_signal(
            *request_id,
            &counterpart,
            SignalPayload::TransferResponse { accepted: true },
        )?;
        self.registry.transition(request_id, TransferStatus::Connecting)?;
        self.record(request_id);

        match self.io.transport.open(*request_id, &counterpart, false) {
            Ok(channel) => {
                if let Some(job) = self.uploads.get_mut(request_id) {
                    job.channel = Some(channel);
                    job.connecting_since = Some(now);
                }
                Ok(())
            }
            Err(e) => {
                self.fail_transfer(request_id, &e, now);
                Err(e)
            }
        }
    }

    /// Decline an incoming request waiting for consent.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is not an upload awaiting consent.
    pub fn reject_request(&mut self, request_id: &RequestId, now: Instant) -> Result<()> {
        let counterpart = self.pending_upload(request_id)?;
        if let Err(e) = self.send_signal(
            *request_id,
            &counterpart,
            SignalPayload::TransferResponse { accepted: false },
        ) {
            tracing::warn!(request_id = %request_id, error = %e, "Rejection not delivered");
        }
        self.registry.reject(request_id)?;
        self.record(request_id);
        self.release_upload(request_id, now);
        Ok(())
    }

    /// Delete a history entry.
    pub fn remove_history_entry(&mut self, request_id: &RequestId) -> bool {
        self.history.remove(request_id)
    }

    /// Re-check that saved downloads still exist. Returns how many are gone.
    pub fn refresh_accessibility(&mut self) -> usize {
        let storage = &self.io.storage;
        self.history.refresh_accessibility(|p| storage.path_exists(p))
    }

    /// Remove terminal transfers from the live list.
    ///
    /// They remain available through [`Self::history`].
    pub fn clear_finished(&mut self) -> Vec<TransferState> {
        let cleared = self.registry.clear_terminal();
        let now = Utc::now();
        for state in &cleared {
            self.history.observe(state, now);
        }
        cleared
    }

    /// Drop all live transfers.
    ///
    /// Open channels and partial downloads are released and unfinished
    /// transfers leave the history. Finished history and the content cache
    /// belong to the local user and are kept; hosts switching accounts
    /// build a new engine with that user's history instead.
    pub fn reset(&mut self, now: Instant) {
        self.release_all(now);
        self.registry.reset();
        self.pool.reset();
        if let Err(e) = self.history.flush() {
            tracing::warn!(error = %e, "Failed to persist history on reset");
        }
        tracing::info!(user = %self.local_user, "Transfer engine reset");
    }

    /// Release everything and persist history, pruning missing files.
    ///
    /// # Errors
    ///
    /// Returns an error if history cannot be saved.
    pub fn shutdown(&mut self, now: Instant) -> Result<()> {
        self.release_all(now);
        self.registry.reset();
        self.pool.reset();
        self.refresh_accessibility();
        self.history.prune_inaccessible();
        self.history.save()
    }

    /// Process one event from the transport or signaling layer.
    pub fn handle_event(&mut self, event: EngineEvent, now: Instant) {
        match event {
            EngineEvent::Signal(envelope) => self.on_signal(envelope, now),
            EngineEvent::ChannelOpened { request_id } => self.on_channel_opened(request_id, now),
            EngineEvent::ChannelMessage {
                request_id,
                message,
            } => self.on_channel_message(request_id, message, now),
            EngineEvent::ChannelClosed { request_id, reason } => {
                self.on_channel_closed(request_id, reason, now);
            }
            EngineEvent::LocalSignal {
                request_id,
                counterpart,
                blob,
            } => {
                if let Err(e) =
                    self.send_signal(request_id, &counterpart, SignalPayload::TransferSignal { blob })
                {
                    tracing::warn!(request_id = %request_id, error = %e, "Transport signal not delivered");
                }
            }
        }
    }

    /// Advance every transfer by one scheduler step.
    pub fn tick(&mut self, now: Instant) {
        self.pump_uploads(now);
        self.drain_downloads(now);
        self.expire_connecting(now);
        if let Err(e) = self.history.flush() {
            tracing::warn!(error = %e, "Failed to persist history");
        }
    }

    fn cached_copy(&mut self, content_hash: Option<&str>) -> Option<PathBuf> {
        let hash = content_hash?;
        let storage = &self.io.storage;
        self.cache.lookup(hash, |p| storage.path_exists(p))
    }

    fn pending_upload(&self, request_id: &RequestId) -> Result<UserId> {
        let state = self
            .registry
            .get(request_id)
            .ok_or_else(|| Error::UnknownRequest(request_id.to_string()))?;
        if state.direction != TransferDirection::Upload || state.status != TransferStatus::Requesting {
            return Err(Error::InvalidTransition {
                request_id: request_id.to_string(),
                from: state.status.to_string(),
                to: TransferStatus::Connecting.to_string(),
            });
        }
        Ok(state.counterpart_user_id.clone())
    }

    fn send_signal(&mut self, request_id: RequestId, to: &UserId, payload: SignalPayload) -> Result<()> {
        let envelope = SignalEnvelope::new(request_id, self.local_user.clone(), to.clone(), payload);
        self.io.signaling.send(envelope)
    }

    fn send_transfer_request(&mut self, request_id: RequestId, now: Instant) {
        let Some(job) = self.downloads.get(&request_id) else {
            return;
        };
        let owner = job.attachment.owner.clone();
        let attachment_id = job.attachment.attachment_id.clone();

        if let Err(e) = self.registry.transition(&request_id, TransferStatus::Requesting) {
            tracing::warn!(request_id = %request_id, error = %e, "Cannot start download");
            return;
        }
        self.record(&request_id);

        tracing::info!(
            request_id = %request_id,
            attachment_id = %attachment_id,
            owner = %owner,
            "Requesting attachment"
        );
        if let Err(e) = self.send_signal(request_id, &owner, SignalPayload::TransferRequest { attachment_id }) {
            self.fail_transfer(&request_id, &e, now);
        }
    }

    fn record(&mut self, request_id: &RequestId) {
        if let Some(state) = self.registry.get(request_id) {
            self.history.observe(state, Utc::now());
        }
    }

    fn fail_transfer(&mut self, request_id: &RequestId, error: &Error, now: Instant) {
        let Some(direction) = self.registry.get(request_id).map(|s| s.direction) else {
            return;
        };
        match self.registry.fail(request_id, error.to_string()) {
            Ok(_) => {
                tracing::warn!(request_id = %request_id, error = %error, "Transfer failed");
                self.record(request_id);
            }
            Err(e) => tracing::debug!(request_id = %request_id, error = %e, "Failure ignored"),
        }
        match direction {
            TransferDirection::Download => self.release_download(request_id, now),
            TransferDirection::Upload => self.release_upload(request_id, now),
        }
    }

    /// Tear down a download's resources and admit the next queued one.
    fn release_download(&mut self, request_id: &RequestId, now: Instant) {
        if let Some(mut job) = self.downloads.remove(request_id) {
            job.stream.abort(self.io.storage.as_mut());
            if let Some(channel) = job.channel.take() {
                channel.close();
                self.io.transport.close(*request_id);
            }
        }
        if let Some(next) = self.queue.finish(request_id) {
            self.send_transfer_request(next.request_id, now);
        }
    }

    fn release_upload(&mut self, request_id: &RequestId, now: Instant) {
        self.pool.unsubscribe(request_id, now);
        if let Some(mut job) = self.uploads.remove(request_id) {
            if let Some(channel) = job.channel.take() {
                channel.close();
                self.io.transport.close(*request_id);
            }
        }
    }

    fn release_all(&mut self, now: Instant) {
        for state in self.registry.snapshot() {
            if !state.is_terminal() {
                self.history.remove(&state.request_id);
            }
        }
        // Nothing may be admitted while everything is being torn down.
        self.queue.reset();
        let downloads: Vec<RequestId> = self.downloads.keys().copied().collect();
        for request_id in downloads {
            self.release_download(&request_id, now);
        }
        let uploads: Vec<RequestId> = self.uploads.keys().copied().collect();
        for request_id in uploads {
            if let Some(state) = self.registry.get(&request_id).cloned() {
                self.decline_if_pending(&state);
            }
            self.release_upload(&request_id, now);
        }
    }

    /// Tell the downloader an upload still awaiting consent will not be served.
    fn decline_if_pending(&mut self, state: &TransferState) {
        if state.direction != TransferDirection::Upload || state.status != TransferStatus::Requesting {
            return;
        }
        if let Err(e) = self.send_signal(
            state.request_id,
            &state.counterpart_user_id,
            SignalPayload::TransferResponse { accepted: false },
        ) {
            tracing::warn!(request_id = %state.request_id, error = %e, "Rejection not delivered");
        }
    }

    fn on_signal(&mut self, envelope: SignalEnvelope, now: Instant) {
        if envelope.to_user != self.local_user {
            tracing::warn!(to = %envelope.to_user, "Signal addressed to another user");
            return;
        }
        let request_id = envelope.request_id;
        match envelope.payload {
            SignalPayload::TransferRequest { attachment_id } => {
                self.on_transfer_request(request_id, envelope.from_user, &attachment_id, now);
            }
            SignalPayload::TransferResponse { accepted } => {
                self.on_transfer_response(request_id, &envelope.from_user, accepted, now);
            }
            SignalPayload::TransferSignal { blob } => {
                let known = self
                    .registry
                    .get(&request_id)
                    .is_some_and(|s| s.counterpart_user_id == envelope.from_user);
                if !known {
                    tracing::debug!(request_id = %request_id, "Signal for unknown request");
                    return;
                }
                if let Err(e) = self.io.transport.apply_remote_signal(request_id, &blob) {
                    tracing::warn!(request_id = %request_id, error = %e, "Remote signal rejected");
                }
            }
        }
    }

    fn on_transfer_request(&mut self, request_id: RequestId, from: UserId, attachment_id: &str, now: Instant) {
        if self.registry.contains(&request_id) {
            tracing::debug!(request_id = %request_id, "Duplicate transfer request");
            return;
        }

        let meta = match self.io.source.get_record(attachment_id) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::info!(
                    request_id = %request_id,
                    attachment_id = %attachment_id,
                    error = %e,
                    "Rejecting request for unavailable attachment"
                );
                if let Err(e) = self.send_signal(
                    request_id,
                    &from,
                    SignalPayload::TransferResponse { accepted: false },
                ) {
                    tracing::warn!(request_id = %request_id, error = %e, "Rejection not delivered");
                }
                return;
            }
        };

        let mut state = TransferState::new(
            request_id,
            meta.attachment_id.clone(),
            meta.file_name.clone(),
            TransferDirection::Upload,
            from,
            TransferStatus::Requesting,
        );
        state.size_bytes = Some(meta.size_bytes);
        state.content_hash = Some(meta.content_hash.clone());
        self.registry.insert(state);
        self.uploads.insert(
            request_id,
            UploadJob {
                meta,
                channel: None,
                connecting_since: None,
                telemetry: TelemetryEstimator::new(TransferDirection::Upload, &self.config.telemetry),
            },
        );
        self.record(&request_id);

        if self.config.transfer.auto_accept {
            if let Err(e) = self.accept_request(&request_id, now) {
                tracing::warn!(request_id = %request_id, error = %e, "Auto-accept failed");
                self.fail_transfer(&request_id, &e, now);
            }
        }
    }

    fn on_transfer_response(&mut self, request_id: RequestId, from: &UserId, accepted: bool, now: Instant) {
        let valid = self.registry.get(&request_id).is_some_and(|s| {
            s.direction == TransferDirection::Download
                && s.status == TransferStatus::Requesting
                && &s.counterpart_user_id == from
        });
        if !valid {
            tracing::debug!(request_id = %request_id, "Unexpected transfer response");
            return;
        }

        if !accepted {
            tracing::info!(request_id = %request_id, "Download rejected by peer");
            if self.registry.reject(&request_id).is_ok() {
                self.record(&request_id);
            }
            self.release_download(&request_id, now);
            return;
        }

        if let Err(e) = self.registry.transition(&request_id, TransferStatus::Connecting) {
            tracing::warn!(request_id = %request_id, error = %e, "Cannot connect download");
            return;
        }
        self.record(&request_id);

        match self.io.transport.open(request_id, from, true) {
            Ok(channel) => {
                if let Some(job) = self.downloads.get_mut(&request_id) {
                    job.channel = Some(channel);
                    job.connecting_since = Some(now);
                }
            }
            Err(e) => self.fail_transfer(&request_id, &e, now),
        }
    }

    fn on_channel_opened(&mut self, request_id: RequestId, now: Instant) {
        if let Some(job) = self.downloads.get_mut(&request_id) {
            tracing::debug!(request_id = %request_id, "Download channel open");
            job.connecting_since = None;
            return;
        }

        let Some(job) = self.uploads.get_mut(&request_id) else {
            tracing::debug!(request_id = %request_id, "Channel opened for unknown request");
            return;
        };
        let Some(channel) = job.channel.clone() else {
            return;
        };
        job.connecting_since = None;
        let meta = job.meta.clone();

        if let Err(e) = self.registry.transition(&request_id, TransferStatus::Transferring) {
            tracing::warn!(request_id = %request_id, error = %e, "Cannot start upload");
            return;
        }
        self.record(&request_id);

        if let Err(e) = self.pool.subscribe(meta, request_id, channel, now) {
            self.fail_transfer(&request_id, &e, now);
        }
    }

    fn on_channel_message(&mut self, request_id: RequestId, message: ChannelMessage, now: Instant) {
        if self.uploads.contains_key(&request_id) {
            self.on_upload_message(request_id, message);
            return;
        }
        if !self.downloads.contains_key(&request_id) {
            tracing::debug!(request_id = %request_id, "Message for unknown request");
            return;
        }

        let result = match message {
            ChannelMessage::Text(text) => match ControlFrame::decode(&text) {
                Ok(frame) => self.on_download_frame(request_id, frame),
                Err(e) => {
                    tracing::warn!(request_id = %request_id, error = %e, "Ignoring malformed frame");
                    Ok(())
                }
            },
            ChannelMessage::Binary(bytes) => self.on_download_chunk(request_id, bytes),
        };

        if let Err(e) = result {
            self.fail_transfer(&request_id, &e, now);
        }
    }

    fn on_upload_message(&mut self, request_id: RequestId, message: ChannelMessage) {
        let ChannelMessage::Text(text) = message else {
            tracing::debug!(request_id = %request_id, "Ignoring binary frame on upload");
            return;
        };
        match ControlFrame::decode(&text) {
            Ok(ControlFrame::FlowPause) => {
                self.pool.set_flow_paused(&request_id, true);
            }
            Ok(ControlFrame::FlowResume) => {
                self.pool.set_flow_paused(&request_id, false);
            }
            Ok(frame) => {
                tracing::debug!(request_id = %request_id, frame = frame.name(), "Unexpected frame on upload");
            }
            Err(e) => tracing::warn!(request_id = %request_id, error = %e, "Ignoring malformed frame"),
        }
    }

    fn on_download_frame(&mut self, request_id: RequestId, frame: ControlFrame) -> Result<()> {
        match frame {
            ControlFrame::Meta {
                file_name,
                size_bytes,
                content_hash,
            } => {
                let Some(job) = self.downloads.get_mut(&request_id) else {
                    return Ok(());
                };
                if let Some(announced) = job.attachment.content_hash.as_deref() {
                    if !announced.eq_ignore_ascii_case(&content_hash) {
                        return Err(Error::HashMismatch {
                            expected: announced.to_string(),
                            actual: content_hash,
                        });
                    }
                }
                if let Err(e) =
                    job.stream
                        .on_meta(&file_name, size_bytes, &content_hash, self.io.storage.as_mut())
                {
                    if matches!(e, Error::ProtocolError(_)) {
                        tracing::warn!(request_id = %request_id, error = %e, "Ignoring frame");
                        return Ok(());
                    }
                    return Err(e);
                }
                job.connecting_since = None;

                self.registry.set_content(&request_id, size_bytes, &content_hash);
                self.registry.transition(&request_id, TransferStatus::Transferring)?;
                self.record(&request_id);
                Ok(())
            }
            ControlFrame::Done => {
                if let Some(job) = self.downloads.get_mut(&request_id) {
                    if let Err(e) = job.stream.on_done() {
                        tracing::warn!(request_id = %request_id, error = %e, "Ignoring frame");
                    }
                }
                Ok(())
            }
            ControlFrame::FlowPause | ControlFrame::FlowResume => {
                tracing::debug!(request_id = %request_id, frame = frame.name(), "Unexpected frame on download");
                Ok(())
            }
        }
    }

    fn on_download_chunk(&mut self, request_id: RequestId, bytes: Vec<u8>) -> Result<()> {
        let Some(job) = self.downloads.get_mut(&request_id) else {
            return Ok(());
        };
        job.stream.on_chunk(bytes)?;
        Self::send_flow_signal(request_id, job, &self.config);
        Ok(())
    }

    fn send_flow_signal(request_id: RequestId, job: &mut DownloadJob, config: &Config) {
        let Some(frame) = job.stream.pending_flow_signal(&config.flow) else {
            return;
        };
        let Some(channel) = job.channel.as_ref() else {
            return;
        };
        let sent = frame.encode().and_then(|text| channel.send_text(&text));
        match sent {
            Ok(()) => {
                tracing::debug!(
                    request_id = %request_id,
                    frame = frame.name(),
                    pending = job.stream.pending_bytes(),
                    "Flow control sent"
                );
                job.stream.mark_flow_signal_sent(&frame);
            }
            Err(e) => tracing::warn!(request_id = %request_id, error = %e, "Flow control not sent, will retry"),
        }
    }

    fn on_channel_closed(&mut self, request_id: RequestId, reason: Option<String>, now: Instant) {
        let detail = reason.unwrap_or_else(|| "no reason given".to_string());

        if let Some(job) = self.downloads.get_mut(&request_id) {
            if job.stream.remote_done() {
                // Everything arrived; keep draining to completion.
                tracing::debug!(request_id = %request_id, "Channel closed after done");
                job.channel = None;
                self.io.transport.close(request_id);
                return;
            }
            tracing::debug!(request_id = %request_id, reason = %detail, "Download channel closed");
            self.fail_transfer(&request_id, &Error::ChannelClosed, now);
            return;
        }

        if self.uploads.contains_key(&request_id) {
            tracing::debug!(request_id = %request_id, reason = %detail, "Upload channel closed");
            self.fail_transfer(&request_id, &Error::ChannelClosed, now);
        }
    }

    fn pump_uploads(&mut self, now: Instant) {
        let outcomes = self.pool.pump(self.io.source.as_mut(), now);
        for outcome in outcomes {
            match outcome {
                PumpOutcome::Progress {
                    request_id,
                    sent,
                    total,
                    buffered,
                } => {
                    let Some(job) = self.uploads.get_mut(&request_id) else {
                        continue;
                    };
                    let delivered = sent.saturating_sub(buffered);
                    let progress = if total == 0 { 1.0 } else { delivered as f64 / total as f64 };
                    let reading = job.telemetry.sample_upload(sent, buffered, total, now);
                    self.registry.update_progress(
                        &request_id,
                        progress,
                        reading.map(|r| r.speed_kbps),
                        reading.and_then(|r| r.eta_secs),
                    );
                }
                PumpOutcome::Completed { request_id } => {
                    tracing::info!(request_id = %request_id, "Upload completed");
                    if self.registry.complete(&request_id, None).is_ok() {
                        self.record(&request_id);
                    }
                    self.release_upload(&request_id, now);
                }
                PumpOutcome::Failed { request_id, error } => {
                    self.fail_transfer(&request_id, &error, now);
                }
            }
        }
    }

    fn drain_downloads(&mut self, now: Instant) {
        let batch = self.config.transfer.drain_batch_bytes;
        let batches = self.config.transfer.drain_batches_per_step;
        let active: Vec<RequestId> = self
            .downloads
            .iter()
            .filter(|(_, job)| job.stream.is_started())
            .map(|(id, _)| *id)
            .collect();

        for request_id in active {
            let Some(job) = self.downloads.get_mut(&request_id) else {
                continue;
            };
            if let Err(e) = job.stream.drain(self.io.storage.as_mut(), batch, batches) {
                self.fail_transfer(&request_id, &e, now);
                continue;
            }

            let total = job.stream.expected_size().unwrap_or(0);
            let reading = job.telemetry.sample(
                job.stream.written_bytes(),
                total,
                job.stream.pending_bytes(),
                now,
            );
            let progress = job.stream.progress();
            Self::send_flow_signal(request_id, job, &self.config);

            if !job.stream.is_complete() {
                self.registry.update_progress(
                    &request_id,
                    progress,
                    reading.map(|r| r.speed_kbps),
                    reading.and_then(|r| r.eta_secs),
                );
                continue;
            }

            match job.stream.finalize(self.io.storage.as_mut()) {
                Ok(path) => {
                    let hash = job.stream.content_hash().map(str::to_string);
                    tracing::info!(
                        request_id = %request_id,
                        path = %path.display(),
                        "Download completed"
                    );
                    if let Some(reading) = reading {
                        self.registry.update_progress(&request_id, 1.0, Some(reading.speed_kbps), Some(0));
                    }
                    if self.registry.complete(&request_id, Some(path.clone())).is_ok() {
                        self.record(&request_id);
                    }
                    if let Some(hash) = hash {
                        self.cache.insert(&hash, path);
                    }
                    self.release_download(&request_id, now);
                }
                Err(e) => self.fail_transfer(&request_id, &e, now),
            }
        }
    }

    fn expire_connecting(&mut self, now: Instant) {
        let timeout = self.config.transfer.idle_timeout;
        let expired = |since: Option<Instant>| {
            since.is_some_and(|t| now.saturating_duration_since(t) >= timeout)
        };

        let stuck: Vec<RequestId> = self
            .downloads
            .iter()
            .filter(|(_, job)| expired(job.connecting_since))
            .map(|(id, _)| *id)
            .chain(
                self.uploads
                    .iter()
                    .filter(|(_, job)| expired(job.connecting_since))
                    .map(|(id, _)| *id),
            )
            .collect();

        for request_id in stuck {
            let error = Error::ChannelOpenFailed(format!(
                "no connection after {} seconds",
                timeout.as_secs()
            ));
            self.fail_transfer(&request_id, &error, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistoryConfig;
    use crate::storage::{FsContentSource, FsStorage};
    use crate::transport::memory::MemoryHub;
    use crate::transport::EventReceiver;

    fn engine(hub: &MemoryHub, user: &str, config: Config, dir: &std::path::Path) -> (TransferEngine, EventReceiver) {
        let peer = hub.join(user);
        let history = HistoryStore::in_memory(
            dir.join(format!("{user}-history.json")),
            HistoryConfig::default(),
        );
        let engine = TransferEngine::new(
            user,
            config,
            Collaborators {
                transport: Box::new(peer.transport),
                signaling: Box::new(peer.signaling),
                source: Box::new(FsContentSource::new()),
                storage: Box::new(FsStorage::new(dir.join(user))),
            },
            history,
        );
        (engine, peer.events)
    }

    fn attachment(id: &str, size: u64) -> AttachmentRef {
        AttachmentRef {
            attachment_id: id.to_string(),
            owner: "alice".to_string(),
            file_name: format!("{id}.bin"),
            size_bytes: Some(size),
            content_hash: None,
        }
    }

    #[test]
    fn test_cancel_unknown_request() {
        let dir = tempfile::tempdir().unwrap();
        let hub = MemoryHub::new();
        let (mut bob, _events) = engine(&hub, "bob", Config::default(), dir.path());

        let err = bob.cancel(&Uuid::new_v4(), Instant::now()).unwrap_err();
        assert!(matches!(err, Error::UnknownRequest(_)));
    }

    #[test]
    fn test_queue_full_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let hub = MemoryHub::new();
        let _alice = hub.join("alice");
        let mut config = Config::default();
        config.transfer.max_concurrent_downloads = 1;
        config.transfer.max_queued_downloads = Some(1);
        let (mut bob, _events) = engine(&hub, "bob", config, dir.path());
        let now = Instant::now();

        bob.request_download(attachment("a", 10), now).unwrap();
        let queued = bob.request_download(attachment("b", 10), now).unwrap();
        assert_eq!(bob.transfer(&queued).unwrap().status, TransferStatus::Queued);

        let err = bob.request_download(attachment("c", 10), now).unwrap_err();
        assert!(matches!(err, Error::QueueFull(1)));
        assert_eq!(bob.transfers().len(), 2);
    }

    #[test]
    fn test_cancel_queued_keeps_slot_holder() {
        let dir = tempfile::tempdir().unwrap();
        let hub = MemoryHub::new();
        let _alice = hub.join("alice");
        let mut config = Config::default();
        config.transfer.max_concurrent_downloads = 1;
        let (mut bob, _events) = engine(&hub, "bob", config, dir.path());
        let now = Instant::now();

        let active = bob.request_download(attachment("a", 10), now).unwrap();
        let waiting = bob.request_download(attachment("b", 10), now).unwrap();
        bob.cancel(&waiting, now).unwrap();

        assert!(bob.download_queue().is_active(&active));
        assert_eq!(bob.download_queue().waiting_len(), 0);
        assert!(bob.history().iter().all(|e| e.request_id() != waiting));
    }

    #[test]
    fn test_cancel_active_admits_next() {
        let dir = tempfile::tempdir().unwrap();
        let hub = MemoryHub::new();
        let _alice = hub.join("alice");
        let mut config = Config::default();
        config.transfer.max_concurrent_downloads = 1;
        let (mut bob, _events) = engine(&hub, "bob", config, dir.path());
        let now = Instant::now();

        let active = bob.request_download(attachment("a", 10), now).unwrap();
        let waiting = bob.request_download(attachment("b", 10), now).unwrap();
        bob.cancel(&active, now).unwrap();

        assert_eq!(bob.transfer(&waiting).unwrap().status, TransferStatus::Requesting);
        assert!(bob.download_queue().is_active(&waiting));
    }

    #[test]
    fn test_signal_for_other_user_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let hub = MemoryHub::new();
        let (mut bob, _events) = engine(&hub, "bob", Config::default(), dir.path());

        let envelope = SignalEnvelope::new(
            Uuid::new_v4(),
            "alice",
            "carol",
            SignalPayload::TransferRequest {
                attachment_id: "a".to_string(),
            },
        );
        bob.handle_event(EngineEvent::Signal(envelope), Instant::now());
        assert!(bob.transfers().is_empty());
    }

    #[test]
    fn test_response_from_wrong_user_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let hub = MemoryHub::new();
        let _alice = hub.join("alice");
        let (mut bob, _events) = engine(&hub, "bob", Config::default(), dir.path());
        let now = Instant::now();

        let id = bob.request_download(attachment("a", 10), now).unwrap();
        let forged = SignalEnvelope::new(
            id,
            "mallory",
            "bob",
            SignalPayload::TransferResponse { accepted: false },
        );
        bob.handle_event(EngineEvent::Signal(forged), now);
        assert_eq!(bob.transfer(&id).unwrap().status, TransferStatus::Requesting);
    }

    #[test]
    fn test_chunk_before_meta_fails() {
        let dir = tempfile::tempdir().unwrap();
        let hub = MemoryHub::new();
        let _alice = hub.join("alice");
        let (mut bob, _events) = engine(&hub, "bob", Config::default(), dir.path());
        let now = Instant::now();

        let id = bob.request_download(attachment("a", 10), now).unwrap();
        bob.handle_event(
            EngineEvent::ChannelMessage {
                request_id: id,
                message: ChannelMessage::Text("{not json".to_string()),
            },
            now,
        );
        bob.handle_event(
            EngineEvent::ChannelMessage {
                request_id: id,
                message: ChannelMessage::Binary(vec![1, 2, 3]),
            },
            now,
        );

        let state = bob.transfer(&id).unwrap();
        assert_eq!(state.status, TransferStatus::Failed);
        assert!(state.error.as_deref().unwrap().contains("protocol"));
    }
}
