//! Live transfer table.
//!
//! The registry is the single source of truth the UI reads: one
//! [`TransferState`] per request, mutated only through the status machine
//! in [`crate::transfer`]. Snapshots are returned in creation order.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::transfer::{RequestId, TransferDirection, TransferState, TransferStatus};

#[derive(Debug)]
struct Slot {
    seq: u64,
    state: TransferState,
}

/// In-memory table of transfer states.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    slots: HashMap<RequestId, Slot>,
    next_seq: u64,
}

impl TransferRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transfer. Replaces any state stored under the same request id.
    pub fn insert(&mut self, state: TransferState) -> Option<TransferState> {
        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::debug!(
            request_id = %state.request_id,
            direction = %state.direction,
            status = %state.status,
            "Transfer registered"
        );
        self.slots
            .insert(state.request_id, Slot { seq, state })
            .map(|slot| slot.state)
    }

    /// Look up a transfer.
    #[must_use]
    pub fn get(&self, request_id: &RequestId) -> Option<&TransferState> {
        self.slots.get(request_id).map(|slot| &slot.state)
    }

    /// Whether a transfer exists.
    #[must_use]
    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.slots.contains_key(request_id)
    }

    /// Move a transfer to `next`.
    ///
    /// Moving to the current status is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRequest`] or [`Error::InvalidTransition`].
    pub fn transition(&mut self, request_id: &RequestId, next: TransferStatus) -> Result<&TransferState> {
        let state = self.state_mut(request_id)?;
        if state.status != next {
            if !state.status.can_transition_to(next) {
                return Err(Error::InvalidTransition {
                    request_id: request_id.to_string(),
                    from: state.status.to_string(),
                    to: next.to_string(),
                });
            }
            tracing::info!(
                request_id = %request_id,
                from = %state.status,
                to = %next,
                "Transfer status changed"
            );
            state.status = next;
        }
        Ok(state)
    }

    /// Record size and hash once they are known.
    pub fn set_content(&mut self, request_id: &RequestId, size_bytes: u64, content_hash: &str) {
        if let Ok(state) = self.state_mut(request_id) {
            state.size_bytes = Some(size_bytes);
            if !content_hash.is_empty() {
                state.content_hash = Some(content_hash.to_string());
            }
        }
    }

    /// Update progress and displayed telemetry of a live transfer.
    ///
    /// Terminal transfers are left untouched. Returns whether anything changed.
    pub fn update_progress(
        &mut self,
        request_id: &RequestId,
        progress: f64,
        speed: Option<f64>,
        eta: Option<u64>,
    ) -> bool {
        let Ok(state) = self.state_mut(request_id) else {
            return false;
        };
        if state.is_terminal() {
            return false;
        }
        state.progress = progress.clamp(0.0, 1.0);
        if speed.is_some() {
            state.displayed_speed = speed;
        }
        if eta.is_some() {
            state.displayed_eta = eta;
        }
        true
    }

    /// Mark a transfer completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or cannot complete.
    pub fn complete(&mut self, request_id: &RequestId, saved_path: Option<PathBuf>) -> Result<&TransferState> {
        self.transition(request_id, TransferStatus::Completed)?;
        let state = self.state_mut(request_id)?;
        state.progress = 1.0;
        state.displayed_eta = Some(0);
        if state.saved_path.is_none() {
            state.saved_path = saved_path;
        }
        Ok(state)
    }

    /// Mark a transfer failed with a short description.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or already terminal.
    pub fn fail(&mut self, request_id: &RequestId, error: impl Into<String>) -> Result<&TransferState> {
        self.transition(request_id, TransferStatus::Failed)?;
        let state = self.state_mut(request_id)?;
        state.error = Some(error.into());
        state.displayed_speed = None;
        state.displayed_eta = None;
        Ok(state)
    }

    /// Mark a transfer rejected by the remote peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or cannot be rejected.
    pub fn reject(&mut self, request_id: &RequestId) -> Result<&TransferState> {
        self.transition(request_id, TransferStatus::Rejected)?;
        let state = self.state_mut(request_id)?;
        state.error = Some(Error::TransferRejected.to_string());
        Ok(state)
    }

    /// Remove a transfer.
    pub fn remove(&mut self, request_id: &RequestId) -> Option<TransferState> {
        self.slots.remove(request_id).map(|slot| slot.state)
    }

    /// Live download of `attachment_id`, if any.
    #[must_use]
    pub fn find_live_download(&self, attachment_id: &str) -> Option<RequestId> {
        self.slots
            .values()
            .filter(|slot| {
                slot.state.direction == TransferDirection::Download
                    && slot.state.attachment_id == attachment_id
                    && !slot.state.is_terminal()
            })
            .min_by_key(|slot| slot.seq)
            .map(|slot| slot.state.request_id)
    }

    /// Drop failed or rejected downloads of `attachment_id`.
    ///
    /// Called when a new download replaces them. Returns the ids removed.
    pub fn remove_superseded(&mut self, attachment_id: &str) -> Vec<RequestId> {
        let stale: Vec<RequestId> = self
            .slots
            .values()
            .filter(|slot| {
                slot.state.direction == TransferDirection::Download
                    && slot.state.attachment_id == attachment_id
                    && matches!(
                        slot.state.status,
                        TransferStatus::Failed | TransferStatus::Rejected
                    )
            })
            .map(|slot| slot.state.request_id)
            .collect();
        for id in &stale {
            self.slots.remove(id);
        }
        stale
    }

    /// All transfers in creation order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TransferState> {
        let mut slots: Vec<&Slot> = self.slots.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.state.clone()).collect()
    }

    /// Remove every terminal transfer and return them.
    pub fn clear_terminal(&mut self) -> Vec<TransferState> {
        let done: Vec<RequestId> = self
            .slots
            .values()
            .filter(|slot| slot.state.is_terminal())
            .map(|slot| slot.state.request_id)
            .collect();
        done.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Number of transfers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Forget every transfer.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.next_seq = 0;
    }

    fn state_mut(&mut self, request_id: &RequestId) -> Result<&mut TransferState> {
        self.slots
            .get_mut(request_id)
            .map(|slot| &mut slot.state)
            .ok_or_else(|| Error::UnknownRequest(request_id.to_string()))
    }
}
