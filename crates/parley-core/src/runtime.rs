//! Async driver for [`TransferEngine`].
//!
//! [`EngineHandle::spawn`] moves an engine into a tokio task that owns it
//! exclusively. The task multiplexes three inputs: commands from any number
//! of cloned handles, adapter events, and a periodic scheduler tick. After
//! every input the live transfer list is republished on a watch channel.

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::TransferEngine;
use crate::error::{Error, Result};
use crate::history::TransferHistoryEntry;
use crate::transfer::{AttachmentRef, RequestId, TransferState};
use crate::transport::EventReceiver;

const COMMAND_BUFFER: usize = 64;

enum Command {
    RequestDownload {
        attachment: AttachmentRef,
        dest_dir: Option<PathBuf>,
        reply: oneshot::Sender<Result<RequestId>>,
    },
    Cancel {
        request_id: RequestId,
        reply: oneshot::Sender<Result<()>>,
    },
    Accept {
        request_id: RequestId,
        reply: oneshot::Sender<Result<()>>,
    },
    Reject {
        request_id: RequestId,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearFinished {
        reply: oneshot::Sender<Vec<TransferState>>,
    },
    History {
        reply: oneshot::Sender<Vec<TransferHistoryEntry>>,
    },
    RemoveHistoryEntry {
        request_id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    RefreshAccessibility {
        reply: oneshot::Sender<usize>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to an engine running in its own task.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Vec<TransferState>>,
}

impl EngineHandle {
    /// Spawn `engine` onto the current tokio runtime.
    ///
    /// `events` is the receiving half of the queue the engine's adapters
    /// push into. The task ends after [`Self::shutdown`] or once every handle
    /// is dropped, and yields the engine back.
    pub fn spawn(engine: TransferEngine, events: EventReceiver) -> (Self, JoinHandle<TransferEngine>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(engine.transfers());

        let task = tokio::spawn(run(engine, command_rx, events, snapshot_tx));

        (
            Self {
                commands: command_tx,
                snapshot: snapshot_rx,
            },
            task,
        )
    }

    /// Request an attachment download.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, or [`Error::EngineStopped`].
    pub async fn request_download(&self, attachment: AttachmentRef) -> Result<RequestId> {
        self.request_download_to(attachment, None).await
    }

    /// Request an attachment download into `dest_dir`.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, or [`Error::EngineStopped`].
    pub async fn request_download_to(
        &self,
        attachment: AttachmentRef,
        dest_dir: Option<PathBuf>,
    ) -> Result<RequestId> {
        self.call(|reply| Command::RequestDownload {
            attachment,
            dest_dir,
            reply,
        })
        .await?
    }

    /// Cancel a transfer.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, or [`Error::EngineStopped`].
    pub async fn cancel(&self, request_id: RequestId) -> Result<()> {
        self.call(|reply| Command::Cancel { request_id, reply }).await?
    }

    /// Serve an incoming request.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, or [`Error::EngineStopped`].
    pub async fn accept(&self, request_id: RequestId) -> Result<()> {
        self.call(|reply| Command::Accept { request_id, reply }).await?
    }

    /// Decline an incoming request.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, or [`Error::EngineStopped`].
    pub async fn reject(&self, request_id: RequestId) -> Result<()> {
        self.call(|reply| Command::Reject { request_id, reply }).await?
    }

    /// Remove terminal transfers from the live list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine task is gone.
    pub async fn clear_finished(&self) -> Result<Vec<TransferState>> {
        self.call(|reply| Command::ClearFinished { reply }).await
    }

    /// Copy of the persisted history, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine task is gone.
    pub async fn history(&self) -> Result<Vec<TransferHistoryEntry>> {
        self.call(|reply| Command::History { reply }).await
    }

    /// Delete a history entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine task is gone.
    pub async fn remove_history_entry(&self, request_id: RequestId) -> Result<bool> {
        self.call(|reply| Command::RemoveHistoryEntry { request_id, reply })
            .await
    }

    /// Re-check saved downloads on disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine task is gone.
    pub async fn refresh_accessibility(&self) -> Result<usize> {
        self.call(|reply| Command::RefreshAccessibility { reply }).await
    }

    /// Drop all live state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine task is gone.
    pub async fn reset(&self) -> Result<()> {
        self.call(|reply| Command::Reset { reply }).await
    }

    /// Stop the engine task, persisting history.
    ///
    /// # Errors
    ///
    /// Returns the history save error, or [`Error::EngineStopped`].
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Command::Shutdown { reply }).await?
    }

    /// Latest published transfer list.
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferState> {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified whenever the transfer list changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<TransferState>> {
        self.snapshot.clone()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::EngineStopped)?;
        reply_rx.await.map_err(|_| Error::EngineStopped)
    }
}

async fn run(
    mut engine: TransferEngine,
    mut commands: mpsc::Receiver<Command>,
    mut events: EventReceiver,
    snapshot: watch::Sender<Vec<TransferState>>,
) -> TransferEngine {
    let mut ticker = tokio::time::interval(engine.config().transfer.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!(user = %engine.local_user(), "Transfer engine started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    tracing::debug!("All engine handles dropped");
                    if let Err(e) = engine.shutdown(now()) {
                        tracing::warn!(error = %e, "Failed to persist history on exit");
                    }
                    break;
                };
                if let Command::Shutdown { reply } = command {
                    let _ = reply.send(engine.shutdown(now()));
                    publish(&engine, &snapshot);
                    break;
                }
                apply(&mut engine, command);
            }
            Some(event) = events.recv() => engine.handle_event(event, now()),
            _ = ticker.tick() => engine.tick(now()),
        }
        publish(&engine, &snapshot);
    }

    tracing::debug!(user = %engine.local_user(), "Transfer engine stopped");
    engine
}

fn apply(engine: &mut TransferEngine, command: Command) {
    // A dropped reply receiver just means the caller stopped waiting.
    match command {
        Command::RequestDownload {
            attachment,
            dest_dir,
            reply,
        } => {
            let _ = reply.send(engine.request_download_to(attachment, dest_dir, now()));
        }
        Command::Cancel { request_id, reply } => {
            let _ = reply.send(engine.cancel(&request_id, now()));
        }
        Command::Accept { request_id, reply } => {
            let _ = reply.send(engine.accept_request(&request_id, now()));
        }
        Command::Reject { request_id, reply } => {
            let _ = reply.send(engine.reject_request(&request_id, now()));
        }
        Command::ClearFinished { reply } => {
            let _ = reply.send(engine.clear_finished());
        }
        Command::History { reply } => {
            let _ = reply.send(engine.history().to_vec());
        }
        Command::RemoveHistoryEntry { request_id, reply } => {
            let _ = reply.send(engine.remove_history_entry(&request_id));
        }
        Command::RefreshAccessibility { reply } => {
            let _ = reply.send(engine.refresh_accessibility());
        }
        Command::Reset { reply } => {
            engine.reset(now());
            let _ = reply.send(());
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(engine.shutdown(now()));
        }
    }
}

fn publish(engine: &TransferEngine, snapshot: &watch::Sender<Vec<TransferState>>) {
    snapshot.send_if_modified(|current| {
        let next = engine.transfers();
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

/// Current time on tokio's clock, so paused test time drives the engine.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}
