//! Error types for Parley.
//!
//! This module provides a unified error type for all transfer engine
//! operations, with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Parley operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Parley.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport channel could not be opened (E101)
    #[error("transport channel failed to open: {0}")]
    ChannelOpenFailed(String),

    /// Transport channel closed before the transfer finished (E102)
    #[error("channel closed before transfer completed")]
    ChannelClosed,

    /// Sending on the transport channel failed
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// Remote peer declined the transfer (E103)
    #[error("transfer rejected by remote peer")]
    TransferRejected,

    /// Transfer was cancelled locally
    #[error("transfer cancelled")]
    TransferCancelled,

    /// No progress for longer than the idle timeout (E104)
    #[error("transfer stalled: no progress for {0} seconds")]
    Stalled(u64),

    /// Reading attachment content failed on the uploader (E105)
    #[error("failed to read attachment '{attachment_id}': {reason}")]
    ContentRead {
        /// Attachment being read
        attachment_id: String,
        /// Reason for failure
        reason: String,
    },

    /// Attachment is not available locally
    #[error("attachment not found: {0}")]
    AttachmentNotFound(String),

    /// Writing downloaded bytes failed (E106)
    #[error("failed to write download: {0}")]
    StorageWrite(String),

    /// Finalizing the downloaded file failed (E107)
    #[error("failed to finalize download: {0}")]
    StorageFinalize(String),

    /// Downloaded bytes do not match the declared content hash (E108)
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Declared hash
        expected: String,
        /// Hash of the received bytes
        actual: String,
    },

    /// Received byte count disagrees with the declared size
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Declared size
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },

    /// Invalid in-band or signaling message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Request id is not known to the engine
    #[error("unknown transfer request: {0}")]
    UnknownRequest(String),

    /// Requested status transition is not allowed
    #[error("invalid transition for {request_id}: {from} -> {to}")]
    InvalidTransition {
        /// Request being mutated
        request_id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Download admission queue is full
    #[error("download queue is full ({0} waiting)")]
    QueueFull(usize),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// History database error
    #[error("history store error: {0}")]
    HistoryError(String),

    /// Engine task is no longer running
    #[error("transfer engine has shut down")]
    EngineStopped,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::ChannelOpenFailed(_) => Some("E101"),
            Self::ChannelClosed => Some("E102"),
            Self::TransferRejected => Some("E103"),
            Self::Stalled(_) => Some("E104"),
            Self::ContentRead { .. } => Some("E105"),
            Self::StorageWrite(_) => Some("E106"),
            Self::StorageFinalize(_) => Some("E107"),
            Self::HashMismatch { .. } => Some("E108"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable.
    ///
    /// Recoverable errors are swallowed by the engine instead of failing
    /// the transfer they occurred on.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ChannelSend(_) | Self::ProtocolError(_))
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Stalled(_) | Self::ChannelClosed | Self::ChannelOpenFailed(_) => {
                Some("The other peer may have gone offline. Request the attachment again.")
            }
            Self::HashMismatch { .. } | Self::SizeMismatch { .. } => {
                Some("The received file was corrupted and has been discarded. Try again.")
            }
            Self::StorageWrite(_) | Self::StorageFinalize(_) => {
                Some("Check free disk space and permissions of the download directory.")
            }
            _ => None,
        }
    }
}
