//! Transfer data model.
//!
//! Types shared by every engine component: attachment descriptors, the
//! per-request [`TransferState`] the UI reads, and the status machine that
//! governs how a state may change.
//!
//! ## Status machine
//!
//! ```text
//! queued -> requesting -> connecting -> transferring -> completed
//!                \______________\______________\______> rejected | failed
//! ```
//!
//! Terminal states are sticky.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one transfer request.
pub type RequestId = Uuid;

/// Identifier of an attachment, independent of any transfer.
pub type AttachmentId = String;

/// Identifier of a chat user.
pub type UserId = String;

/// Immutable descriptor of attachment content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    /// Attachment identifier
    pub attachment_id: AttachmentId,
    /// Original file name
    pub file_name: String,
    /// Lowercase file extension, if any
    pub extension: Option<String>,
    /// Content size in bytes
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the content
    pub content_hash: String,
}

impl AttachmentMeta {
    /// Create a descriptor, deriving the extension from the file name.
    #[must_use]
    pub fn new(
        attachment_id: impl Into<AttachmentId>,
        file_name: impl Into<String>,
        size_bytes: u64,
        content_hash: impl Into<String>,
    ) -> Self {
        let file_name = file_name.into();
        let extension = Path::new(&file_name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase());
        Self {
            attachment_id: attachment_id.into(),
            file_name,
            extension,
            size_bytes,
            content_hash: content_hash.into(),
        }
    }
}

/// What the UI knows about an attachment it wants to download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Attachment identifier
    pub attachment_id: AttachmentId,
    /// User holding the content
    pub owner: UserId,
    /// Display file name
    pub file_name: String,
    /// Size announced in the chat message, if known
    pub size_bytes: Option<u64>,
    /// Content hash announced in the chat message, if known
    pub content_hash: Option<String>,
}

/// Direction of a transfer from the local user's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Serving local content to a peer
    Upload,
    /// Fetching content from a peer
    Download,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => write!(f, "Upload"),
            Self::Download => write!(f, "Download"),
        }
    }
}

/// Status of a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Download blocked by the admission cap
    Queued,
    /// Out-of-band request sent, waiting for the peer's answer
    Requesting,
    /// Transport channel being established
    Connecting,
    /// Bytes are moving
    Transferring,
    /// Transfer finished successfully
    Completed,
    /// Remote peer declined
    Rejected,
    /// Transfer failed
    Failed,
}

impl TransferStatus {
    /// Whether no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use TransferStatus::{
            Completed, Connecting, Failed, Queued, Rejected, Requesting, Transferring,
        };
        match (self, next) {
            (Completed | Rejected | Failed, _) => false,
            (Queued, Requesting)
            | (Requesting, Connecting)
            | (Connecting, Transferring)
            | (Transferring, Completed)
            | (Queued | Requesting | Connecting, Rejected)
            | (_, Failed) => true,
            // Cache hits complete without ever moving a byte.
            (Queued | Requesting, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Queued => "Queued",
            Self::Requesting => "Requesting",
            Self::Connecting => "Connecting",
            Self::Transferring => "Transferring",
            Self::Completed => "Completed",
            Self::Rejected => "Rejected",
            Self::Failed => "Failed",
        };
        write!(f, "{label}")
    }
}

/// Live state of one transfer request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    /// Request identifier
    pub request_id: RequestId,
    /// Attachment being moved
    pub attachment_id: AttachmentId,
    /// File name shown to the user
    pub file_name: String,
    /// Upload or download
    pub direction: TransferDirection,
    /// The other user taking part
    pub counterpart_user_id: UserId,
    /// Current status
    pub status: TransferStatus,
    /// Fraction of bytes done, in `[0, 1]`
    pub progress: f64,
    /// Smoothed speed in KB/s
    pub displayed_speed: Option<f64>,
    /// Dampened ETA in seconds
    pub displayed_eta: Option<u64>,
    /// Where the downloaded file was saved (downloads, once completed)
    pub saved_path: Option<PathBuf>,
    /// Short error description (failed or rejected)
    pub error: Option<String>,
    /// Content size, once known
    pub size_bytes: Option<u64>,
    /// Content hash, once known
    pub content_hash: Option<String>,
}

impl TransferState {
    /// Create a state in the given initial status.
    #[must_use]
    pub fn new(
        request_id: RequestId,
        attachment_id: impl Into<AttachmentId>,
        file_name: impl Into<String>,
        direction: TransferDirection,
        counterpart_user_id: impl Into<UserId>,
        status: TransferStatus,
    ) -> Self {
        Self {
            request_id,
            attachment_id: attachment_id.into(),
            file_name: file_name.into(),
            direction,
            counterpart_user_id: counterpart_user_id.into(),
            status,
            progress: 0.0,
            displayed_speed: None,
            displayed_eta: None,
            saved_path: None,
            error: None,
            size_bytes: None,
            content_hash: None,
        }
    }

    /// Whether the state is completed, rejected or failed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
