//! Content source and storage sink seams.
//!
//! The uploader reads attachment bytes through a [`ContentSource`]; the
//! downloader streams received bytes into a [`StorageSink`]. [`fs`] has
//! filesystem-backed implementations of both.

pub mod fs;

pub use fs::{FsContentSource, FsStorage};

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::transfer::{AttachmentMeta, RequestId};

/// Random-access reader over locally stored attachments.
pub trait ContentSource: Send {
    /// Look up the descriptor of a local attachment.
    fn get_record(&self, attachment_id: &str) -> Result<AttachmentMeta>;

    /// Read up to `length` bytes at `offset`.
    ///
    /// Returns fewer bytes at end of file and an empty vector past it.
    fn read_chunk(&mut self, attachment_id: &str, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Content hashes and paths of everything shared locally.
    fn shared_content(&self) -> Vec<(String, PathBuf)> {
        Vec::new()
    }
}

/// Opaque handle of an output stream opened by a [`StorageSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Incremental writer for downloaded files.
pub trait StorageSink: Send {
    /// Open an output stream for a download.
    ///
    /// `dest_hint` optionally overrides the destination directory.
    fn begin_stream(
        &mut self,
        request_id: RequestId,
        file_name: &str,
        content_hash: &str,
        dest_hint: Option<&Path>,
    ) -> Result<StreamHandle>;

    /// Append bytes to the stream.
    fn write_chunk(&mut self, handle: StreamHandle, bytes: &[u8]) -> Result<()>;

    /// Make the stream's content visible as the saved file and return its path.
    fn finish_stream(&mut self, handle: StreamHandle) -> Result<PathBuf>;

    /// Discard the stream and anything written to it.
    fn cancel_stream(&mut self, handle: StreamHandle);

    /// Whether a saved file still exists.
    fn path_exists(&self, path: &Path) -> bool;
}

/// Format a digest as lowercase hex.
#[must_use]
pub fn hex_digest(digest: &[u8]) -> String {
    use std::fmt::Write;
    digest.iter().fold(String::with_capacity(digest.len() * 2), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Lowercase hex SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_digest(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_digest() {
        assert_eq!(hex_digest(&[0x00, 0xab, 0x0f]), "00ab0f");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
