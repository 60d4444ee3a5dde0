//! Filesystem-backed content source and storage sink.
//!
//! Downloads are written to a hidden `.part` file next to their final
//! location and renamed into place only after the content hash checks out,
//! so a saved path always points at a complete file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{hex_digest, ContentSource, StorageSink, StreamHandle};
use crate::error::{Error, Result};
use crate::transfer::{AttachmentMeta, RequestId};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
struct SharedFile {
    path: PathBuf,
    meta: AttachmentMeta,
    handle: Option<File>,
}

/// Serves attachments straight from local files.
#[derive(Debug, Default)]
pub struct FsContentSource {
    files: HashMap<String, SharedFile>,
    read_calls: u64,
}

impl FsContentSource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a local file under a fresh attachment id.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn share(&mut self, path: &Path) -> Result<AttachmentMeta> {
        self.share_as(Uuid::new_v4().to_string(), path)
    }

    /// Share a local file under a given attachment id.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn share_as(&mut self, attachment_id: impl Into<String>, path: &Path) -> Result<AttachmentMeta> {
        let attachment_id = attachment_id.into();
        let file_name = path
            .file_name()
            .map_or_else(|| "attachment".to_string(), |n| n.to_string_lossy().to_string());
        let size_bytes = fs::metadata(path)?.len();
        let content_hash = hash_file(path)?;

        let meta = AttachmentMeta::new(attachment_id.clone(), file_name, size_bytes, content_hash);
        tracing::debug!(
            attachment_id = %attachment_id,
            path = %path.display(),
            size = size_bytes,
            "Shared local attachment"
        );
        self.files.insert(
            attachment_id,
            SharedFile {
                path: path.to_path_buf(),
                meta: meta.clone(),
                handle: None,
            },
        );
        Ok(meta)
    }

    /// Number of `read_chunk` calls served so far.
    #[must_use]
    pub const fn read_calls(&self) -> u64 {
        self.read_calls
    }
}

impl ContentSource for FsContentSource {
    fn get_record(&self, attachment_id: &str) -> Result<AttachmentMeta> {
        self.files
            .get(attachment_id)
            .map(|f| f.meta.clone())
            .ok_or_else(|| Error::AttachmentNotFound(attachment_id.to_string()))
    }

    fn read_chunk(&mut self, attachment_id: &str, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.read_calls += 1;
        let read_err = |e: std::io::Error| Error::ContentRead {
            attachment_id: attachment_id.to_string(),
            reason: e.to_string(),
        };

        let shared = self
            .files
            .get_mut(attachment_id)
            .ok_or_else(|| Error::AttachmentNotFound(attachment_id.to_string()))?;
        if shared.handle.is_none() {
            shared.handle = Some(File::open(&shared.path).map_err(read_err)?);
        }
        let Some(file) = shared.handle.as_mut() else {
            return Err(Error::Internal("content handle vanished".to_string()));
        };

        file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
        let mut buffer = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let n = file.read(&mut buffer[filled..]).map_err(read_err)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    fn shared_content(&self) -> Vec<(String, PathBuf)> {
        self.files
            .values()
            .map(|f| (f.meta.content_hash.clone(), f.path.clone()))
            .collect()
    }
}

/// Compute the lowercase hex SHA-256 of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex_digest(&hasher.finalize()))
}

#[derive(Debug)]
struct OpenStream {
    part_path: PathBuf,
    dest_dir: PathBuf,
    file_name: String,
    expected_hash: String,
    writer: BufWriter<File>,
    hasher: Sha256,
}

/// Writes downloads into a directory.
#[derive(Debug)]
pub struct FsStorage {
    download_dir: PathBuf,
    streams: HashMap<u64, OpenStream>,
    next_handle: u64,
}

impl FsStorage {
    /// Create a sink saving into `download_dir`.
    #[must_use]
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            streams: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Directory downloads are saved to.
    #[must_use]
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Number of streams currently open.
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }
}

impl StorageSink for FsStorage {
    fn begin_stream(
        &mut self,
        request_id: RequestId,
        file_name: &str,
        content_hash: &str,
        dest_hint: Option<&Path>,
    ) -> Result<StreamHandle> {
        let dest_dir = dest_hint.map_or_else(|| self.download_dir.clone(), Path::to_path_buf);
        fs::create_dir_all(&dest_dir).map_err(|e| Error::StorageWrite(e.to_string()))?;

        let part_path = dest_dir.join(format!(".{request_id}.part"));
        let file = File::create(&part_path).map_err(|e| Error::StorageWrite(e.to_string()))?;

        let handle = self.next_handle;
        self.next_handle += 1;
        self.streams.insert(
            handle,
            OpenStream {
                part_path,
                dest_dir,
                file_name: sanitize_file_name(file_name),
                expected_hash: content_hash.to_lowercase(),
                writer: BufWriter::new(file),
                hasher: Sha256::new(),
            },
        );
        Ok(StreamHandle(handle))
    }

    fn write_chunk(&mut self, handle: StreamHandle, bytes: &[u8]) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&handle.0)
            .ok_or_else(|| Error::StorageWrite("stream is not open".to_string()))?;
        stream
            .writer
            .write_all(bytes)
            .map_err(|e| Error::StorageWrite(e.to_string()))?;
        stream.hasher.update(bytes);
        Ok(())
    }

    fn finish_stream(&mut self, handle: StreamHandle) -> Result<PathBuf> {
        let stream = self
            .streams
            .remove(&handle.0)
            .ok_or_else(|| Error::StorageFinalize("stream is not open".to_string()))?;
        let OpenStream {
            part_path,
            dest_dir,
            file_name,
            expected_hash,
            writer,
            hasher,
        } = stream;

        let finalize = || -> Result<PathBuf> {
            let file = writer
                .into_inner()
                .map_err(|e| Error::StorageFinalize(e.error().to_string()))?;
            file.sync_all()
                .map_err(|e| Error::StorageFinalize(e.to_string()))?;
            drop(file);

            let actual = hex_digest(&hasher.finalize());
            if !expected_hash.is_empty() && actual != expected_hash {
                return Err(Error::HashMismatch {
                    expected: expected_hash,
                    actual,
                });
            }

            let final_path = unique_path(&dest_dir, &file_name);
            fs::rename(&part_path, &final_path)
                .map_err(|e| Error::StorageFinalize(e.to_string()))?;
            Ok(final_path)
        };

        let result = finalize();
        if result.is_err() {
            let _ = fs::remove_file(&part_path);
        }
        result
    }

    fn cancel_stream(&mut self, handle: StreamHandle) {
        if let Some(stream) = self.streams.remove(&handle.0) {
            drop(stream.writer);
            if let Err(e) = fs::remove_file(&stream.part_path) {
                tracing::warn!(
                    path = %stream.part_path.display(),
                    error = %e,
                    "Failed to remove partial download"
                );
            }
        }
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Strip directory components and reserved names from a remote file name.
fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().trim().to_string())
        .unwrap_or_default();
    if base.is_empty() || base == "." || base == ".." {
        "download".to_string()
    } else {
        base
    }
}

/// First path in `dir` named `file_name` or `stem (n).ext` that does not exist.
fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let as_path = Path::new(file_name);
    let stem = as_path
        .file_stem()
        .map_or_else(|| file_name.to_string(), |s| s.to_string_lossy().to_string());
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()));

    (1u32..)
        .map(|n| dir.join(format!("{stem} ({n}){}", ext.as_deref().unwrap_or(""))))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sha256_hex;
    use tempfile::TempDir;

    #[test]
    fn test_content_source_reads_ranges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"hello parley").unwrap();

        let mut source = FsContentSource::new();
        let meta = source.share_as("att-1", &path).unwrap();
        assert_eq!(meta.size_bytes, 12);
        assert_eq!(meta.content_hash, sha256_hex(b"hello parley"));
        assert_eq!(meta.extension.as_deref(), Some("txt"));

        assert_eq!(source.read_chunk("att-1", 0, 5).unwrap(), b"hello");
        assert_eq!(source.read_chunk("att-1", 6, 100).unwrap(), b"parley");
        assert!(source.read_chunk("att-1", 12, 10).unwrap().is_empty());
        assert_eq!(source.read_calls(), 3);
        assert_eq!(source.shared_content().len(), 1);
    }

    #[test]
    fn test_content_source_unknown_attachment() {
        let mut source = FsContentSource::new();
        assert!(matches!(
            source.get_record("nope"),
            Err(Error::AttachmentNotFound(_))
        ));
        assert!(source.read_chunk("nope", 0, 1).is_err());
    }

    #[test]
    fn test_storage_stream_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut storage = FsStorage::new(dir.path());
        let data = b"streamed content";

        let handle = storage
            .begin_stream(Uuid::new_v4(), "file.bin", &sha256_hex(data), None)
            .unwrap();
        storage.write_chunk(handle, &data[..8]).unwrap();
        storage.write_chunk(handle, &data[8..]).unwrap();
        let saved = storage.finish_stream(handle).unwrap();

        assert_eq!(saved, dir.path().join("file.bin"));
        assert_eq!(fs::read(&saved).unwrap(), data);
        assert!(storage.path_exists(&saved));
        assert_eq!(storage.open_streams(), 0);
    }

    #[test]
    fn test_storage_hash_mismatch_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let mut storage = FsStorage::new(dir.path());

        let handle = storage
            .begin_stream(Uuid::new_v4(), "bad.bin", &sha256_hex(b"expected"), None)
            .unwrap();
        storage.write_chunk(handle, b"tampered").unwrap();
        let err = storage.finish_stream(handle).unwrap_err();

        assert!(matches!(err, Error::HashMismatch { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_storage_cancel_removes_part_file() {
        let dir = TempDir::new().unwrap();
        let mut storage = FsStorage::new(dir.path());

        let handle = storage
            .begin_stream(Uuid::new_v4(), "partial.bin", "", None)
            .unwrap();
        storage.write_chunk(handle, b"half").unwrap();
        storage.cancel_stream(handle);

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(storage.write_chunk(handle, b"more").is_err());
    }

    #[test]
    fn test_storage_does_not_overwrite_existing_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("photo.jpg"), b"old").unwrap();
        let mut storage = FsStorage::new(dir.path());

        let handle = storage
            .begin_stream(Uuid::new_v4(), "../../photo.jpg", "", None)
            .unwrap();
        storage.write_chunk(handle, b"new").unwrap();
        let saved = storage.finish_stream(handle).unwrap();

        assert_eq!(saved, dir.path().join("photo (1).jpg"));
        assert_eq!(fs::read(dir.path().join("photo.jpg")).unwrap(), b"old");
    }
}
