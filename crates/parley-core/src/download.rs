//! Receive-side stream writer.
//!
//! One [`DownloadStream`] per download request. Chunks arriving from the
//! channel are appended to a pending buffer; [`DownloadStream::drain`] writes
//! them to the [`StorageSink`] in order, a bounded batch at a time, so the
//! file is never held in memory as a whole.
//!
//! Flow control is receiver driven: once the pending backlog exceeds the
//! pause threshold a single `flow_pause` goes upstream, and a single
//! `flow_resume` follows when it drops back below the resume threshold.
//!
//! Invariants: `written <= received <= expected` once `meta` arrived, and
//! `pending = received - written`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::config::FlowConfig;
use crate::error::{Error, Result};
use crate::protocol::ControlFrame;
use crate::storage::{StorageSink, StreamHandle};
use crate::transfer::RequestId;

/// Receive pipeline of one download.
#[derive(Debug)]
pub struct DownloadStream {
    request_id: RequestId,
    dest_hint: Option<PathBuf>,
    handle: Option<StreamHandle>,
    expected_size: Option<u64>,
    content_hash: Option<String>,
    received_bytes: u64,
    written_bytes: u64,
    pending: VecDeque<Vec<u8>>,
    pending_bytes: u64,
    remote_done: bool,
    flow_pause_sent: bool,
}

impl DownloadStream {
    /// Create a stream for `request_id`, optionally saving into `dest_hint`.
    #[must_use]
    pub fn new(request_id: RequestId, dest_hint: Option<PathBuf>) -> Self {
        Self {
            request_id,
            dest_hint,
            handle: None,
            expected_size: None,
            content_hash: None,
            received_bytes: 0,
            written_bytes: 0,
            pending: VecDeque::new(),
            pending_bytes: 0,
            remote_done: false,
            flow_pause_sent: false,
        }
    }

    /// Handle the `meta` frame: open the output stream.
    ///
    /// # Errors
    ///
    /// Returns an error on a repeated `meta` or if the sink cannot open the
    /// output.
    pub fn on_meta(
        &mut self,
        file_name: &str,
        size_bytes: u64,
        content_hash: &str,
        sink: &mut dyn StorageSink,
    ) -> Result<()> {
        if self.is_started() {
            return Err(Error::ProtocolError("duplicate meta frame".to_string()));
        }
        let handle = sink.begin_stream(
            self.request_id,
            file_name,
            content_hash,
            self.dest_hint.as_deref(),
        )?;
        tracing::debug!(
            request_id = %self.request_id,
            size = size_bytes,
            "Download stream opened"
        );
        self.handle = Some(handle);
        self.expected_size = Some(size_bytes);
        self.content_hash = Some(content_hash.to_string());
        Ok(())
    }

    /// Buffer a binary chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if no `meta` was received, `done` was already
    /// received, or the chunk overruns the declared size.
    pub fn on_chunk(&mut self, bytes: Vec<u8>) -> Result<()> {
        let Some(expected) = self.expected_size else {
            return Err(Error::ProtocolError("chunk before meta".to_string()));
        };
        if self.remote_done {
            return Err(Error::ProtocolError("chunk after done".to_string()));
        }
        let received = self.received_bytes + bytes.len() as u64;
        if received > expected {
            return Err(Error::SizeMismatch {
                expected,
                actual: received,
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.received_bytes = received;
        self.pending_bytes += bytes.len() as u64;
        self.pending.push_back(bytes);
        Ok(())
    }

    /// Handle the `done` frame.
    ///
    /// # Errors
    ///
    /// Returns an error if no `meta` was received.
    pub fn on_done(&mut self) -> Result<()> {
        if !self.is_started() {
            return Err(Error::ProtocolError("done before meta".to_string()));
        }
        self.remote_done = true;
        Ok(())
    }

    /// Write up to `max_batches` batches of at most `batch_bytes` each.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns the sink's error; the stream should then be aborted.
    pub fn drain(
        &mut self,
        sink: &mut dyn StorageSink,
        batch_bytes: usize,
        max_batches: usize,
    ) -> Result<u64> {
        let Some(handle) = self.handle else {
            return Ok(0);
        };
        let batch_bytes = batch_bytes.max(1);
        let mut written = 0;

        for _ in 0..max_batches.max(1) {
            if self.pending.is_empty() {
                break;
            }
            let batch = self.next_batch(batch_bytes);
            sink.write_chunk(handle, &batch)?;
            let len = batch.len() as u64;
            self.written_bytes += len;
            self.pending_bytes -= len;
            written += len;
        }
        Ok(written)
    }

    /// Flow-control frame that should be sent upstream now, if any.
    #[must_use]
    pub fn pending_flow_signal(&self, flow: &FlowConfig) -> Option<ControlFrame> {
        if !self.flow_pause_sent && self.pending_bytes > flow.pause_threshold {
            Some(ControlFrame::FlowPause)
        } else if self.flow_pause_sent && self.pending_bytes < flow.resume_threshold {
            Some(ControlFrame::FlowResume)
        } else {
            None
        }
    }

    /// Record that a flow-control frame went out.
    pub fn mark_flow_signal_sent(&mut self, frame: &ControlFrame) {
        match frame {
            ControlFrame::FlowPause => self.flow_pause_sent = true,
            ControlFrame::FlowResume => self.flow_pause_sent = false,
            ControlFrame::Meta { .. } | ControlFrame::Done => {}
        }
    }

    /// Whether every byte arrived and was written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.is_started() && self.remote_done && self.pending.is_empty()
    }

    /// Turn the written output into the saved file.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is incomplete, the byte count differs
    /// from the declared size, or the sink fails to finalize. The output is
    /// discarded in every error case.
    pub fn finalize(&mut self, sink: &mut dyn StorageSink) -> Result<PathBuf> {
        if !self.is_complete() {
            return Err(Error::Internal("finalize on incomplete stream".to_string()));
        }
        let Some(handle) = self.handle.take() else {
            return Err(Error::Internal("download stream not open".to_string()));
        };
        let expected = self.expected_size.unwrap_or(0);
        if self.written_bytes != expected {
            sink.cancel_stream(handle);
            return Err(Error::SizeMismatch {
                expected,
                actual: self.written_bytes,
            });
        }
        let path = sink.finish_stream(handle)?;
        tracing::debug!(
            request_id = %self.request_id,
            path = %path.display(),
            bytes = self.written_bytes,
            "Download stream finalized"
        );
        Ok(path)
    }

    /// Discard the output and anything still pending.
    pub fn abort(&mut self, sink: &mut dyn StorageSink) {
        if let Some(handle) = self.handle.take() {
            sink.cancel_stream(handle);
        }
        self.pending.clear();
        self.pending_bytes = 0;
    }

    /// Fraction of the declared size written so far.
    #[must_use]
    pub fn progress(&self) -> f64 {
        match self.expected_size {
            Some(0) => 1.0,
            Some(expected) => self.written_bytes as f64 / expected as f64,
            None => 0.0,
        }
    }

    /// Whether `meta` was received.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.expected_size.is_some()
    }

    /// Declared size.
    #[must_use]
    pub const fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    /// Declared content hash.
    #[must_use]
    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    /// Bytes received from the channel.
    #[must_use]
    pub const fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Bytes handed to the sink.
    #[must_use]
    pub const fn written_bytes(&self) -> u64 {
        self.written_bytes
    }

    /// Bytes received but not yet written.
    #[must_use]
    pub const fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// Whether `done` was received.
    #[must_use]
    pub const fn remote_done(&self) -> bool {
        self.remote_done
    }

    /// Destination directory override.
    #[must_use]
    pub fn dest_hint(&self) -> Option<&Path> {
        self.dest_hint.as_deref()
    }

    fn next_batch(&mut self, batch_bytes: usize) -> Vec<u8> {
        let mut batch = Vec::with_capacity(batch_bytes.min(self.pending_bytes as usize));
        while batch.len() < batch_bytes {
            let Some(front) = self.pending.front_mut() else {
                break;
            };
            let room = batch_bytes - batch.len();
            if front.len() <= room {
                if let Some(chunk) = self.pending.pop_front() {
                    batch.extend_from_slice(&chunk);
                }
            } else {
                batch.extend(front.drain(..room));
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[derive(Debug, Default)]
    struct MemorySink {
        open: HashMap<u64, Vec<u8>>,
        saved: HashMap<PathBuf, Vec<u8>>,
        writes: Vec<usize>,
        next: u64,
        fail_writes_after: Option<usize>,
        cancelled: usize,
    }

    impl StorageSink for MemorySink {
        fn begin_stream(
            &mut self,
            _request_id: RequestId,
            _file_name: &str,
            _content_hash: &str,
            _dest_hint: Option<&Path>,
        ) -> Result<StreamHandle> {
            self.next += 1;
            self.open.insert(self.next, Vec::new());
            Ok(StreamHandle(self.next))
        }

        fn write_chunk(&mut self, handle: StreamHandle, bytes: &[u8]) -> Result<()> {
            if self.fail_writes_after.is_some_and(|n| self.writes.len() >= n) {
                return Err(Error::StorageWrite("disk full".into()));
            }
            self.writes.push(bytes.len());
            self.open.get_mut(&handle.0).unwrap().extend_from_slice(bytes);
            Ok(())
        }

        fn finish_stream(&mut self, handle: StreamHandle) -> Result<PathBuf> {
            let data = self.open.remove(&handle.0).unwrap();
            let path = PathBuf::from(format!("/saved/{}", handle.0));
            self.saved.insert(path.clone(), data);
            Ok(path)
        }

        fn cancel_stream(&mut self, handle: StreamHandle) {
            self.open.remove(&handle.0);
            self.cancelled += 1;
        }

        fn path_exists(&self, path: &Path) -> bool {
            self.saved.contains_key(path)
        }
    }

    fn flow() -> FlowConfig {
        FlowConfig {
            pause_threshold: 100,
            resume_threshold: 40,
        }
    }

    fn started(size: u64, sink: &mut MemorySink) -> DownloadStream {
        let mut stream = DownloadStream::new(Uuid::new_v4(), None);
        stream.on_meta("f.bin", size, "", sink).unwrap();
        stream
    }

    #[test]
    fn test_chunks_written_in_order() {
        let mut sink = MemorySink::default();
        let mut stream = started(10, &mut sink);

        stream.on_chunk(vec![0, 1, 2]).unwrap();
        stream.on_chunk(vec![3, 4, 5, 6]).unwrap();
        stream.on_chunk(vec![7, 8, 9]).unwrap();
        stream.on_done().unwrap();

        assert_eq!(stream.drain(&mut sink, 4, 1).unwrap(), 4);
        assert_eq!(stream.pending_bytes(), 6);
        assert!(!stream.is_complete());
        assert_eq!(stream.drain(&mut sink, 4, 10).unwrap(), 6);
        assert_eq!(sink.writes, vec![4, 4, 2]);

        assert!(stream.is_complete());
        assert_eq!(stream.written_bytes(), stream.received_bytes());
        let path = stream.finalize(&mut sink).unwrap();
        assert_eq!(sink.saved[&path], (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_chunk_before_meta_is_error() {
        let mut stream = DownloadStream::new(Uuid::new_v4(), None);
        assert!(stream.on_chunk(vec![1]).is_err());
        assert!(stream.on_done().is_err());
    }

    #[test]
    fn test_overrun_is_size_mismatch() {
        let mut sink = MemorySink::default();
        let mut stream = started(3, &mut sink);
        stream.on_chunk(vec![1, 2]).unwrap();
        assert!(matches!(
            stream.on_chunk(vec![3, 4]),
            Err(Error::SizeMismatch { expected: 3, actual: 4 })
        ));
        assert_eq!(stream.received_bytes(), 2);
    }

    #[test]
    fn test_short_stream_fails_finalize() {
        let mut sink = MemorySink::default();
        let mut stream = started(5, &mut sink);
        stream.on_chunk(vec![1, 2]).unwrap();
        stream.on_done().unwrap();
        stream.drain(&mut sink, 64, 4).unwrap();

        assert!(matches!(
            stream.finalize(&mut sink),
            Err(Error::SizeMismatch { expected: 5, actual: 2 })
        ));
        assert_eq!(sink.cancelled, 1);
        assert!(sink.saved.is_empty());
    }

    #[test]
    fn test_write_failure_propagates() {
        let mut sink = MemorySink {
            fail_writes_after: Some(1),
            ..MemorySink::default()
        };
        let mut stream = started(8, &mut sink);
        stream.on_chunk(vec![0; 8]).unwrap();

        assert!(stream.drain(&mut sink, 4, 4).is_err());
        assert_eq!(stream.written_bytes(), 4);
        stream.abort(&mut sink);
        assert_eq!(sink.cancelled, 1);
        assert_eq!(stream.pending_bytes(), 0);
    }

    #[test]
    fn test_single_pause_until_resume() {
        let mut sink = MemorySink::default();
        let mut stream = started(1_000, &mut sink);

        stream.on_chunk(vec![0; 60]).unwrap();
        assert_eq!(stream.pending_flow_signal(&flow()), None);
        stream.on_chunk(vec![0; 60]).unwrap();
        let frame = stream.pending_flow_signal(&flow()).unwrap();
        assert_eq!(frame, ControlFrame::FlowPause);
        stream.mark_flow_signal_sent(&frame);

        stream.on_chunk(vec![0; 60]).unwrap();
        assert_eq!(stream.pending_flow_signal(&flow()), None);

        stream.drain(&mut sink, 50, 2).unwrap();
        assert_eq!(stream.pending_bytes(), 80);
        assert_eq!(stream.pending_flow_signal(&flow()), None);

        stream.drain(&mut sink, 50, 1).unwrap();
        let frame = stream.pending_flow_signal(&flow()).unwrap();
        assert_eq!(frame, ControlFrame::FlowResume);
        stream.mark_flow_signal_sent(&frame);
        assert_eq!(stream.pending_flow_signal(&flow()), None);
    }

    #[test]
    fn test_unsent_pause_is_offered_again() {
        let mut sink = MemorySink::default();
        let mut stream = started(1_000, &mut sink);
        stream.on_chunk(vec![0; 200]).unwrap();

        assert_eq!(stream.pending_flow_signal(&flow()), Some(ControlFrame::FlowPause));
        assert_eq!(stream.pending_flow_signal(&flow()), Some(ControlFrame::FlowPause));
    }

    #[test]
    fn test_empty_download() {
        let mut sink = MemorySink::default();
        let mut stream = started(0, &mut sink);
        stream.on_done().unwrap();
        assert!(stream.is_complete());
        assert!((stream.progress() - 1.0).abs() < f64::EPSILON);
        let path = stream.finalize(&mut sink).unwrap();
        assert!(sink.saved[&path].is_empty());
    }

    #[test]
    fn test_duplicate_meta_rejected() {
        let mut sink = MemorySink::default();
        let mut stream = started(4, &mut sink);
        assert!(stream.on_meta("f.bin", 4, "", &mut sink).is_err());
    }
}
