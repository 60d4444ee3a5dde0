//! Common test utilities for `Parley` integration tests.
//!
//! Peers run real engines over an in-process [`MemoryHub`], with files on
//! disk under a per-peer temporary directory. Time is simulated: every
//! [`step`] advances a shared clock by [`STEP`].

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use parley_core::config::{Config, HistoryConfig};
use parley_core::engine::{Collaborators, TransferEngine};
use parley_core::history::HistoryStore;
use parley_core::storage::{ContentSource, FsContentSource, FsStorage, StorageSink, StreamHandle};
use parley_core::transfer::{AttachmentMeta, AttachmentRef, RequestId, TransferState};
use parley_core::transport::memory::MemoryHub;
use parley_core::transport::EventReceiver;

/// Simulated time between two steps.
pub const STEP: Duration = Duration::from_millis(10);

/// Upper bound on steps before a scenario is considered stuck.
pub const MAX_STEPS: usize = 10_000;

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Small chunks and a short timeout so scenarios exercise many frames.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.transfer.chunk_size = 1024;
    config.transfer.session_cache_bytes = 16 * 1024;
    config.transfer.drain_batch_bytes = 4 * 1024;
    config.transfer.drain_batches_per_step = 4;
    config.transfer.idle_timeout = Duration::from_secs(5);
    config.flow.pause_threshold = 64 * 1024;
    config.flow.resume_threshold = 16 * 1024;
    config.telemetry.min_update_interval = Duration::from_millis(50);
    config
}

/// Content source counting every chunk read.
#[derive(Debug)]
pub struct CountingSource {
    inner: FsContentSource,
    reads: Arc<AtomicUsize>,
}

impl ContentSource for CountingSource {
    fn get_record(&self, attachment_id: &str) -> parley_core::Result<AttachmentMeta> {
        self.inner.get_record(attachment_id)
    }

    fn read_chunk(
        &mut self,
        attachment_id: &str,
        offset: u64,
        length: usize,
    ) -> parley_core::Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_chunk(attachment_id, offset, length)
    }

    fn shared_content(&self) -> Vec<(String, PathBuf)> {
        self.inner.shared_content()
    }
}

/// Filesystem storage whose writes can be made to fail.
#[derive(Debug)]
pub struct FlakyStorage {
    inner: FsStorage,
    fail_writes: Arc<AtomicBool>,
}

impl FlakyStorage {
    /// Storage under `dir` and the switch that breaks it.
    pub fn new(dir: PathBuf) -> (Self, Arc<AtomicBool>) {
        let fail_writes = Arc::new(AtomicBool::new(false));
        let storage = Self {
            inner: FsStorage::new(dir),
            fail_writes: Arc::clone(&fail_writes),
        };
        (storage, fail_writes)
    }
}

impl StorageSink for FlakyStorage {
    fn begin_stream(
        &mut self,
        request_id: RequestId,
        file_name: &str,
        content_hash: &str,
        dest_hint: Option<&Path>,
    ) -> parley_core::Result<StreamHandle> {
        self.inner
            .begin_stream(request_id, file_name, content_hash, dest_hint)
    }

    fn write_chunk(&mut self, handle: StreamHandle, bytes: &[u8]) -> parley_core::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(parley_core::Error::StorageWrite("disk full".to_string()));
        }
        self.inner.write_chunk(handle, bytes)
    }

    fn finish_stream(&mut self, handle: StreamHandle) -> parley_core::Result<PathBuf> {
        self.inner.finish_stream(handle)
    }

    fn cancel_stream(&mut self, handle: StreamHandle) {
        self.inner.cancel_stream(handle);
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.inner.path_exists(path)
    }
}

/// One user running an engine on the hub.
pub struct Peer {
    pub user: String,
    pub engine: TransferEngine,
    pub events: EventReceiver,
    pub reads: Arc<AtomicUsize>,
    pub dir: TempDir,
    pub shared: Vec<AttachmentMeta>,
}

impl Peer {
    /// Join `hub` as `user`, sharing `files` as `(attachment_id, name, content)`.
    pub fn join(hub: &MemoryHub, user: &str, config: Config, files: &[(&str, &str, &[u8])]) -> Self {
        let dir = create_temp_dir();
        let storage = FsStorage::new(dir.path().join("downloads"));
        Self::join_in(hub, user, config, files, dir, Box::new(storage))
    }

    /// Like [`Peer::join`], writing downloads through `storage`.
    pub fn join_with_storage(
        hub: &MemoryHub,
        user: &str,
        config: Config,
        files: &[(&str, &str, &[u8])],
        storage: impl FnOnce(PathBuf) -> Box<dyn StorageSink>,
    ) -> Self {
        let dir = create_temp_dir();
        let storage = storage(dir.path().join("downloads"));
        Self::join_in(hub, user, config, files, dir, storage)
    }

    fn join_in(
        hub: &MemoryHub,
        user: &str,
        config: Config,
        files: &[(&str, &str, &[u8])],
        dir: TempDir,
        storage: Box<dyn StorageSink>,
    ) -> Self {
        let mut source = FsContentSource::new();
        let mut shared = Vec::new();
        for (attachment_id, name, content) in files {
            let path = create_test_file(&dir.path().join("shared"), name, content);
            shared.push(source.share_as(*attachment_id, &path).expect("share file"));
        }

        let reads = Arc::new(AtomicUsize::new(0));
        let history = HistoryStore::in_memory(
            dir.path().join("history.json"),
            HistoryConfig {
                enabled: true,
                max_entries: 50,
            },
        );
        let peer = hub.join(user);
        let engine = TransferEngine::new(
            user,
            config,
            Collaborators {
                transport: Box::new(peer.transport),
                signaling: Box::new(peer.signaling),
                source: Box::new(CountingSource {
                    inner: source,
                    reads: Arc::clone(&reads),
                }),
                storage,
            },
            history,
        );

        Self {
            user: user.to_string(),
            engine,
            events: peer.events,
            reads,
            dir,
            shared,
        }
    }

    /// Reference to one of this peer's shared attachments, as a chat message
    /// would announce it.
    pub fn attachment(&self, attachment_id: &str) -> AttachmentRef {
        let meta = self
            .shared
            .iter()
            .find(|m| m.attachment_id == attachment_id)
            .expect("attachment is shared");
        AttachmentRef {
            attachment_id: meta.attachment_id.clone(),
            owner: self.user.clone(),
            file_name: meta.file_name.clone(),
            size_bytes: Some(meta.size_bytes),
            content_hash: Some(meta.content_hash.clone()),
        }
    }

    /// Live state of a request.
    pub fn state(&self, request_id: &uuid::Uuid) -> TransferState {
        self.engine
            .transfer(request_id)
            .cloned()
            .expect("transfer is known")
    }

    /// Directory downloads land in.
    pub fn download_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    /// Chunk reads served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Deliver pending events, then tick. Returns how many events ran.
    pub fn step(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.engine.handle_event(event, now);
            handled += 1;
        }
        self.engine.tick(now);
        handled
    }
}

/// Simulated clock shared by a scenario.
pub struct Clock {
    now: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn advance(&mut self, by: Duration) -> Instant {
        self.now += by;
        self.now
    }
}

/// Advance every peer by one step.
pub fn step(peers: &mut [&mut Peer], clock: &mut Clock) -> usize {
    let now = clock.advance(STEP);
    peers.iter_mut().map(|peer| peer.step(now)).sum()
}

/// Step until every peer is idle and no events remain.
pub fn settle(peers: &mut [&mut Peer], clock: &mut Clock) {
    for _ in 0..MAX_STEPS {
        let handled = step(peers, clock);
        if handled == 0 && peers.iter().all(|p| p.engine.is_idle() && p.events.is_empty()) {
            return;
        }
    }
    panic!("peers did not settle within {MAX_STEPS} steps");
}

/// Step until `done` holds.
pub fn run_until(peers: &mut [&mut Peer], clock: &mut Clock, mut done: impl FnMut(&[&mut Peer]) -> bool) {
    for _ in 0..MAX_STEPS {
        if done(peers) {
            return;
        }
        step(peers, clock);
    }
    panic!("condition not reached within {MAX_STEPS} steps");
}

/// Files in `dir`, ignoring the directory if it does not exist.
pub fn list_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
