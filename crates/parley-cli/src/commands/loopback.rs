//! Loopback command implementation.
//!
//! Runs one uploader and several downloaders as in-process peers, each with
//! its own engine task, and shows their progress until every download ends.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use parley_core::config::{Config, HistoryConfig};
use parley_core::engine::{Collaborators, TransferEngine};
use parley_core::history::HistoryStore;
use parley_core::runtime::EngineHandle;
use parley_core::storage::{FsContentSource, FsStorage};
use parley_core::transfer::{AttachmentRef, TransferStatus};
use parley_core::transport::memory::MemoryHub;

use super::{load_config, LoopbackArgs};
use crate::ui::{format_size, parse_duration, progress_line};

const UPLOADER: &str = "uploader";
const REFRESH: Duration = Duration::from_millis(250);

/// Run the loopback command.
pub async fn run(args: LoopbackArgs) -> Result<()> {
    if args.downloaders == 0 {
        bail!("At least one downloader is required");
    }
    let Some(timeout) = parse_duration(&args.timeout) else {
        bail!("Invalid timeout '{}' (use e.g. 30s, 5m)", args.timeout);
    };

    let config = load_config();
    config.validate()?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| config.storage.resolved_download_dir());

    let hub = MemoryHub::new();
    let mut source = FsContentSource::new();
    let meta = source
        .share(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    println!();
    println!(
        "Sending {} ({}) to {} peer(s)",
        meta.file_name,
        format_size(meta.size_bytes),
        args.downloaders
    );
    println!("{}", "─".repeat(60));

    let scratch = std::env::temp_dir().join(format!("parley-loopback-{}", uuid::Uuid::new_v4()));
    let uploader = spawn_peer(
        &hub,
        UPLOADER,
        &config,
        source,
        FsStorage::new(scratch.join(UPLOADER)),
        HistoryStore::in_memory(scratch.join("uploader-history.json"), disabled_history()),
    );

    let attachment = AttachmentRef {
        attachment_id: meta.attachment_id.clone(),
        owner: UPLOADER.to_string(),
        file_name: meta.file_name.clone(),
        size_bytes: Some(meta.size_bytes),
        content_hash: Some(meta.content_hash.clone()),
    };

    let mut downloaders = Vec::with_capacity(args.downloaders);
    for index in 0..args.downloaders {
        let user = format!("peer-{}", index + 1);
        let history = if args.record && index == 0 {
            HistoryStore::load(config.history.clone()).context("Failed to load history")?
        } else {
            HistoryStore::in_memory(scratch.join(format!("{user}-history.json")), disabled_history())
        };
        let handle = spawn_peer(
            &hub,
            &user,
            &config,
            FsContentSource::new(),
            FsStorage::new(output.join(&user)),
            history,
        );
        let request_id = handle.request_download(attachment.clone()).await?;
        downloaders.push((user, handle, request_id));
    }

    let finished = tokio::time::timeout(timeout, watch_progress(&downloaders))
        .await
        .is_ok();

    println!("{}", "─".repeat(60));
    let mut completed = 0;
    for (user, handle, request_id) in &downloaders {
        let Some(state) = handle.transfers().into_iter().find(|s| s.request_id == *request_id) else {
            continue;
        };
        match (&state.status, &state.saved_path) {
            (TransferStatus::Completed, Some(path)) => {
                completed += 1;
                println!("  {:<10} {}", user, path.display());
            }
            _ => println!("  {:<10} {}", user, progress_line(&state)),
        }
    }

    for (_, handle, _) in &downloaders {
        handle.shutdown().await?;
    }
    uploader.shutdown().await?;
    if let Err(e) = std::fs::remove_dir_all(&scratch) {
        tracing::debug!(error = %e, path = %scratch.display(), "Scratch directory not removed");
    }

    println!();
    if !finished {
        bail!("Timed out after {}s", timeout.as_secs());
    }
    println!(
        "{} of {} downloads completed.",
        completed,
        downloaders.len()
    );
    Ok(())
}

fn disabled_history() -> HistoryConfig {
    HistoryConfig {
        enabled: false,
        ..HistoryConfig::default()
    }
}

fn spawn_peer(
    hub: &MemoryHub,
    user: &str,
    config: &Config,
    source: FsContentSource,
    storage: FsStorage,
    history: HistoryStore,
) -> EngineHandle {
    let peer = hub.join(user);
    let engine = TransferEngine::new(
        user,
        config.clone(),
        Collaborators {
            transport: Box::new(peer.transport),
            signaling: Box::new(peer.signaling),
            source: Box::new(source),
            storage: Box::new(storage),
        },
        history,
    );
    let (handle, _task) = EngineHandle::spawn(engine, peer.events);
    handle
}

/// Print a line per downloader whenever its state changes, until all end.
async fn watch_progress(downloaders: &[(String, EngineHandle, uuid::Uuid)]) {
    let mut last: Vec<Option<String>> = vec![None; downloaders.len()];
    loop {
        let mut all_done = true;
        for (slot, (user, handle, request_id)) in last.iter_mut().zip(downloaders) {
            let Some(state) = handle.transfers().into_iter().find(|s| s.request_id == *request_id) else {
                continue;
            };
            if !state.is_terminal() {
                all_done = false;
            }
            let line = progress_line(&state);
            if slot.as_ref() != Some(&line) {
                println!("  {:<10} {}", user, line);
                *slot = Some(line);
            }
        }
        if all_done {
            return;
        }
        tokio::time::sleep(REFRESH).await;
    }
}
