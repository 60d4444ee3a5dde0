//! History command implementation.

use anyhow::{Context, Result};

use parley_core::history::{HistoryStore, TransferHistoryEntry};
use parley_core::transfer::TransferDirection;

use super::{load_config, HistoryArgs};
use crate::ui::format_size;

/// Run the history command.
pub async fn run(args: HistoryArgs) -> Result<()> {
    let config = load_config();
    let mut store = HistoryStore::load(config.history).context("Failed to load history")?;

    if args.clear {
        store.clear();
        store.save()?;
        println!("History cleared.");
        return Ok(());
    }

    if let Some(id) = &args.remove {
        let request_id = uuid::Uuid::parse_str(id).context("Invalid request id")?;
        if store.remove(&request_id) {
            store.save()?;
            println!("Removed {}.", request_id);
        } else {
            println!("No transfer with id {}.", request_id);
        }
        return Ok(());
    }

    if args.refresh || args.prune {
        let missing = store.refresh_accessibility(std::path::Path::is_file);
        if args.prune {
            let removed = store.prune_inaccessible();
            println!("Removed {} entries whose files are gone.", removed);
        } else {
            println!("{} saved downloads are no longer on disk.", missing);
        }
        store.flush()?;
        return Ok(());
    }

    if args.json {
        let output = serde_json::json!({
            "transfers": store.list(None),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if let Some(index) = args.details {
        match store.get(index) {
            Some(entry) => print_details(index, entry),
            None => println!("No transfer #{}.", index),
        }
        return Ok(());
    }

    println!();
    println!("Recent Transfers:");
    println!("{}", "─".repeat(72));
    println!(
        "  {:>3}  {:16}  {:9}  {:16}  {:12}  {:>9}",
        "#", "Date", "Direction", "With", "Status", "Size"
    );
    println!("{}", "─".repeat(72));

    if store.is_empty() {
        println!("  (no transfer history)");
    }
    for (index, entry) in store.list(None).iter().enumerate() {
        let state = &entry.state;
        let direction = match state.direction {
            TransferDirection::Upload => "sent",
            TransferDirection::Download => "received",
        };
        let status = if entry.is_inaccessible {
            "missing".to_string()
        } else {
            state.status.to_string()
        };
        println!(
            "  {:>3}  {:16}  {:9}  {:16}  {:12}  {:>9}",
            index,
            entry.formatted_timestamp(),
            direction,
            truncate(&state.counterpart_user_id, 16),
            status,
            state.size_bytes.map_or_else(|| "-".to_string(), format_size),
        );
    }

    println!("{}", "─".repeat(72));

    Ok(())
}

fn print_details(index: usize, entry: &TransferHistoryEntry) {
    let state = &entry.state;
    println!();
    println!("Transfer #{}", index);
    println!("{}", "─".repeat(40));
    println!("  Request:    {}", state.request_id);
    println!("  File:       {}", state.file_name);
    println!("  Attachment: {}", state.attachment_id);
    println!("  Direction:  {}", state.direction);
    println!("  With:       {}", state.counterpart_user_id);
    println!("  Status:     {}", state.status);
    if let Some(size) = state.size_bytes {
        println!("  Size:       {}", format_size(size));
    }
    if let Some(hash) = &state.content_hash {
        println!("  SHA-256:    {}", hash);
    }
    if let Some(path) = &state.saved_path {
        let note = if entry.is_inaccessible { " (missing)" } else { "" };
        println!("  Saved to:   {}{}", path.display(), note);
    }
    if let Some(error) = &state.error {
        println!("  Error:      {}", error);
    }
    println!("  Started:    {}", entry.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:    {}", entry.updated_at.format("%Y-%m-%d %H:%M:%S"));
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}
