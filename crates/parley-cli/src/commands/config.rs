//! Config command implementation.

use anyhow::{bail, Result};

use parley_core::config::Config;

use super::{ConfigAction, ConfigArgs};
use crate::ui::{format_size, parse_duration};

/// Run the config command.
pub async fn run(args: ConfigArgs) -> Result<()> {
    let mut config = Config::load()?;

    match args.action {
        ConfigAction::Get { key } => match get_config_value(&config, &key) {
            Some(v) => println!("{}: {}", key, v),
            None => println!("Unknown configuration key: {}", key),
        },

        ConfigAction::Set { key, value } => {
            if set_config_value(&mut config, &key, &value)? {
                config.validate()?;
                config.save()?;
                println!("Set {} = {}", key, value);
            } else {
                println!("Unknown configuration key: {}", key);
            }
        }

        ConfigAction::Show => show(&config),

        ConfigAction::Path => println!("{}", Config::config_path().display()),

        ConfigAction::Reset => {
            Config::default().save()?;
            println!("Configuration reset to defaults.");
        }
    }

    Ok(())
}

fn show(config: &Config) {
    println!();
    println!("Parley Configuration");
    println!("{}", "─".repeat(50));
    println!();
    println!("[transfer]");
    println!("  chunk_size = {}", config.transfer.chunk_size);
    println!(
        "  max_concurrent_downloads = {}",
        config.transfer.max_concurrent_downloads
    );
    match config.transfer.max_queued_downloads {
        Some(max) => println!("  max_queued_downloads = {}", max),
        None => println!("  max_queued_downloads = (unbounded)"),
    }
    println!(
        "  max_running_sessions = {}",
        config.transfer.max_running_sessions
    );
    println!(
        "  session_cache_bytes = {} ({})",
        config.transfer.session_cache_bytes,
        format_size(config.transfer.session_cache_bytes)
    );
    println!(
        "  channel_high_water = {} ({})",
        config.transfer.channel_high_water,
        format_size(config.transfer.channel_high_water)
    );
    println!(
        "  idle_timeout = \"{}s\"",
        config.transfer.idle_timeout.as_secs()
    );
    println!("  auto_accept = {}", config.transfer.auto_accept);
    println!();
    println!("[flow]");
    println!("  pause_threshold = {}", config.flow.pause_threshold);
    println!("  resume_threshold = {}", config.flow.resume_threshold);
    println!();
    println!("[telemetry]");
    println!(
        "  download_smoothing = {}",
        config.telemetry.download_smoothing
    );
    println!("  upload_smoothing = {}", config.telemetry.upload_smoothing);
    println!("  eta_increase_cap = {}", config.telemetry.eta_increase_cap);
    println!();
    println!("[history]");
    println!("  enabled = {}", config.history.enabled);
    println!("  max_entries = {}", config.history.max_entries);
    println!();
    println!("[storage]");
    println!(
        "  download_dir = \"{}\"",
        config.storage.resolved_download_dir().display()
    );
    println!();
}

fn get_config_value(config: &Config, key: &str) -> Option<String> {
    match key {
        "chunk_size" => Some(config.transfer.chunk_size.to_string()),
        "max_concurrent_downloads" => Some(config.transfer.max_concurrent_downloads.to_string()),
        "max_queued_downloads" => Some(
            config
                .transfer
                .max_queued_downloads
                .map_or_else(|| "unbounded".to_string(), |m| m.to_string()),
        ),
        "max_running_sessions" => Some(config.transfer.max_running_sessions.to_string()),
        "session_cache_bytes" => Some(config.transfer.session_cache_bytes.to_string()),
        "channel_high_water" => Some(config.transfer.channel_high_water.to_string()),
        "idle_timeout" => Some(format!("{}s", config.transfer.idle_timeout.as_secs())),
        "auto_accept" => Some(config.transfer.auto_accept.to_string()),
        "pause_threshold" => Some(config.flow.pause_threshold.to_string()),
        "resume_threshold" => Some(config.flow.resume_threshold.to_string()),
        "history_enabled" => Some(config.history.enabled.to_string()),
        "history_max_entries" => Some(config.history.max_entries.to_string()),
        "download_dir" => Some(
            config
                .storage
                .resolved_download_dir()
                .display()
                .to_string(),
        ),
        _ => None,
    }
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<bool> {
    match key {
        "chunk_size" => config.transfer.chunk_size = value.parse()?,
        "max_concurrent_downloads" => config.transfer.max_concurrent_downloads = value.parse()?,
        "max_queued_downloads" => {
            config.transfer.max_queued_downloads = if value == "unbounded" {
                None
            } else {
                Some(value.parse()?)
            };
        }
        "max_running_sessions" => config.transfer.max_running_sessions = value.parse()?,
        "session_cache_bytes" => config.transfer.session_cache_bytes = value.parse()?,
        "channel_high_water" => config.transfer.channel_high_water = value.parse()?,
        "idle_timeout" => {
            let Some(timeout) = parse_duration(value) else {
                bail!("Invalid duration '{}' (use e.g. 30s, 5m)", value);
            };
            config.transfer.idle_timeout = timeout;
        }
        "auto_accept" => config.transfer.auto_accept = value.parse()?,
        "pause_threshold" => config.flow.pause_threshold = value.parse()?,
        "resume_threshold" => config.flow.resume_threshold = value.parse()?,
        "history_enabled" => config.history.enabled = value.parse()?,
        "history_max_entries" => config.history.max_entries = value.parse()?,
        "download_dir" => config.storage.download_dir = Some(value.into()),
        _ => return Ok(false),
    }
    Ok(true)
}
