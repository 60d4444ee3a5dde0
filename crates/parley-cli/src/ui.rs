//! Terminal formatting helpers.

use std::time::Duration;

use parley_core::transfer::{TransferState, TransferStatus};

/// Format a byte count for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Format an ETA in seconds as "M:SS".
pub fn format_eta(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// Parse a duration string like "5m", "30s", or "1h".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(num_str) = s.strip_suffix('m') {
        let num: u64 = num_str.parse().ok()?;
        Some(Duration::from_secs(num * 60))
    } else if let Some(num_str) = s.strip_suffix('s') {
        let num: u64 = num_str.parse().ok()?;
        Some(Duration::from_secs(num))
    } else if let Some(num_str) = s.strip_suffix('h') {
        let num: u64 = num_str.parse().ok()?;
        Some(Duration::from_secs(num * 3600))
    } else {
        None
    }
}

/// One-line progress summary of a transfer.
pub fn progress_line(state: &TransferState) -> String {
    let percent = (state.progress * 100.0).round() as u64;
    let mut line = format!(
        "{:<24} {:>12}  {:>3}%",
        state.counterpart_user_id,
        state.status.to_string(),
        percent
    );
    if state.status == TransferStatus::Transferring {
        if let Some(speed) = state.displayed_speed {
            line.push_str(&format!("  {}/s", format_size((speed * 1024.0) as u64)));
        }
        if let Some(eta) = state.displayed_eta {
            line.push_str(&format!("  ETA {}", format_eta(eta)));
        }
    }
    if let Some(error) = &state.error {
        line.push_str(&format!("  ({error})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::transfer::TransferDirection;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0), "0:00");
        assert_eq!(format_eta(125), "2:05");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_progress_line() {
        let mut state = TransferState::new(
            uuid::Uuid::new_v4(),
            "a1",
            "a.bin",
            TransferDirection::Download,
            "alice",
            TransferStatus::Transferring,
        );
        state.progress = 0.5;
        state.displayed_speed = Some(2048.0);
        state.displayed_eta = Some(61);

        let line = progress_line(&state);
        assert!(line.starts_with("alice"));
        assert!(line.contains("50%"));
        assert!(line.contains("2.0 MB/s"));
        assert!(line.contains("ETA 1:01"));
    }
}
