use std::time::Duration;

/// Format the time left on a credential for display: `4m 10s`, `42s`,
/// or `expired` once nothing is left.
pub fn format_remaining(left: Duration) -> String {
    let secs = left.as_secs();
    if secs == 0 && left.subsec_millis() == 0 {
        return "expired".to_string();
    }
    let minutes = secs / 60;
    let seconds = secs % 60;
    if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Format a byte count as B / KB / MB
pub fn format_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Truncate a string to at most `max_len` characters, noting how much was cut.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    let total = s.chars().count();
    if total <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len).collect();
        format!("{}... (truncated, {} total chars)", truncated, total)
    }
}
