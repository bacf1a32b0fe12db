//! Shared utility functions used across the crate.

use std::time::Duration;

/// Parse a duration string (e.g., "30s", "500ms", "1m", "1h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds (e.g., "30s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "1h")
/// - Plain number - treated as seconds (e.g., "60"), matching the `-d` flag
///
/// Returns `None` if the string cannot be parsed.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.ends_with("ms") {
        s.trim_end_matches("ms")
            .parse::<u64>()
            .ok()
            .map(Duration::from_millis)
    } else if s.ends_with('s') {
        s.trim_end_matches('s')
            .parse::<f64>()
            .ok()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    } else if s.ends_with('m') {
        s.trim_end_matches('m')
            .parse::<f64>()
            .ok()
            .and_then(|m| Duration::try_from_secs_f64(m * 60.0).ok())
    } else if s.ends_with('h') {
        s.trim_end_matches('h')
            .parse::<f64>()
            .ok()
            .and_then(|h| Duration::try_from_secs_f64(h * 3600.0).ok())
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// clap value parser for duration flags.
pub fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration_str(s).ok_or_else(|| format!("invalid duration '{}'", s))
}

/// Render a duration the way [`parse_duration_str`] reads it back, for
/// forwarding flags to node processes.
pub fn format_duration_arg(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
