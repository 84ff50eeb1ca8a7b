//! Captured output section appended to job bodies.

use chrono::{DateTime, TimeDelta, Utc};

/// Marker introducing the output section. Written once per document.
pub const OUTPUT_MARKER: &str = "\n\n## Output\n\n";

/// The part of a body that precedes any appended output.
pub fn prompt_part(body: &str) -> &str {
    match body.find(OUTPUT_MARKER) {
        Some(idx) => &body[..idx],
        None => body,
    }
}

/// Append `text` under the output section, creating the section if needed.
pub fn append_output(body: &str, text: &str) -> String {
    let mut out = body.to_string();
    if !out.contains(OUTPUT_MARKER) {
        out.truncate(out.trim_end().len());
        out.push_str(OUTPUT_MARKER);
    } else if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(text);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Prefix each line with `[HH:MM:SS]`.
pub fn stamp_lines(text: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%H:%M:%S").to_string();
    let mut out = String::new();
    for line in text.lines() {
        out.push('[');
        out.push_str(&stamp);
        out.push_str("] ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Human duration such as `1m30s` or `2h5m0s`.
pub fn format_duration(delta: TimeDelta) -> String {
    let total = delta.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
