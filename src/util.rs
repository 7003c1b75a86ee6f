//! Small helpers for human-readable reporting.

/// Format a byte count into IEC units for stats and alert messages.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }

    if (value - value.round()).abs() < 0.05 {
        format!("{} {unit}", value.round())
    } else {
        format!("{value:.1} {unit}")
    }
}

/// Format a ratio as a percentage with one decimal, clamped to [0, 100].
pub fn format_percent(ratio: f64) -> String {
    let pct = (ratio * 100.0).clamp(0.0, 100.0);
    format!("{pct:.1}%")
}
