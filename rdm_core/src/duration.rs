//! Pure formatting helpers shared by the progress aggregator (spec §4.4,
//! §9 "Duration formatting... live in pure helpers").

/// Formats a whole number of seconds as `"D Days, H Hours, M Minutes, S Seconds"`,
/// dropping any leading zero-valued components. `0` formats as `"0 Seconds"`.
pub fn format_eta_secs(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let parts = [
        (days, "Day", "Days"),
        (hours, "Hour", "Hours"),
        (minutes, "Minute", "Minutes"),
        (seconds, "Second", "Seconds"),
    ];

    // Drop leading zero components, but always keep the last one so we
    // never return an empty string for total_secs == 0.
    let first_nonzero = parts.iter().position(|(v, _, _)| *v != 0).unwrap_or(parts.len() - 1);

    parts[first_nonzero..]
        .iter()
        .map(|(v, singular, plural)| {
            if *v == 1 {
                format!("{} {}", v, singular)
            } else {
                format!("{} {}", v, plural)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Human-readable byte-rate/size formatting (grounded in the reference
/// `format_bytes` in `progress/snapshot.rs`).
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_leading_zero_components() {
        assert_eq!(format_eta_secs(0), "0 Seconds");
        assert_eq!(format_eta_secs(5), "5 Seconds");
        assert_eq!(format_eta_secs(65), "1 Minute, 5 Seconds");
        assert_eq!(format_eta_secs(3661), "1 Hour, 1 Minute, 1 Second");
        assert_eq!(format_eta_secs(90_061), "1 Day, 1 Hour, 1 Minute, 1 Second");
    }

    #[test]
    fn pluralizes_correctly() {
        assert_eq!(format_eta_secs(120), "2 Minutes");
        assert_eq!(format_eta_secs(7200), "2 Hours");
    }

    #[test]
    fn format_bytes_picks_the_right_unit() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
