pub mod dedup;
pub mod file_lock;
pub mod ref_count;

pub use dedup::Deduplicator;
pub use file_lock::FileLock;
pub use ref_count::RefLease;

/// Renders a byte count for log lines, e.g. `12.3 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1000 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1000.0;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(999), "999 B");
        assert_eq!(format_size(1000), "1.0 KB");
        assert_eq!(format_size(12_345_678), "12.3 MB");
        assert_eq!(format_size(3_000_000_000), "3.0 GB");
        assert_eq!(format_size(u64::MAX), "18446744.1 TB");
    }
}
