//! Human-readable rate parsing and formatting.
//!
//! All rates inside the crate are bytes per second. These helpers are pure
//! and never fail: unparseable input maps to 0, which callers must treat
//! with care because 0 is also the legal "block all traffic" limit.

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

/// Bytes per second in one decimal megabit per second.
pub const BYTES_PER_SEC_PER_MBPS: u64 = 125_000;

/// Parse a rate like `"1.5 MB"`, `"500kbps"` or `"2048"` into bytes/sec.
///
/// Units are case-insensitive binary multiples: `b`, `k`/`kb`, `m`/`mb`,
/// `g`/`gb`, each optionally followed by `ps`. A missing or unknown unit is
/// read as bytes. Fractional results truncate toward zero.
pub fn parse_rate(input: &str) -> u64 {
    let normalized: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    let split = normalized
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(normalized.len());
    if split == 0 {
        return 0;
    }

    let (number, unit) = normalized.split_at(split);
    let value: f64 = match number.parse() {
        Ok(v) => v,
        Err(_) => return 0,
    };

    let multiplier = match unit.strip_suffix("ps").unwrap_or(unit) {
        "k" | "kb" => KIB,
        "m" | "mb" => MIB,
        "g" | "gb" => GIB,
        _ => 1,
    };

    (value * multiplier as f64) as u64
}

/// Format bytes/sec using the same binary thresholds as [`parse_rate`].
pub fn format_rate(bytes_per_sec: u64) -> String {
    if bytes_per_sec >= GIB {
        format!("{:.2} GB/s", bytes_per_sec as f64 / GIB as f64)
    } else if bytes_per_sec >= MIB {
        format!("{:.2} MB/s", bytes_per_sec as f64 / MIB as f64)
    } else if bytes_per_sec >= KIB {
        format!("{:.2} KB/s", bytes_per_sec as f64 / KIB as f64)
    } else {
        format!("{} B/s", bytes_per_sec)
    }
}

/// Format a byte total (no per-second suffix).
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Convert a decimal megabit/s value (as shown on sliders) to bytes/sec.
pub fn mbps_to_bytes_per_sec(mbps: u64) -> u64 {
    mbps.saturating_mul(BYTES_PER_SEC_PER_MBPS)
}
