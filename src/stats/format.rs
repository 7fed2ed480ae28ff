//! Human-readable byte sizes: formatting for the API and log lines,
//! parsing for `limit` strings in the configuration.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn size_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*(B|KB|MB|GB|TB)?$").expect("valid regex"))
}

/// Parse a byte-size string like `"100GB"` or `"1.5 TB"` into a byte count.
///
/// Units use binary (1024-based) multipliers; a bare number is taken as
/// bytes. Whitespace and case are tolerated. The empty string and `"0"`
/// both mean zero (unlimited).
pub fn parse_bytes(s: &str) -> Result<u64> {
    if s.is_empty() || s == "0" {
        return Ok(0);
    }

    let normalized = s.trim().to_ascii_uppercase();
    let caps = size_pattern()
        .captures(&normalized)
        .ok_or_else(|| Error::ByteSize(s.to_string()))?;

    let value: f64 = caps[1].parse().map_err(|_| Error::ByteSize(s.to_string()))?;

    let multiplier = match caps.get(2).map(|m| m.as_str()) {
        Some("KB") => KB,
        Some("MB") => MB,
        Some("GB") => GB,
        Some("TB") => TB,
        _ => 1,
    };

    Ok((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(5 * GB + GB / 2), "5.50 GB");
        assert_eq!(format_bytes(2 * TB), "2.00 TB");
    }

    #[test]
    fn test_parse_bytes_plain() {
        assert_eq!(parse_bytes("").unwrap(), 0);
        assert_eq!(parse_bytes("0").unwrap(), 0);
        assert_eq!(parse_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_bytes("512B").unwrap(), 512);
    }

    #[test]
    fn test_parse_bytes_units() {
        assert_eq!(parse_bytes("100KB").unwrap(), 100 * KB);
        assert_eq!(parse_bytes("100GB").unwrap(), 100 * GB);
        assert_eq!(parse_bytes("1.5TB").unwrap(), (1.5 * TB as f64) as u64);
    }

    #[test]
    fn test_parse_bytes_tolerates_case_and_whitespace() {
        assert_eq!(parse_bytes("  10 mb ").unwrap(), 10 * MB);
        assert_eq!(parse_bytes("2gb").unwrap(), 2 * GB);
    }

    #[test]
    fn test_parse_bytes_rejects_garbage() {
        assert!(parse_bytes("ten GB").is_err());
        assert!(parse_bytes("100PB").is_err());
        assert!(parse_bytes("-5MB").is_err());
        assert!(parse_bytes("GB").is_err());
    }
}
