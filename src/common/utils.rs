//! Utility functions for minipd

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Get current Unix timestamp (nanoseconds)
pub fn timestamp_now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

/// Big-endian encoding used for counters and timestamps in the metadata store
pub fn uint64_to_bytes(v: u64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

pub fn bytes_to_uint64(b: &[u8]) -> crate::Result<u64> {
    let arr: [u8; 8] = b.try_into().map_err(|_| {
        crate::Error::MetadataCorrupted(format!("invalid u64 value of {} bytes", b.len()))
    })?;
    Ok(u64::from_be_bytes(arr))
}

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        s.split_at(s.len() - s.chars().last().map_or(0, char::len_utf8))
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };
    let secs = num
        .checked_mul(secs_per_unit)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))?;
    let duration = Duration::from_secs(secs);

    Ok(duration)
}

/// Format a nanosecond timestamp as RFC 3339 for logs and status output
pub fn format_nanos(nanos: u64) -> String {
    chrono::DateTime::from_timestamp_nanos(nanos as i64).to_rfc3339()
}
