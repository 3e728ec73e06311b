//! Transfer statistics and human readable formatting for log lines.

use std::fmt;
use std::time::{Duration, Instant};

/// Summary of a finished transfer
#[derive(Debug, Clone, Copy)]
pub struct TransferStats {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferStats {
    pub fn since(start: Instant, bytes: u64) -> Self {
        Self {
            bytes,
            elapsed: start.elapsed(),
        }
    }

    /// Average speed in bytes/second
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 / secs) as u64
        } else {
            0
        }
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {} ({})",
            format_bytes(self.bytes),
            format_duration(self.elapsed.as_secs()),
            format_speed(self.bytes_per_second())
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
