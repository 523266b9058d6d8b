//! Byte progress for archive downloads.
//!
//! Large project archives can take many minutes to stream. Progress is
//! reported as periodic log lines rather than a terminal widget; an update is
//! emitted on every 10% step when the size is known, otherwise on a timer.

use std::time::{Duration, Instant};

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
const MIN_DOWNLOAD_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_PERCENTAGE_STEP: f64 = 10.0;

/// Progress state for one archive download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes written so far
    pub bytes_downloaded: u64,
    /// Expected archive size, if the server sent one
    pub total_expected: Option<u64>,
    start_time: Instant,
    last_update: Instant,
    update_interval: Duration,
    last_reported_percentage: f64,
    min_percentage_step: f64,
}

impl DownloadProgress {
    /// Start tracking a download
    pub fn new(total_expected: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            bytes_downloaded: 0,
            total_expected,
            start_time: now,
            last_update: now,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            last_reported_percentage: 0.0,
            min_percentage_step: DEFAULT_PERCENTAGE_STEP,
        }
    }

    /// Account for a written chunk
    pub fn update(&mut self, chunk_len: u64) {
        self.bytes_downloaded = self.bytes_downloaded.saturating_add(chunk_len);
    }

    /// Average rate in bytes per second
    pub fn rate(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes_downloaded as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Completion percentage (0-100) when the size is known
    pub fn percentage(&self) -> Option<f64> {
        self.total_expected.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.bytes_downloaded as f64 / total as f64 * 100.0).min(100.0)
            }
        })
    }

    /// Whether a progress line is due
    pub fn should_emit_update(&self) -> bool {
        if self.bytes_downloaded == 0 {
            return false;
        }

        let percentage_jump = self
            .percentage()
            .map(|pct| pct - self.last_reported_percentage >= self.min_percentage_step)
            .unwrap_or(false);
        if percentage_jump {
            return true;
        }

        self.start_time.elapsed() >= MIN_DOWNLOAD_DURATION
            && self.last_update.elapsed() >= self.update_interval
    }

    /// Reset the timer and cached percentage after logging
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        if let Some(pct) = self.percentage() {
            self.last_reported_percentage = pct;
        }
    }

    /// Human-readable progress string for logging
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!(
            "[PROGRESS] Downloaded {}",
            format_bytes(self.bytes_downloaded)
        )];

        if let (Some(pct), Some(total)) = (self.percentage(), self.total_expected) {
            parts.push(format!("of {} - {pct:.1}% complete", format_bytes(total)));
        }

        let rate = self.rate();
        if rate > 0.0 {
            parts.push(format!("at {}/s", format_bytes(rate as u64)));
        }

        parts.join(" ")
    }
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
