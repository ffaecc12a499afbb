use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

use crate::models::download::Progress;

/// Folds one transfer observation into `Progress`.
///
/// Throughput is the whole-transfer average, not a sliding window; the
/// percentage is left untouched while the total is unknown.
pub fn update(
    progress: &mut Progress,
    downloaded: u64,
    total: u64,
    now: DateTime<Utc>,
    started_at: DateTime<Utc>,
) {
    progress.downloaded_bytes = downloaded;
    if total > 0 {
        progress.total_bytes = total;
        progress.percent = (downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
    }

    let elapsed = (now - started_at).num_milliseconds() as f64 / 1000.0;
    if elapsed > 0.0 {
        progress.speed_bytes_per_sec = downloaded as f64 / elapsed;
    }

    progress.eta_seconds = if progress.speed_bytes_per_sec > 0.0 && total > downloaded {
        Some((total - downloaded) as f64 / progress.speed_bytes_per_sec)
    } else {
        None
    };
    progress.last_update = Some(now);
}

/// Rate-limits progress emission so UI updates don't drown the channel.
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            last_emit: None,
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}
