use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSettings {
    pub schema_version: u32,
    pub download: DownloadSettings,
    pub streaming: StreamingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    pub music_dir: PathBuf,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_secs: u64,
    /// Abort a transfer when no bytes arrive for this long.
    pub chunk_timeout_secs: u64,
    pub write_buffer_bytes: usize,
    pub progress_interval_ms: u64,
    /// Audio files smaller than this are rejected as error pages.
    pub min_audio_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSettings {
    pub idle_max_age_secs: u64,
    /// Buffered bytes before a stream is reported playable.
    pub playable_watermark_bytes: u64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            schema_version: 1,
            download: DownloadSettings::default(),
            streaming: StreamingSettings::default(),
        }
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            music_dir: dirs::audio_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Crescendo"),
            max_concurrent: 3,
            max_retries: 3,
            retry_delay_ms: 1000,
            connect_timeout_secs: 15,
            chunk_timeout_secs: 45,
            write_buffer_bytes: 256 * 1024,
            progress_interval_ms: 150,
            min_audio_bytes: 32 * 1024,
        }
    }
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            idle_max_age_secs: 300,
            playable_watermark_bytes: 400 * 1024,
        }
    }
}

impl DownloadSettings {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
