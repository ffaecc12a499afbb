use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core::fetch;
use crate::core::stream::{spawn_producer, StreamBuffer, StreamEvent, StreamReader};
use crate::models::settings::{DownloadSettings, StreamingSettings};

/// Keyed cache of live progressive streams. A second request for a URL
/// that is already streaming shares the existing buffer instead of
/// fetching the bytes twice. Idle sweeping is driven by the caller's
/// timer; the registry never schedules itself.
pub struct StreamRegistry {
    client: reqwest::Client,
    chunk_timeout: Duration,
    streaming: StreamingSettings,
    streams: Mutex<HashMap<String, Arc<StreamBuffer>>>,
}

impl StreamRegistry {
    pub fn new(download: &DownloadSettings, streaming: StreamingSettings) -> Self {
        Self {
            client: fetch::build_client(Duration::from_secs(download.connect_timeout_secs)),
            chunk_timeout: download.chunk_timeout(),
            streaming,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live buffer for `url`, creating one (and starting its
    /// producer) if none exists. Must be called from within a tokio
    /// runtime.
    pub fn get_or_create(&self, url: &str) -> Arc<StreamBuffer> {
        self.get_or_create_from(url, 0, None)
    }

    pub fn get_or_create_from(
        &self,
        url: &str,
        start_offset: u64,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Arc<StreamBuffer> {
        let mut streams = self.streams.lock();
        if let Some(existing) = streams.get(url) {
            if !existing.is_closed() {
                existing.touch();
                return existing.clone();
            }
        }
        let buffer = StreamBuffer::new(url, start_offset);
        streams.insert(url.to_string(), buffer.clone());
        spawn_producer(
            self.client.clone(),
            buffer.clone(),
            self.chunk_timeout,
            self.streaming.playable_watermark_bytes,
            events,
        );
        tracing::debug!(url, "started stream buffer");
        buffer
    }

    /// `Read + Seek` handle for the audio decoder, backed by the shared
    /// buffer for `url`.
    pub fn reader(&self, url: &str) -> StreamReader {
        StreamReader::new(self.get_or_create(url))
    }

    /// Cancels the producer and evicts the buffer. Returns false when no
    /// stream exists for `url`.
    pub fn close(&self, url: &str) -> bool {
        let removed = self.streams.lock().remove(url);
        match removed {
            Some(buffer) => {
                buffer.close();
                true
            }
            None => false,
        }
    }

    /// Closes and evicts every buffer idle for longer than `max_age`.
    /// Returns the number evicted.
    pub fn sweep_idle(&self, max_age: Duration) -> usize {
        let stale: Vec<Arc<StreamBuffer>> = {
            let mut streams = self.streams.lock();
            let keys: Vec<String> = streams
                .iter()
                .filter(|(_, b)| b.last_access().elapsed() > max_age)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| streams.remove(k)).collect()
        };
        for buffer in &stale {
            tracing::debug!(url = %buffer.url(), "evicting idle stream");
            buffer.close();
        }
        stale.len()
    }

    pub fn idle_max_age(&self) -> Duration {
        Duration::from_secs(self.streaming.idle_max_age_secs)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}
