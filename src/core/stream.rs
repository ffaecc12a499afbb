use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::fetch::{self, ByteSink, ErrorClass, TransferOptions};

/// Upper bound on one condvar wait so cancellation is observed promptly
/// even if a notification is missed.
const READ_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Enough is buffered for playback to start.
    Playable,
    Progress { downloaded: u64, total: u64 },
    Complete,
    Error(String),
}

struct BufferState {
    /// Append-only; a reader cursor indexes into this directly.
    data: Vec<u8>,
    /// Full size of the remote file (range offset included); 0 until the
    /// server reports it.
    total_size: u64,
    complete: bool,
    error: Option<String>,
    last_access: Instant,
}

/// Grows as the producer downloads; readers block until the bytes they
/// want exist. One lock guards bytes and metadata together so reads and
/// appends stay mutually consistent.
pub struct StreamBuffer {
    url: String,
    /// First remote byte this buffer holds (non-zero for resumed playback).
    start_offset: u64,
    state: Mutex<BufferState>,
    data_available: Condvar,
    cancel: CancellationToken,
}

impl StreamBuffer {
    pub fn new(url: impl Into<String>, start_offset: u64) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            start_offset,
            state: Mutex::new(BufferState {
                data: Vec::new(),
                total_size: 0,
                complete: false,
                error: None,
                last_access: Instant::now(),
            }),
            data_available: Condvar::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn append(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.data.extend_from_slice(chunk);
        state.last_access = Instant::now();
        drop(state);
        self.data_available.notify_all();
    }

    pub fn set_total_size(&self, total: u64) {
        self.state.lock().total_size = total;
    }

    pub fn mark_complete(&self) {
        self.state.lock().complete = true;
        self.data_available.notify_all();
    }

    pub fn set_error(&self, message: String) {
        self.state.lock().error = Some(message);
        self.data_available.notify_all();
    }

    /// Stops the producer and wakes every blocked reader.
    pub fn close(&self) {
        self.cancel.cancel();
        self.data_available.notify_all();
    }

    /// (frontier, total size, complete)
    pub fn status(&self) -> (u64, u64, bool) {
        let state = self.state.lock();
        (state.data.len() as u64, state.total_size, state.complete)
    }

    pub fn frontier(&self) -> u64 {
        self.state.lock().data.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    pub fn downloaded_fraction(&self) -> f64 {
        let state = self.state.lock();
        if state.total_size == 0 {
            return 0.0;
        }
        let downloaded = self.start_offset + state.data.len() as u64;
        (downloaded as f64 / state.total_size as f64).min(1.0)
    }

    pub fn last_access(&self) -> Instant {
        self.state.lock().last_access
    }

    pub fn touch(&self) {
        self.state.lock().last_access = Instant::now();
    }

    /// Copies bytes at `pos` into `buf`, blocking while the download has
    /// not reached them yet. `Ok(0)` means end of stream; a closed buffer
    /// yields `Interrupted`, a dead producer yields its stored error once
    /// the remaining bytes have been drained.
    pub(crate) fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "stream closed"));
            }
            let mut state = self.state.lock();
            state.last_access = Instant::now();
            let frontier = state.data.len() as u64;
            if pos < frontier {
                let start = pos as usize;
                let n = buf.len().min((frontier - pos) as usize);
                buf[..n].copy_from_slice(&state.data[start..start + n]);
                return Ok(n);
            }
            if state.complete {
                return Ok(0);
            }
            if let Some(err) = &state.error {
                return Err(io::Error::new(io::ErrorKind::Other, err.clone()));
            }
            self.data_available.wait_for(&mut state, READ_WAIT);
        }
    }

    /// Cursor space this buffer exposes: bytes it will eventually hold.
    fn known_end(&self) -> u64 {
        let state = self.state.lock();
        if state.total_size > 0 {
            state.total_size.saturating_sub(self.start_offset)
        } else {
            state.data.len() as u64
        }
    }
}

/// `Read + Seek` view over a [`StreamBuffer`], as handed to the audio
/// decoder. Reading past buffered data blocks until it arrives.
pub struct StreamReader {
    buffer: Arc<StreamBuffer>,
    position: u64,
}

impl StreamReader {
    pub fn new(buffer: Arc<StreamBuffer>) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.buffer
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.buffer.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for StreamReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (frontier, _, complete) = self.buffer.status();
        let end = self.buffer.known_end();
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => end as i128 + offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
        };
        let target = target.max(0) as u64;

        if target > frontier {
            if !complete {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "seek beyond available data",
                ));
            }
            // Everything that will ever arrive has arrived; park at the end.
            self.position = frontier;
        } else {
            self.position = target;
        }
        self.buffer.touch();
        Ok(self.position)
    }
}

struct BufferSink {
    buffer: Arc<StreamBuffer>,
    events: Option<mpsc::Sender<StreamEvent>>,
    watermark: u64,
    playable_sent: bool,
}

impl BufferSink {
    async fn send(&self, event: StreamEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl ByteSink for BufferSink {
    fn set_total(&mut self, total: u64) {
        self.buffer.set_total_size(total);
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.append(chunk);
        let (frontier, total, _) = self.buffer.status();
        if !self.playable_sent && frontier >= self.watermark {
            self.playable_sent = true;
            self.send(StreamEvent::Playable).await;
        }
        self.send(StreamEvent::Progress {
            downloaded: frontier,
            total,
        })
        .await;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    async fn abort(&mut self) {}
}

/// Starts the single producer task feeding `buffer`. Errors never reach
/// readers as a hard fault: the buffer stops growing and readers drain
/// what arrived before observing the stored error at the frontier.
pub(crate) fn spawn_producer(
    client: reqwest::Client,
    buffer: Arc<StreamBuffer>,
    chunk_timeout: Duration,
    watermark: u64,
    events: Option<mpsc::Sender<StreamEvent>>,
) {
    tokio::spawn(async move {
        let opts = TransferOptions {
            range_start: buffer.start_offset,
            chunk_timeout,
            cancel: buffer.cancel_token(),
        };
        let mut sink = BufferSink {
            buffer: buffer.clone(),
            events: events.clone(),
            watermark,
            playable_sent: false,
        };
        match fetch::run_transfer(&client, &buffer.url, &mut sink, &opts, |_, _| {}).await {
            Ok(received) => {
                buffer.mark_complete();
                tracing::debug!(url = %buffer.url, bytes = received, "stream download complete");
                if !sink.playable_sent {
                    sink.send(StreamEvent::Playable).await;
                }
                sink.send(StreamEvent::Complete).await;
            }
            Err(e) if fetch::classify_error(&e) == ErrorClass::Cancelled => {
                tracing::debug!(url = %buffer.url, "stream download cancelled");
            }
            Err(e) => {
                tracing::warn!(url = %buffer.url, error = %e, "stream download stopped");
                buffer.set_error(e.to_string());
                sink.send(StreamEvent::Error(e.to_string())).await;
            }
        }
    });
}
