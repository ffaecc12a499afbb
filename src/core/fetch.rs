use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

/// Identification header carried on every request the core makes.
pub const USER_AGENT: &str = "Crescendo/0.4 (+https://crescendo.app)";

pub fn build_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_default()
}

pub fn temp_path(destination: &Path) -> PathBuf {
    let mut p = destination.as_os_str().to_owned();
    p.push(".tmp");
    PathBuf::from(p)
}

pub(crate) fn transfer_cancelled() -> anyhow::Error {
    anyhow!("transfer cancelled")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying would refetch the same failure.
    Permanent,
    /// Worth another attempt after a backoff.
    Transient,
    /// The caller asked us to stop; terminal, never retried.
    Cancelled,
}

/// Sorts a transfer failure into the retry policy's buckets. Anything not
/// recognized as permanent is optimistically treated as transient.
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    let msg = err.to_string();
    if msg.contains("cancelled") {
        return ErrorClass::Cancelled;
    }
    if msg.contains("HTTP 4") {
        return ErrorClass::Permanent;
    }
    if msg.contains("error page instead of media") {
        return ErrorClass::Permanent;
    }
    if msg.contains("Permission denied") || msg.contains("No space left") {
        return ErrorClass::Permanent;
    }
    ErrorClass::Transient
}

/// Destination for transferred bytes: a temp file for downloads, an
/// in-memory buffer for progressive streams. Both share the fetch loop.
#[async_trait]
pub trait ByteSink: Send {
    /// Reports the full size (range offset included) once the server
    /// declares it.
    fn set_total(&mut self, total: u64);
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;
    async fn finish(&mut self) -> Result<()>;
    /// Discards anything the sink holds after a failed or cancelled
    /// transfer.
    async fn abort(&mut self);
}

pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<tokio::fs::File>>,
}

impl FileSink {
    pub async fn create(path: &Path, buffer_capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::with_capacity(buffer_capacity, file)),
        })
    }
}

#[async_trait]
impl ByteSink for FileSink {
    fn set_total(&mut self, _total: u64) {}

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("sink already finished"))?;
        writer
            .write_all(chunk)
            .await
            .map_err(|e| anyhow!("write failed for {}: {}", self.path.display(), e))
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .await
                .map_err(|e| anyhow!("flush failed for {}: {}", self.path.display(), e))?;
        }
        Ok(())
    }

    async fn abort(&mut self) {
        self.writer.take();
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

pub struct TransferOptions {
    pub range_start: u64,
    pub chunk_timeout: Duration,
    pub cancel: CancellationToken,
}

/// Fetches `url` into `sink`, invoking `on_chunk(downloaded, total)` after
/// every received chunk. Cancellation is observed at every suspension
/// point; errors carry the HTTP status where one was involved so the retry
/// policy can classify them. Returns the number of bytes received.
pub async fn run_transfer<S: ByteSink>(
    client: &reqwest::Client,
    url: &str,
    sink: &mut S,
    opts: &TransferOptions,
    mut on_chunk: impl FnMut(u64, u64) + Send,
) -> Result<u64> {
    let mut request = client.get(url);
    if opts.range_start > 0 {
        request = request.header(
            reqwest::header::RANGE,
            format!("bytes={}-", opts.range_start),
        );
    }

    let response = tokio::select! {
        _ = opts.cancel.cancelled() => return Err(transfer_cancelled()),
        r = request.send() => r?,
    };

    let status = response.status();
    if !status.is_success() {
        bail!("HTTP {} while fetching {}", status.as_u16(), url);
    }
    if opts.range_start > 0 && status != reqwest::StatusCode::PARTIAL_CONTENT {
        bail!(
            "server ignored range request for {} (HTTP {})",
            url,
            status.as_u16()
        );
    }

    if let Some(ct) = response.headers().get(reqwest::header::CONTENT_TYPE) {
        if ct.to_str().map(|v| v.contains("text/html")).unwrap_or(false) {
            bail!("server returned an error page instead of media for {}", url);
        }
    }

    let declared = response.content_length();
    let total = declared.map(|len| len + opts.range_start).unwrap_or(0);
    if total > 0 {
        sink.set_total(total);
    }

    let mut stream = response.bytes_stream();
    let mut downloaded = opts.range_start;

    loop {
        let next = tokio::select! {
            _ = opts.cancel.cancelled() => return Err(transfer_cancelled()),
            item = tokio::time::timeout(opts.chunk_timeout, stream.next()) => item,
        };
        match next {
            Ok(Some(Ok(chunk))) => {
                sink.write_chunk(&chunk).await?;
                downloaded += chunk.len() as u64;
                on_chunk(downloaded, total);
            }
            Ok(Some(Err(e))) => bail!("stream error while fetching {}: {}", url, e),
            Ok(None) => break,
            Err(_) => bail!(
                "transfer stalled: no data received for {}s",
                opts.chunk_timeout.as_secs()
            ),
        }
    }

    let received = downloaded - opts.range_start;
    if let Some(declared) = declared {
        if declared > 0 && received != declared {
            bail!(
                "size mismatch: expected {} bytes, received {}",
                declared,
                received
            );
        }
    }

    sink.finish().await?;
    Ok(received)
}
