use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::core::events::{CallbackRegistry, EventDispatcher, TaskEvent};
use crate::core::fetch::{self, ByteSink, ErrorClass, FileSink, TransferOptions};
use crate::core::filename;
use crate::core::progress::{self, ProgressThrottle};
use crate::core::validate;
use crate::models::download::{DownloadState, DownloadTask, TaskSnapshot};
use crate::models::settings::DownloadSettings;
use crate::models::track::Track;

/// Stable identity of a download: same URL to the same destination is the
/// same task, everything else is not.
pub fn fingerprint(url: &str, destination: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(destination.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

fn default_title(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|s| s.last().map(|p| p.to_string()))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| url.to_string())
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64 * attempt as u64;
    let jitter = rand::random::<u64>() % (base_ms / 2 + 1);
    Duration::from_millis(base_ms + jitter)
}

/// Runs downloads on a bounded pool of workers: de-duplicates by
/// fingerprint, retries transient failures with linear backoff, validates
/// completed files and only then moves them into place. Construct inside a
/// tokio runtime.
#[derive(Clone)]
pub struct DownloadManager {
    client: reqwest::Client,
    settings: Arc<DownloadSettings>,
    tasks: Arc<Mutex<HashMap<String, Arc<DownloadTask>>>>,
    gate: Arc<RwLock<Arc<Semaphore>>>,
    callbacks: Arc<CallbackRegistry>,
    events: EventDispatcher,
}

impl DownloadManager {
    pub fn new(settings: DownloadSettings) -> Self {
        let client = fetch::build_client(Duration::from_secs(settings.connect_timeout_secs));
        let gate = Arc::new(RwLock::new(Arc::new(Semaphore::new(settings.max_concurrent))));
        let callbacks = Arc::new(CallbackRegistry::default());
        let events = EventDispatcher::spawn(callbacks.clone());
        Self {
            client,
            settings: Arc::new(settings),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            gate,
            callbacks,
            events,
        }
    }

    pub fn on_progress(&self, cb: impl Fn(&TaskSnapshot) + Send + Sync + 'static) {
        self.callbacks.on_progress(Arc::new(cb));
    }

    pub fn on_completion(&self, cb: impl Fn(&TaskSnapshot) + Send + Sync + 'static) {
        self.callbacks.on_completion(Arc::new(cb));
    }

    /// Queues a download of `url` to `destination`. Fails while a live
    /// task already exists for the same pair; a finished one is replaced.
    pub fn submit(
        &self,
        url: &str,
        destination: impl Into<PathBuf>,
        title: Option<String>,
    ) -> Result<String> {
        self.submit_inner(url, destination.into(), title, None)
    }

    /// Song variant: the destination is derived from the track's artist
    /// and title under the configured music directory, and the track
    /// record is updated in memory on success.
    pub fn submit_track(&self, track: Arc<Track>) -> Result<String> {
        let ext = filename::extension_from_url(&track.stream_url);
        let file_name = filename::track_file_name(&track.artist, &track.title, ext);
        let destination = self.settings.music_dir.join(file_name);
        let title = if track.artist.is_empty() {
            track.title.clone()
        } else {
            format!("{} - {}", track.artist, track.title)
        };
        let url = track.stream_url.clone();
        self.submit_inner(&url, destination, Some(title), Some(track))
    }

    fn submit_inner(
        &self,
        url: &str,
        destination: PathBuf,
        title: Option<String>,
        track: Option<Arc<Track>>,
    ) -> Result<String> {
        let id = fingerprint(url, &destination);
        let task = Arc::new(DownloadTask::new(
            id.clone(),
            url.to_string(),
            destination,
            title.unwrap_or_else(|| default_title(url)),
            track,
            self.settings.max_retries,
        ));

        {
            let mut tasks = self.tasks.lock();
            if let Some(existing) = tasks.get(&id) {
                if existing.is_live() {
                    bail!("download already in progress for {}", url);
                }
            }
            tasks.insert(id.clone(), task.clone());
        }

        tracing::info!(url, id = %id, "queued download");
        let ctx = WorkerCtx {
            client: self.client.clone(),
            settings: self.settings.clone(),
            gate: self.gate.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(run_task(ctx, task));
        Ok(id)
    }

    /// Cancels the live task for `url`. Terminal and never retried.
    pub fn cancel(&self, url: &str) -> Result<()> {
        let task = {
            let tasks = self.tasks.lock();
            tasks.values().find(|t| t.url == url && t.is_live()).cloned()
        };
        match task {
            Some(task) => {
                task.cancel.cancel();
                Ok(())
            }
            None => bail!("no active download found for {}", url),
        }
    }

    pub fn get_progress(&self, url: &str) -> Option<TaskSnapshot> {
        let tasks = self.tasks.lock();
        tasks
            .values()
            .filter(|t| t.url == url)
            .max_by_key(|t| t.created_at)
            .map(|t| t.snapshot())
    }

    pub fn list_all(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> =
            self.tasks.lock().values().map(|t| t.snapshot()).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Drops every finished task — Completed, Failed and Cancelled alike —
    /// from the table. Live tasks are untouched.
    pub fn clear_completed(&self) {
        self.tasks.lock().retain(|_, t| t.is_live());
    }

    /// Swaps the concurrency gate. Tasks already holding or awaiting a
    /// slot keep the old gate; later acquisitions see the new limit.
    pub fn set_max_concurrent(&self, n: usize) {
        *self.gate.write() = Arc::new(Semaphore::new(n));
        tracing::info!(max_concurrent = n, "concurrency limit changed");
    }
}

struct WorkerCtx {
    client: reqwest::Client,
    settings: Arc<DownloadSettings>,
    gate: Arc<RwLock<Arc<Semaphore>>>,
    events: EventDispatcher,
}

async fn run_task(ctx: WorkerCtx, task: Arc<DownloadTask>) {
    let semaphore = ctx.gate.read().clone();
    let _permit = tokio::select! {
        _ = task.cancel.cancelled() => {
            task.finish(DownloadState::Cancelled, None);
            ctx.events.emit(TaskEvent::Finished(task.snapshot()));
            return;
        }
        permit = semaphore.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => {
                task.finish(DownloadState::Failed, Some("concurrency gate closed".into()));
                ctx.events.emit(TaskEvent::Finished(task.snapshot()));
                return;
            }
        },
    };

    let started = Utc::now();
    task.mark_started(started);

    match drive(&ctx, &task, started).await {
        Ok(()) => {
            if let Some(track) = &task.track {
                track.mark_downloaded(&task.destination);
            }
            task.finish(DownloadState::Completed, None);
            tracing::info!(url = %task.url, path = %task.destination.display(), "download complete");
        }
        Err(e) => {
            if fetch::classify_error(&e) == ErrorClass::Cancelled || task.cancel.is_cancelled() {
                task.finish(DownloadState::Cancelled, None);
                tracing::info!(url = %task.url, "download cancelled");
            } else {
                task.finish(DownloadState::Failed, Some(e.to_string()));
                tracing::error!(url = %task.url, error = %e, "download failed");
            }
        }
    }
    ctx.events.emit(TaskEvent::Finished(task.snapshot()));
}

/// The retry loop. Transient failures back off and try again until the
/// attempt budget runs out; permanent failures, validation failures and
/// cancellation all short-circuit.
async fn drive(ctx: &WorkerCtx, task: &Arc<DownloadTask>, started: DateTime<Utc>) -> Result<()> {
    let tmp = fetch::temp_path(&task.destination);
    loop {
        let attempt = task.begin_attempt();
        match attempt_transfer(ctx, task, &tmp, started).await {
            Ok(()) => {
                if let Err(e) =
                    validate::validate_download(&tmp, ctx.settings.min_audio_bytes).await
                {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(anyhow!("validation failed for {}: {}", task.url, e));
                }
                if let Err(e) = tokio::fs::rename(&tmp, &task.destination).await {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(anyhow!(
                        "could not move {} into place: {}",
                        task.destination.display(),
                        e
                    ));
                }
                return Ok(());
            }
            Err(e) => match fetch::classify_error(&e) {
                ErrorClass::Cancelled | ErrorClass::Permanent => return Err(e),
                ErrorClass::Transient => {
                    if attempt >= task.max_retries {
                        return Err(e);
                    }
                    let delay = backoff_delay(ctx.settings.retry_delay(), attempt);
                    tracing::warn!(
                        url = %task.url,
                        attempt,
                        max_retries = task.max_retries,
                        error = %e,
                        "transfer failed, backing off"
                    );
                    tokio::select! {
                        _ = task.cancel.cancelled() => return Err(fetch::transfer_cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
        }
    }
}

async fn attempt_transfer(
    ctx: &WorkerCtx,
    task: &Arc<DownloadTask>,
    tmp: &Path,
    started: DateTime<Utc>,
) -> Result<()> {
    let mut sink = FileSink::create(tmp, ctx.settings.write_buffer_bytes).await?;
    let opts = TransferOptions {
        range_start: 0,
        chunk_timeout: ctx.settings.chunk_timeout(),
        cancel: task.cancel.clone(),
    };

    let mut throttle = ProgressThrottle::new(ctx.settings.progress_interval_ms);
    let events = ctx.events.clone();
    let progress_task = task.clone();
    let result = fetch::run_transfer(
        &ctx.client,
        &task.url,
        &mut sink,
        &opts,
        move |downloaded, total| {
            progress_task
                .with_progress(|p| progress::update(p, downloaded, total, Utc::now(), started));
            if throttle.should_emit() {
                events.emit(TaskEvent::Progress(progress_task.snapshot()));
            }
        },
    )
    .await;

    match result {
        Ok(received) => {
            // Throttling may have swallowed the last chunk's update; always
            // publish the end-of-transfer state.
            task.with_progress(|p| {
                let total = p.total_bytes;
                progress::update(p, received, total, Utc::now(), started);
            });
            ctx.events.emit(TaskEvent::Progress(task.snapshot()));
            Ok(())
        }
        Err(e) => {
            sink.abort().await;
            Err(e)
        }
    }
}
