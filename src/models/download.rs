use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::models::track::Track;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadState {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

/// Byte-level progress of one transfer. Mutated only through
/// [`crate::core::progress::update`] and read via snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Progress {
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub percent: f64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub(crate) struct TaskState {
    pub state: DownloadState,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One tracked download for a (URL, destination) pair.
///
/// State fields and progress live behind separate locks so a snapshot
/// reader never contends with the worker updating transfer counters.
pub struct DownloadTask {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    pub title: String,
    pub track: Option<Arc<Track>>,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    state: Mutex<TaskState>,
    progress: Mutex<Progress>,
}

impl DownloadTask {
    pub fn new(
        id: String,
        url: String,
        destination: PathBuf,
        title: String,
        track: Option<Arc<Track>>,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            url,
            destination,
            title,
            track,
            max_retries,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: Mutex::new(TaskState {
                state: DownloadState::Pending,
                error: None,
                attempts: 0,
                started_at: None,
                completed_at: None,
            }),
            progress: Mutex::new(Progress::default()),
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state.lock().state
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    pub fn mark_started(&self, at: DateTime<Utc>) {
        let mut s = self.state.lock();
        s.started_at = Some(at);
    }

    pub fn begin_attempt(&self) -> u32 {
        let mut s = self.state.lock();
        s.state = DownloadState::Downloading;
        s.attempts += 1;
        s.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started_at
    }

    /// Moves the task into a terminal state. Cancellation always wins: once
    /// the token has fired, the only terminal state this records is
    /// `Cancelled`, regardless of what the worker observed last.
    pub fn finish(&self, state: DownloadState, error: Option<String>) {
        let mut s = self.state.lock();
        if s.state.is_terminal() {
            return;
        }
        s.state = if self.cancel.is_cancelled() {
            DownloadState::Cancelled
        } else {
            state
        };
        s.error = if s.state == DownloadState::Cancelled {
            None
        } else {
            error
        };
        s.completed_at = Some(Utc::now());
    }

    pub fn with_progress<R>(&self, f: impl FnOnce(&mut Progress) -> R) -> R {
        f(&mut self.progress.lock())
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let (state, error, attempts, started_at, completed_at) = {
            let s = self.state.lock();
            (s.state, s.error.clone(), s.attempts, s.started_at, s.completed_at)
        };
        let progress = self.progress.lock().clone();
        TaskSnapshot {
            id: self.id.clone(),
            url: self.url.clone(),
            title: self.title.clone(),
            destination: self.destination.clone(),
            state,
            error,
            attempts,
            progress,
            created_at: self.created_at,
            started_at,
            completed_at,
        }
    }
}

/// Immutable, serializable view of a task handed to callers and callbacks.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub url: String,
    pub title: String,
    pub destination: PathBuf,
    pub state: DownloadState,
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(flatten)]
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DownloadTask {
        DownloadTask::new(
            "abc123".into(),
            "http://example.com/a.mp3".into(),
            PathBuf::from("/tmp/a.mp3"),
            "a".into(),
            None,
            3,
        )
    }

    #[test]
    fn new_task_is_pending() {
        let t = task();
        assert_eq!(t.state(), DownloadState::Pending);
        assert!(t.is_live());
        assert_eq!(t.attempts(), 0);
    }

    #[test]
    fn begin_attempt_increments_and_downloads() {
        let t = task();
        assert_eq!(t.begin_attempt(), 1);
        assert_eq!(t.state(), DownloadState::Downloading);
        assert_eq!(t.begin_attempt(), 2);
    }

    #[test]
    fn finish_records_error_and_timestamp() {
        let t = task();
        t.finish(DownloadState::Failed, Some("HTTP 404".into()));
        let snap = t.snapshot();
        assert_eq!(snap.state, DownloadState::Failed);
        assert_eq!(snap.error.as_deref(), Some("HTTP 404"));
        assert!(snap.completed_at.is_some());
    }

    #[test]
    fn finish_is_latched() {
        let t = task();
        t.finish(DownloadState::Completed, None);
        t.finish(DownloadState::Failed, Some("late".into()));
        assert_eq!(t.state(), DownloadState::Completed);
    }

    #[test]
    fn cancellation_beats_failure() {
        let t = task();
        t.cancel.cancel();
        t.finish(DownloadState::Failed, Some("stream error".into()));
        let snap = t.snapshot();
        assert_eq!(snap.state, DownloadState::Cancelled);
        assert!(snap.error.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(DownloadState::Completed.is_terminal());
        assert!(DownloadState::Failed.is_terminal());
        assert!(DownloadState::Cancelled.is_terminal());
        assert!(DownloadState::Pending.is_live());
        assert!(DownloadState::Downloading.is_live());
    }
}
