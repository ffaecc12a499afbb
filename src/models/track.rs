use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// A song record owned by the caller's library layer.
///
/// The download core borrows this and writes exactly two fields — the local
/// path and the downloaded flag — at the single moment a song download
/// completes successfully. Persisting the change is the caller's job.
/// Callers that also mutate the record concurrently should snapshot it
/// instead of racing the completion write.
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub stream_url: String,
    local_path: Mutex<Option<PathBuf>>,
    downloaded: AtomicBool,
}

impl Track {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        album: Option<String>,
        stream_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            album,
            stream_url: stream_url.into(),
            local_path: Mutex::new(None),
            downloaded: AtomicBool::new(false),
        }
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.local_path.lock().clone()
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_downloaded(&self, path: &Path) {
        *self.local_path.lock() = Some(path.to_path_buf());
        self.downloaded.store(true, Ordering::Release);
    }
}
