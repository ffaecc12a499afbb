//! Download and progressive-streaming core for the Crescendo music player.
//!
//! Two independent subsystems share one HTTP fetch loop:
//!
//! - [`DownloadManager`] fetches remote media files to local storage on a
//!   bounded pool of workers, with retry, validation and atomic
//!   completion.
//! - [`StreamRegistry`] hands out [`StreamReader`]s that let the audio
//!   decoder read and seek into a file's bytes while they are still
//!   arriving.
//!
//! Both are driven by the embedding application: callbacks for progress
//! and completion, a caller-owned timer for idle-stream sweeping, and a
//! `tracing` subscriber installed by the binary.

pub mod core;
pub mod models;
pub mod storage;

pub use crate::core::manager::DownloadManager;
pub use crate::core::registry::StreamRegistry;
pub use crate::core::stream::{StreamBuffer, StreamEvent, StreamReader};
pub use crate::models::download::{DownloadState, Progress, TaskSnapshot};
pub use crate::models::settings::{CoreSettings, DownloadSettings, StreamingSettings};
pub use crate::models::track::Track;
