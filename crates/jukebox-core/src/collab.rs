//! Contracts for the collaborators the core drives but does not implement.
//!
//! The daemon plugs in yt-dlp, mpv and the control-socket broadcaster; tests
//! plug in counting mocks.

use crate::cache::CacheStatistics;
use crate::queue::EntryId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Resolves URLs and queries to local files and display titles.
///
/// Every method reports failure as `None`; implementations log the cause.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Downloads the audio behind `url` and returns the local file.
    async fn download(&self, url: &str) -> Option<PathBuf>;

    async fn get_title(&self, url: &str) -> Option<String>;

    /// Resolves a free-text query to the URL of its best match.
    async fn search_first_url(&self, query: &str) -> Option<String>;
}

/// Live output sink.
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Starts playing `path` and returns without waiting for the end.
    async fn play(&self, path: &Path) -> anyhow::Result<()>;

    /// Stops playback. Stopping an idle streamer is not an error.
    async fn stop(&self) -> anyhow::Result<()>;

    /// One `()` per stream that reached its natural end.
    fn subscribe_completed(&self) -> broadcast::Receiver<()>;
}

/// User-facing display of background progress.
pub trait Notifier: Send + Sync {
    fn on_title_resolved(&self, entry_id: EntryId, title: &str) -> anyhow::Result<()>;

    fn on_cache_cleared_or_evicted(&self, stats: &CacheStatistics) -> anyhow::Result<()>;
}

/// Notifier that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn on_title_resolved(&self, _entry_id: EntryId, _title: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_cache_cleared_or_evicted(&self, _stats: &CacheStatistics) -> anyhow::Result<()> {
        Ok(())
    }
}
