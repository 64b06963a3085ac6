//! The `Jukebox`: one queue, one cache, one fetch coordinator and one
//! playback driver wired together, plus the request-level operations a
//! front end (chat command, control socket) needs.

use crate::cache::{CacheStatistics, CacheStore};
use crate::collab::{Downloader, Notifier, Streamer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{FetchCoordinator, FetchSettings};
use crate::playback::{PlaybackDriver, PlaybackSettings, PlaybackState};
use crate::queue::{QueueEntry, SongQueue};
use crate::resource::is_url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Queue contents and player state at one instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub current: Option<QueueEntry>,
    pub pending: Vec<QueueEntry>,
    pub state: PlaybackState,
}

pub struct Jukebox {
    config: Config,
    queue: Arc<SongQueue>,
    cache: Arc<CacheStore>,
    downloader: Arc<dyn Downloader>,
    fetcher: Arc<FetchCoordinator>,
    player: Arc<PlaybackDriver>,
}

impl Jukebox {
    /// Opens the cache described by `config.cache` and wires everything up.
    pub async fn open(
        config: Config,
        downloader: Arc<dyn Downloader>,
        streamer: Arc<dyn Streamer>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = CacheStore::open(&config.cache)
            .await?
            .with_notifier(Arc::clone(&notifier));
        Ok(Self::with_cache(config, Arc::new(cache), downloader, streamer, notifier))
    }

    pub fn with_cache(
        config: Config,
        cache: Arc<CacheStore>,
        downloader: Arc<dyn Downloader>,
        streamer: Arc<dyn Streamer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let queue = Arc::new(SongQueue::new());
        let fetcher = FetchCoordinator::new(
            Arc::clone(&queue),
            Arc::clone(&cache),
            Arc::clone(&downloader),
            notifier,
            FetchSettings::from(&config.fetch),
        );
        let player = PlaybackDriver::new(
            Arc::clone(&queue),
            streamer,
            PlaybackSettings::from(&config.playback),
        );
        Self {
            config,
            queue,
            cache,
            downloader,
            fetcher,
            player,
        }
    }

    pub fn queue(&self) -> &Arc<SongQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn fetcher(&self) -> &Arc<FetchCoordinator> {
        &self.fetcher
    }

    pub fn player(&self) -> &Arc<PlaybackDriver> {
        &self.player
    }

    /// Starts the fetch coordinator, the cleanup timer (if enabled) and the
    /// playback loop. Fetching and cleanup stop when `cancel` fires; call
    /// [`Jukebox::stop`] to stop playback.
    pub async fn start_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.fetcher.spawn(cancel.clone())];
        if self.config.cache.auto_cleanup {
            handles.push(
                Arc::clone(&self.cache)
                    .spawn_cleanup(self.config.cache.cleanup_interval(), cancel.clone()),
            );
        }
        self.player.start().await;
        handles
    }

    /// Accepts a playback request. Search queries are resolved to the URL of
    /// their first result; the entry starts with a placeholder title.
    pub async fn request(&self, query: &str, requester: &str, play_next: bool) -> Result<QueueEntry> {
        let query = query.trim();
        let url = if is_url(query) {
            query.to_string()
        } else {
            self.downloader
                .search_first_url(query)
                .await
                .ok_or_else(|| Error::NoSearchResult(query.to_string()))?
        };

        let entry = QueueEntry::new(url, requester);
        info!("jukebox: {} requested {} as {}", requester, entry.url, entry.id);
        if play_next {
            self.queue.enqueue_front(entry.clone()).await;
        } else {
            self.queue.enqueue(entry.clone()).await;
        }
        Ok(entry)
    }

    pub async fn skip(&self) -> Option<QueueEntry> {
        self.player.skip().await
    }

    pub async fn stop(&self) {
        self.player.stop().await;
    }

    /// Restarts the playback loop after a stop. False if already running.
    pub async fn start(&self) -> bool {
        self.player.start().await
    }

    pub async fn clear_queue(&self) -> usize {
        self.queue.clear().await
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let (current, pending) = self.queue.snapshot().await;
        QueueSnapshot {
            current,
            pending,
            state: self.player.state(),
        }
    }

    pub async fn cache_stats(&self) -> CacheStatistics {
        self.cache.statistics().await
    }

    pub async fn clear_cache(&self) -> usize {
        self.cache.clear_all().await
    }
}
