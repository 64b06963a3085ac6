//! Background resolution of titles and audio files for queued entries.
//!
//! ```text
//!   SongQueue ──SongAdded──► listener ─┐
//!                                      ├─► tasks_for(entry) ──► download task  (gate: N permits)
//!   poll loop (every 1 s) ─────────────┘                    └─► metadata task  (gate: M permits)
//! ```
//!
//! Both triggers go through the same claim step. Downloads are claimed per
//! resource id, so two link shapes for one video share a single download;
//! title lookups are claimed per URL. A URL that has failed
//! `retry_max_attempts` times in a row is skipped until its backoff window
//! has passed. Claims are released by `Drop`, so a cancelled or panicking
//! task never leaves anything stuck in flight.
//!
//! A finished download is attached to every queued entry for that resource,
//! always with the path the cache recorded.

use crate::cache::CacheStore;
use crate::collab::{Downloader, Notifier};
use crate::config::FetchConfig;
use crate::queue::{EntryId, QueueEntry, QueueEvent, SongQueue};
use crate::resource::{is_placeholder_title, resource_id};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_ERROR_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub max_concurrent_downloads: usize,
    pub max_concurrent_metadata: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
    /// Pause after a polling iteration blew up.
    pub error_pause: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self::from(&FetchConfig::default())
    }
}

impl From<&FetchConfig> for FetchSettings {
    fn from(config: &FetchConfig) -> Self {
        Self {
            max_concurrent_downloads: config.max_concurrent_downloads,
            max_concurrent_metadata: config.max_concurrent_metadata,
            retry_max_attempts: config.retry_max_attempts,
            retry_backoff: config.retry_backoff(),
            poll_interval: config.poll_interval(),
            error_pause: DEFAULT_ERROR_PAUSE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Download,
    Metadata,
}

#[derive(Debug)]
struct FailureRecord {
    count: u32,
    last_failure: Instant,
}

#[derive(Debug, Default)]
struct InFlight {
    /// Resource ids.
    downloading: HashSet<String>,
    /// URLs.
    fetching_metadata: HashSet<String>,
    failures: HashMap<String, FailureRecord>,
}

impl InFlight {
    fn set_mut(&mut self, job: Job) -> &mut HashSet<String> {
        match job {
            Job::Download => &mut self.downloading,
            Job::Metadata => &mut self.fetching_metadata,
        }
    }

    /// Drops failure records whose backoff window has passed, including
    /// those of URLs that are no longer queued.
    fn prune_failures(&mut self, backoff: Duration) -> usize {
        let before = self.failures.len();
        self.failures.retain(|_, r| r.last_failure.elapsed() < backoff);
        before - self.failures.len()
    }
}

/// Ownership of one key in one in-flight set; released on drop.
struct Claim {
    coordinator: Arc<FetchCoordinator>,
    job: Job,
    key: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.coordinator.state().set_mut(self.job).remove(&self.key);
    }
}

pub struct FetchCoordinator {
    queue: Arc<SongQueue>,
    cache: Arc<CacheStore>,
    downloader: Arc<dyn Downloader>,
    notifier: Arc<dyn Notifier>,
    settings: FetchSettings,
    download_gate: Semaphore,
    metadata_gate: Semaphore,
    state: Mutex<InFlight>,
    /// Registered at construction so no `SongAdded` is missed before `run`.
    events: Mutex<Option<broadcast::Receiver<QueueEvent>>>,
}

impl FetchCoordinator {
    pub fn new(
        queue: Arc<SongQueue>,
        cache: Arc<CacheStore>,
        downloader: Arc<dyn Downloader>,
        notifier: Arc<dyn Notifier>,
        settings: FetchSettings,
    ) -> Arc<Self> {
        let events = queue.subscribe();
        Arc::new(Self {
            download_gate: Semaphore::new(settings.max_concurrent_downloads.max(1)),
            metadata_gate: Semaphore::new(settings.max_concurrent_metadata.max(1)),
            queue,
            cache,
            downloader,
            notifier,
            settings,
            state: Mutex::new(InFlight::default()),
            events: Mutex::new(Some(events)),
        })
    }

    /// Starts the polling loop and the `SongAdded` listener.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(cancel).await })
    }

    /// Runs until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let events = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let listener = events.map(|rx| tokio::spawn(Arc::clone(&self).listen(rx, cancel.clone())));
        if listener.is_none() {
            warn!("fetch: coordinator already ran once; relying on polling only");
        }

        info!(
            "fetch: started (downloads={}, metadata={}, poll={:?})",
            self.settings.max_concurrent_downloads,
            self.settings.max_concurrent_metadata,
            self.settings.poll_interval
        );

        loop {
            // The iteration runs as its own task so that a panic anywhere in
            // it surfaces here as a JoinError instead of killing the loop.
            let this = Arc::clone(&self);
            let token = cancel.clone();
            let mut iteration = tokio::spawn(async move { this.poll_once_with(&token).await });

            let pause = tokio::select! {
                _ = cancel.cancelled() => {
                    iteration.abort();
                    break;
                }
                result = &mut iteration => match result {
                    Ok(launched) => {
                        if launched > 0 {
                            debug!("fetch: poll iteration ran {} tasks", launched);
                        }
                        self.settings.poll_interval
                    }
                    Err(e) => {
                        error!("fetch: poll iteration failed: {}", e);
                        self.settings.error_pause
                    }
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        if let Some(listener) = listener {
            let _ = listener.await;
        }
        info!("fetch: stopped");
    }

    /// One polling pass: launches whatever the current entry and every
    /// pending entry still need, and waits for all of it. Returns the number
    /// of tasks launched.
    pub async fn poll_once(self: &Arc<Self>) -> usize {
        self.poll_once_with(&CancellationToken::new()).await
    }

    async fn poll_once_with(self: &Arc<Self>, cancel: &CancellationToken) -> usize {
        let pruned = self.state().prune_failures(self.settings.retry_backoff);
        if pruned > 0 {
            debug!("fetch: forgot {} expired failure records", pruned);
        }

        let (current, pending) = self.queue.snapshot().await;
        let mut handles = Vec::new();
        for entry in current.iter().chain(pending.iter()) {
            handles.extend(self.tasks_for(entry, cancel).await);
        }
        let launched = handles.len();
        join_logged(handles).await;
        launched
    }

    /// Launches and awaits the tasks `entry` needs right now. Returns the
    /// number of tasks launched (0 when everything is done or in flight).
    pub async fn process_entry(self: &Arc<Self>, entry: &QueueEntry) -> usize {
        let handles = self.tasks_for(entry, &CancellationToken::new()).await;
        let launched = handles.len();
        join_logged(handles).await;
        launched
    }

    /// Claims and spawns the download and/or metadata task for `entry`.
    async fn tasks_for(self: &Arc<Self>, entry: &QueueEntry, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(claim) = self.claim_download(entry).await {
            let this = Arc::clone(self);
            let entry = entry.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => debug!("fetch: download of {} cancelled", entry.url),
                    _ = this.download(&entry) => {}
                }
                drop(claim);
            }));
        }

        if let Some(claim) = self.claim_metadata(entry) {
            let this = Arc::clone(self);
            let entry = entry.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => debug!("fetch: title lookup of {} cancelled", entry.url),
                    _ = this.fetch_title(&entry) => {}
                }
                drop(claim);
            }));
        }

        handles
    }

    async fn listen(self: Arc<Self>, mut events: broadcast::Receiver<QueueEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(QueueEvent::SongAdded(entry)) => {
                        let handles = self.tasks_for(&entry, &cancel).await;
                        if !handles.is_empty() {
                            debug!("fetch: {} added, started {} tasks", entry.id, handles.len());
                            tokio::spawn(join_logged(handles));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("fetch: missed {} queue events, polling will catch up", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("fetch: listener exiting");
    }

    // ── claims ────────────────────────────────────────────────────────────────

    async fn claim_download(self: &Arc<Self>, entry: &QueueEntry) -> Option<Claim> {
        if entry.is_ready().await {
            return None;
        }
        let id = resource_id(&entry.url);
        let mut state = self.state();
        if state.downloading.contains(&id) || !self.retry_allowed(&mut state, &entry.url) {
            return None;
        }
        state.downloading.insert(id.clone());
        Some(self.claim(Job::Download, id))
    }

    fn claim_metadata(self: &Arc<Self>, entry: &QueueEntry) -> Option<Claim> {
        if !is_placeholder_title(&entry.title) {
            return None;
        }
        let mut state = self.state();
        if !state.fetching_metadata.insert(entry.url.clone()) {
            return None;
        }
        Some(self.claim(Job::Metadata, entry.url.clone()))
    }

    fn claim(self: &Arc<Self>, job: Job, key: String) -> Claim {
        Claim {
            coordinator: Arc::clone(self),
            job,
            key,
        }
    }

    fn retry_allowed(&self, state: &mut InFlight, url: &str) -> bool {
        let Some(record) = state.failures.get(url) else {
            return true;
        };
        if record.count < self.settings.retry_max_attempts {
            return true;
        }
        if record.last_failure.elapsed() >= self.settings.retry_backoff {
            info!("fetch: backoff elapsed for {}, retrying", url);
            state.failures.remove(url);
            return true;
        }
        false
    }

    fn record_failure(&self, url: &str) {
        let mut state = self.state();
        let record = state
            .failures
            .entry(url.to_string())
            .or_insert(FailureRecord {
                count: 0,
                last_failure: Instant::now(),
            });
        record.count += 1;
        record.last_failure = Instant::now();
        if record.count >= self.settings.retry_max_attempts {
            warn!(
                "fetch: {} failed {} times, backing off for {:?}",
                url, record.count, self.settings.retry_backoff
            );
        }
    }

    fn clear_failures(&self, url: &str) {
        self.state().failures.remove(url);
    }

    fn state(&self) -> MutexGuard<'_, InFlight> {
        // Never held across an await, and every critical section leaves the
        // sets consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Consecutive failures currently recorded for `url`.
    pub fn failure_count(&self, url: &str) -> u32 {
        self.state().failures.get(url).map(|r| r.count).unwrap_or(0)
    }

    /// True while the resource behind `url` is being downloaded, whichever
    /// link shape started it.
    pub fn is_downloading(&self, url: &str) -> bool {
        self.state().downloading.contains(&resource_id(url))
    }

    // ── tasks ─────────────────────────────────────────────────────────────────

    async fn download(&self, entry: &QueueEntry) {
        let Ok(_permit) = self.download_gate.acquire().await else {
            return;
        };
        let id = resource_id(&entry.url);

        if let Some(hit) = self.cache.lookup(&id).await {
            debug!("fetch: cache hit for {} ({})", entry.url, id);
            self.clear_failures(&entry.url);
            self.attach_file(&id, hit.file_path, Some(hit.title)).await;
            return;
        }

        debug!("fetch: downloading {} ({})", entry.url, id);
        let Some(downloaded) = self.downloader.download(&entry.url).await else {
            warn!("fetch: download failed for {}", entry.url);
            self.record_failure(&entry.url);
            return;
        };

        let title = self.latest_title(entry).await;
        if !self.cache.insert(&id, &title, &entry.url, &downloaded).await {
            warn!("fetch: cache rejected {:?} for {}", downloaded, entry.url);
            self.record_failure(&entry.url);
            return;
        }

        // The cache may already have held this resource under another file;
        // its record wins.
        let Some(cached) = self.cache.lookup(&id).await else {
            warn!("fetch: {} vanished from the cache right after insert", id);
            self.record_failure(&entry.url);
            return;
        };
        if cached.file_path != downloaded {
            debug!("fetch: {:?} duplicates cached {:?}, removing it", downloaded, cached.file_path);
            if let Err(e) = tokio::fs::remove_file(&downloaded).await {
                warn!("fetch: failed to remove duplicate {:?}: {}", downloaded, e);
            }
        }

        self.clear_failures(&entry.url);
        info!("fetch: {} ready at {:?}", entry.id, cached.file_path);
        self.attach_file(&id, cached.file_path, None).await;
    }

    async fn fetch_title(&self, entry: &QueueEntry) {
        let Ok(_permit) = self.metadata_gate.acquire().await else {
            return;
        };
        let title = match self.downloader.get_title(&entry.url).await {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => {
                debug!("fetch: no title for {}", entry.url);
                return;
            }
        };

        if self.queue.update(entry.id, |e| e.title = title.clone()).await {
            debug!("fetch: {} is '{}'", entry.id, title);
            self.notify_title(entry.id, &title);
        }
    }

    /// Points every queued entry for `resource` at `path`, adopting
    /// `cached_title` where an entry still shows a placeholder.
    async fn attach_file(&self, resource: &str, path: PathBuf, cached_title: Option<String>) {
        let cached_title = cached_title.filter(|t| !is_placeholder_title(t));
        let mut adopted = Vec::new();
        let touched = self
            .queue
            .update_matching(
                |e| resource_id(&e.url) == resource,
                |e| {
                    e.file_path = Some(path.clone());
                    if let Some(title) = &cached_title {
                        if is_placeholder_title(&e.title) {
                            e.title = title.clone();
                            adopted.push(e.id);
                        }
                    }
                },
            )
            .await;
        if touched.is_empty() {
            debug!("fetch: {} left the queue before its file was ready", resource);
        }
        if let Some(title) = cached_title {
            for id in adopted {
                self.notify_title(id, &title);
            }
        }
    }

    async fn latest_title(&self, entry: &QueueEntry) -> String {
        let (current, pending) = self.queue.snapshot().await;
        current
            .into_iter()
            .chain(pending)
            .find(|e| e.id == entry.id)
            .map(|e| e.title)
            .unwrap_or_else(|| entry.title.clone())
    }

    fn notify_title(&self, id: EntryId, title: &str) {
        if let Err(e) = self.notifier.on_title_resolved(id, title) {
            warn!("fetch: title notifier failed for {}: {}", id, e);
        }
    }
}

async fn join_logged(handles: Vec<JoinHandle<()>>) {
    for result in futures_util::future::join_all(handles).await {
        if let Err(e) = result {
            if e.is_panic() {
                error!("fetch: task panicked: {}", e);
            }
        }
    }
}
