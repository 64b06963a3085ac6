//! Shared fixtures: counting mock collaborators and filesystem helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use jukebox_core::cache::CacheStatistics;
use jukebox_core::collab::{Downloader, Notifier, Streamer};
use jukebox_core::config::CacheConfig;
use jukebox_core::queue::EntryId;
use jukebox_core::resource::resource_id;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn cache_config(dir: &Path, max_files: usize, max_size_bytes: u64) -> CacheConfig {
    CacheConfig {
        max_files,
        max_size_bytes,
        directory: dir.to_path_buf(),
        auto_cleanup: false,
        cleanup_interval_minutes: 60,
    }
}

/// Writes `size` bytes to `dir/name` and returns the path.
pub fn write_file(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, vec![0u8; size]).unwrap();
    path
}

/// Polls `check` every 20 ms until it returns true or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Downloader ────────────────────────────────────────────────────────────────

pub struct MockDownloader {
    dir: PathBuf,
    payload_size: usize,
    delay: Duration,
    title_delay: Duration,
    fail_downloads: AtomicBool,
    /// The next download call panics instead of returning.
    panic_next: AtomicBool,
    /// Explicit url → file results; anything else gets a file written into `dir`.
    files: Mutex<HashMap<String, PathBuf>>,
    titles: Mutex<HashMap<String, String>>,
    searches: Mutex<HashMap<String, String>>,
    pub download_calls: AtomicUsize,
    pub title_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
}

impl MockDownloader {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            payload_size: 1024,
            delay: Duration::ZERO,
            title_delay: Duration::ZERO,
            fail_downloads: AtomicBool::new(false),
            panic_next: AtomicBool::new(false),
            files: Mutex::new(HashMap::new()),
            titles: Mutex::new(HashMap::new()),
            searches: Mutex::new(HashMap::new()),
            download_calls: AtomicUsize::new(0),
            title_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_title_delay(mut self, delay: Duration) -> Self {
        self.title_delay = delay;
        self
    }

    pub fn panicking_once(self) -> Self {
        self.panic_next.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    pub fn failing(self) -> Self {
        self.fail_downloads.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub fn with_file(self, url: &str, path: PathBuf) -> Self {
        self.files.lock().unwrap().insert(url.to_string(), path);
        self
    }

    pub fn add_file(&self, url: &str, path: PathBuf) {
        self.files.lock().unwrap().insert(url.to_string(), path);
    }

    pub fn with_title(self, url: &str, title: &str) -> Self {
        self.titles.lock().unwrap().insert(url.to_string(), title.to_string());
        self
    }

    pub fn with_search(self, query: &str, url: &str) -> Self {
        self.searches.lock().unwrap().insert(query.to_string(), url.to_string());
        self
    }

    pub fn downloads(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn title_lookups(&self) -> usize {
        self.title_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn download(&self, url: &str) -> Option<PathBuf> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("downloader blew up on {}", url);
        }
        if self.fail_downloads.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(path) = self.files.lock().unwrap().get(url).cloned() {
            return Some(path);
        }
        let path = self.dir.join(format!("{}.mp3", resource_id(url)));
        std::fs::write(&path, vec![7u8; self.payload_size]).ok()?;
        Some(path)
    }

    async fn get_title(&self, url: &str) -> Option<String> {
        self.title_calls.fetch_add(1, Ordering::SeqCst);
        if !self.title_delay.is_zero() {
            tokio::time::sleep(self.title_delay).await;
        }
        self.titles.lock().unwrap().get(url).cloned()
    }

    async fn search_first_url(&self, query: &str) -> Option<String> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.searches.lock().unwrap().get(query).cloned()
    }
}

// ── Streamer ──────────────────────────────────────────────────────────────────

pub struct MockStreamer {
    completed: broadcast::Sender<()>,
    /// Finish every stream by itself after this long.
    auto_complete: Option<Duration>,
    played: Mutex<Vec<PathBuf>>,
    /// The next play call panics.
    panic_next: AtomicBool,
    pub stop_calls: AtomicUsize,
}

impl MockStreamer {
    pub fn new() -> Self {
        let (completed, _) = broadcast::channel(16);
        Self {
            completed,
            auto_complete: None,
            played: Mutex::new(Vec::new()),
            panic_next: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn auto_completing(mut self, after: Duration) -> Self {
        self.auto_complete = Some(after);
        self
    }

    pub fn panicking_once(self) -> Self {
        self.panic_next.store(true, Ordering::SeqCst);
        self
    }

    /// Simulates the current stream reaching its end.
    pub fn finish(&self) {
        let _ = self.completed.send(());
    }

    pub fn played(&self) -> Vec<PathBuf> {
        self.played.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Streamer for MockStreamer {
    async fn play(&self, path: &Path) -> anyhow::Result<()> {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("output device vanished while opening {:?}", path);
        }
        self.played.lock().unwrap().push(path.to_path_buf());
        if let Some(after) = self.auto_complete {
            let tx = self.completed.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(());
            });
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_completed(&self) -> broadcast::Receiver<()> {
        self.completed.subscribe()
    }
}

// ── Notifier ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    pub titles: Mutex<Vec<(EntryId, String)>>,
    pub evictions: Mutex<Vec<CacheStatistics>>,
}

impl RecordingNotifier {
    pub fn titles(&self) -> Vec<(EntryId, String)> {
        self.titles.lock().unwrap().clone()
    }

    pub fn evictions(&self) -> Vec<CacheStatistics> {
        self.evictions.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn on_title_resolved(&self, entry_id: EntryId, title: &str) -> anyhow::Result<()> {
        self.titles.lock().unwrap().push((entry_id, title.to_string()));
        Ok(())
    }

    fn on_cache_cleared_or_evicted(&self, stats: &CacheStatistics) -> anyhow::Result<()> {
        self.evictions.lock().unwrap().push(stats.clone());
        Ok(())
    }
}

/// Notifier whose every call fails, for isolation tests.
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn on_title_resolved(&self, _entry_id: EntryId, _title: &str) -> anyhow::Result<()> {
        anyhow::bail!("display offline")
    }

    fn on_cache_cleared_or_evicted(&self, _stats: &CacheStatistics) -> anyhow::Result<()> {
        anyhow::bail!("display offline")
    }
}
