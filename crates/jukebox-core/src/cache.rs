//! On-disk audio cache with LRU eviction.
//!
//! ## Layout
//!
//! ```text
//!   <cache dir>/
//!     cache_index.json      ← every CacheEntry, rewritten after each mutation
//!     <resource id>.<ext>   ← audio files (written by the Downloader)
//! ```
//!
//! The store is the only component that deletes cache files. Every
//! read-modify-write runs under one async mutex, so an insert and the sweep
//! it triggers can never interleave with another insert, lookup or touch.
//!
//! ## Eviction
//!
//!   1. purge entries whose file is gone
//!   2. over `max_files`      → mark the `count - max` least recently accessed
//!   3. over `max_size_bytes` → mark more, oldest first, until enough bytes are freed
//!   4. delete marked files (failures logged, batch continues) and drop the entries
//!
//! Ties on `last_accessed_at` are broken by resource id.

use crate::collab::{Notifier, NullNotifier};
use crate::config::CacheConfig;
use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "cache_index.json";

/// One cached audio file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub resource_id: String,
    pub title: String,
    pub url: String,
    pub file_path: PathBuf,
    pub file_size_bytes: u64,
    pub cached_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Snapshot of the store, computed on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub total_files: usize,
    pub total_bytes: u64,
    /// Files removed by the most recent eviction batch (or clear).
    pub last_evicted_files: usize,
    pub last_evicted_bytes: u64,
    pub max_files: usize,
    pub max_size_bytes: u64,
}

/// What a single sweep removed for exceeding the limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    #[serde(default)]
    entries: Vec<CacheEntry>,
}

#[derive(Serialize)]
struct IndexRef<'a> {
    entries: Vec<&'a CacheEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    last_evicted_files: usize,
    last_evicted_bytes: u64,
    /// Last timestamp handed out; stamps are strictly increasing so recency
    /// order never depends on clock resolution.
    last_stamp: Option<DateTime<Utc>>,
}

impl Inner {
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(prev) if now <= prev => prev + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.file_size_bytes).sum()
    }
}

pub struct CacheStore {
    inner: Mutex<Inner>,
    directory: PathBuf,
    index_path: PathBuf,
    max_files: usize,
    max_size_bytes: u64,
    notifier: Arc<dyn Notifier>,
}

impl CacheStore {
    /// Opens (or creates) the cache at `config.directory` and rehydrates the
    /// index. Entries whose file has disappeared are dropped.
    pub async fn open(config: &CacheConfig) -> Result<Self> {
        let directory = config.directory.clone();
        tokio::fs::create_dir_all(&directory).await?;
        let index_path = directory.join(INDEX_FILE);

        let mut inner = Inner::default();
        for entry in load_index(&index_path).await.entries {
            inner.entries.insert(entry.resource_id.clone(), entry);
        }
        inner.last_stamp = inner.entries.values().map(|e| e.last_accessed_at).max();

        let loaded = inner.entries.len();
        let purged = purge_missing_files(&mut inner).await;

        let store = Self {
            inner: Mutex::new(inner),
            directory,
            index_path,
            max_files: config.max_files,
            max_size_bytes: config.max_size_bytes,
            notifier: Arc::new(NullNotifier),
        };

        if purged > 0 {
            let inner = store.inner.lock().await;
            store.persist(&inner).await;
        }
        info!(
            "cache: opened {:?} ({} entries, {} dropped with missing files)",
            store.directory,
            loaded - purged,
            purged
        );
        Ok(store)
    }

    /// Report evictions and clears to `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the entry for `resource_id` if its file is still on disk, and
    /// marks it as the most recently used. A known entry whose file vanished
    /// is purged and reported as a miss.
    pub async fn lookup(&self, resource_id: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains_key(resource_id) {
            return None;
        }
        if !validate_entry(&mut inner, resource_id).await {
            self.persist(&inner).await;
            return None;
        }

        let stamp = inner.stamp();
        let entry = inner.entries.get_mut(resource_id)?;
        entry.last_accessed_at = stamp;
        let hit = entry.clone();
        self.persist(&inner).await;
        debug!("cache: hit {} -> {:?}", resource_id, hit.file_path);
        Some(hit)
    }

    /// Records a downloaded file and runs the eviction sweep.
    ///
    /// Returns false without touching the store if `file_path` does not
    /// exist. Inserting a key that is already cached is a successful no-op.
    /// Also returns false when the sweep had to evict the new entry itself
    /// (a single file larger than the byte ceiling).
    pub async fn insert(
        &self,
        resource_id: &str,
        title: &str,
        url: &str,
        file_path: &Path,
    ) -> bool {
        let file_size_bytes = match tokio::fs::metadata(file_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                warn!("cache: refusing insert of {}: {:?} is not a file", resource_id, file_path);
                return false;
            }
            Err(e) => {
                warn!("cache: refusing insert of {}: {:?}: {}", resource_id, file_path, e);
                return false;
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(resource_id) && validate_entry(&mut inner, resource_id).await
        {
            debug!("cache: {} already cached, insert is a no-op", resource_id);
            return true;
        }

        let now = inner.stamp();
        inner.entries.insert(
            resource_id.to_string(),
            CacheEntry {
                resource_id: resource_id.to_string(),
                title: title.to_string(),
                url: url.to_string(),
                file_path: file_path.to_path_buf(),
                file_size_bytes,
                cached_at: now,
                last_accessed_at: now,
            },
        );
        info!("cache: stored {} ({} bytes) at {:?}", resource_id, file_size_bytes, file_path);

        let outcome = self.sweep_locked(&mut inner).await;
        let survived = inner.entries.contains_key(resource_id);
        self.persist(&inner).await;
        let stats = self.stats_locked(&inner);
        drop(inner);

        if outcome.files > 0 {
            self.notify_evicted(&stats);
        }
        if !survived {
            warn!(
                "cache: {} ({} bytes) exceeds the cache size limit and was evicted immediately",
                resource_id, file_size_bytes
            );
        }
        survived
    }

    /// Marks `resource_id` as just used. Unknown keys are ignored.
    pub async fn touch(&self, resource_id: &str) {
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains_key(resource_id) {
            return;
        }
        let stamp = inner.stamp();
        if let Some(entry) = inner.entries.get_mut(resource_id) {
            entry.last_accessed_at = stamp;
        }
        self.persist(&inner).await;
    }

    pub async fn statistics(&self) -> CacheStatistics {
        let inner = self.inner.lock().await;
        self.stats_locked(&inner)
    }

    /// All entries, least recently accessed first.
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<CacheEntry> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });
        entries
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Runs the eviction sweep. Safe to call at any time; a store already
    /// within its limits is left untouched.
    pub async fn evict_if_over_limits(&self) -> EvictionOutcome {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        let outcome = self.sweep_locked(&mut inner).await;
        if inner.entries.len() != before {
            self.persist(&inner).await;
        }
        let stats = self.stats_locked(&inner);
        drop(inner);

        if outcome.files > 0 {
            self.notify_evicted(&stats);
        }
        outcome
    }

    /// Deletes every entry and its file. Per-file failures are logged and
    /// skipped. Returns the number of entries removed.
    pub async fn clear_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let entries: Vec<CacheEntry> = inner.entries.drain().map(|(_, e)| e).collect();
        let removed = entries.len();
        let mut bytes = 0u64;
        for entry in &entries {
            bytes += entry.file_size_bytes;
            remove_cache_file(&entry.file_path).await;
        }
        inner.last_evicted_files = removed;
        inner.last_evicted_bytes = bytes;
        self.persist(&inner).await;
        let stats = self.stats_locked(&inner);
        drop(inner);

        info!("cache: cleared {} entries ({} bytes)", removed, bytes);
        self.notify_evicted(&stats);
        removed
    }

    /// Periodically sweeps the cache until `cancel` fires.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("cache: automatic cleanup every {:?}", every);
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately; open() already purged.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = self.evict_if_over_limits().await;
                        debug!("cache: scheduled sweep evicted {} files", outcome.files);
                    }
                }
            }
            debug!("cache: cleanup task exiting");
        })
    }

    // ── internals ─────────────────────────────────────────────────────────────

    async fn sweep_locked(&self, inner: &mut Inner) -> EvictionOutcome {
        purge_missing_files(inner).await;

        let victims = select_victims(&inner.entries, self.max_files, self.max_size_bytes);
        if victims.is_empty() {
            return EvictionOutcome::default();
        }

        let mut outcome = EvictionOutcome::default();
        for id in victims {
            let Some(entry) = inner.entries.remove(&id) else {
                continue;
            };
            remove_cache_file(&entry.file_path).await;
            outcome.files += 1;
            outcome.bytes += entry.file_size_bytes;
            debug!("cache: evicted {} (last used {})", id, entry.last_accessed_at);
        }
        inner.last_evicted_files = outcome.files;
        inner.last_evicted_bytes = outcome.bytes;
        info!(
            "cache: evicted {} files ({} bytes); {} remain",
            outcome.files,
            outcome.bytes,
            inner.entries.len()
        );
        outcome
    }

    fn stats_locked(&self, inner: &Inner) -> CacheStatistics {
        CacheStatistics {
            total_files: inner.entries.len(),
            total_bytes: inner.total_bytes(),
            last_evicted_files: inner.last_evicted_files,
            last_evicted_bytes: inner.last_evicted_bytes,
            max_files: self.max_files,
            max_size_bytes: self.max_size_bytes,
        }
    }

    fn notify_evicted(&self, stats: &CacheStatistics) {
        if let Err(e) = self.notifier.on_cache_cleared_or_evicted(stats) {
            warn!("cache: eviction notifier failed: {}", e);
        }
    }

    /// Writes the index. Failures are logged: the in-memory store stays
    /// authoritative until the next successful write.
    async fn persist(&self, inner: &Inner) {
        let mut entries: Vec<&CacheEntry> = inner.entries.values().collect();
        entries.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        let json = match serde_json::to_string_pretty(&IndexRef { entries }) {
            Ok(json) => json,
            Err(e) => {
                warn!("cache: failed to serialise index: {}", e);
                return;
            }
        };

        let tmp = self.index_path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&tmp, json).await {
            warn!("cache: failed to write index {:?}: {}", tmp, e);
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.index_path).await {
            warn!("cache: failed to replace index {:?}: {}", self.index_path, e);
        }
    }
}

/// Picks the entries to evict, least recently accessed first.
///
/// Count ceiling first, then the byte ceiling over what the count pass left.
/// A limit of 0 disables that ceiling.
fn select_victims(
    entries: &HashMap<String, CacheEntry>,
    max_files: usize,
    max_size_bytes: u64,
) -> Vec<String> {
    let mut by_age: Vec<&CacheEntry> = entries.values().collect();
    by_age.sort_by(|a, b| {
        a.last_accessed_at
            .cmp(&b.last_accessed_at)
            .then_with(|| a.resource_id.cmp(&b.resource_id))
    });

    let mut marked: HashSet<&str> = HashSet::new();
    let mut victims = Vec::new();

    if max_files > 0 && by_age.len() > max_files {
        let excess = by_age.len() - max_files;
        for entry in by_age.iter().take(excess) {
            marked.insert(entry.resource_id.as_str());
            victims.push(entry.resource_id.clone());
        }
    }

    if max_size_bytes > 0 {
        let remaining: u64 = by_age
            .iter()
            .filter(|e| !marked.contains(e.resource_id.as_str()))
            .map(|e| e.file_size_bytes)
            .sum();
        if remaining > max_size_bytes {
            let excess = remaining - max_size_bytes;
            let mut freed = 0u64;
            for entry in by_age.iter().filter(|e| !marked.contains(e.resource_id.as_str())) {
                if freed >= excess {
                    break;
                }
                freed += entry.file_size_bytes;
                victims.push(entry.resource_id.clone());
            }
        }
    }

    victims
}

/// Keeps `id` only if its file still exists. Returns whether it survived.
/// Shared by lookup, insert, the sweep and startup so a vanished file is
/// handled the same way everywhere.
async fn validate_entry(inner: &mut Inner, id: &str) -> bool {
    let Some(path) = inner.entries.get(id).map(|e| e.file_path.clone()) else {
        return false;
    };
    if file_exists(&path).await {
        return true;
    }
    warn!("cache: file for {} vanished ({:?}), dropping entry", id, path);
    inner.entries.remove(id);
    false
}

async fn purge_missing_files(inner: &mut Inner) -> usize {
    let ids: Vec<String> = inner.entries.keys().cloned().collect();
    let mut purged = 0;
    for id in ids {
        if !validate_entry(inner, &id).await {
            purged += 1;
        }
    }
    purged
}

async fn file_exists(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file())
}

async fn remove_cache_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("cache: failed to delete {:?}: {}", path, e),
    }
}

async fn load_index(index_path: &Path) -> CacheIndex {
    let content = match tokio::fs::read_to_string(index_path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheIndex::default(),
        Err(e) => {
            warn!("cache: failed to read index {:?}: {}", index_path, e);
            return CacheIndex::default();
        }
    };
    match serde_json::from_str::<CacheIndex>(&content) {
        Ok(index) => index,
        Err(e) => {
            warn!("cache: index {:?} is corrupt, starting empty: {}", index_path, e);
            CacheIndex::default()
        }
    }
}
