//! Pending playback requests plus the single "current" slot.
//!
//! One coarse lock guards both. `enqueue` / `enqueue_front` publish
//! [`QueueEvent::SongAdded`] on a broadcast channel before returning; a slow
//! or vanished subscriber can only lose events, never corrupt the queue.

use crate::resource::LOADING_TITLE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique id of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    fn next() -> Self {
        Self(NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One accepted playback request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    /// Starts as a placeholder; replaced once the real title is known.
    pub title: String,
    /// Source URL. Never changes after creation.
    pub url: String,
    /// Local audio file, set once downloaded (or found in the cache).
    pub file_path: Option<PathBuf>,
    pub requester: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// New entry with the loading placeholder as its title.
    pub fn new(url: impl Into<String>, requester: impl Into<String>) -> Self {
        Self::with_title(LOADING_TITLE, url, requester)
    }

    pub fn with_title(
        title: impl Into<String>,
        url: impl Into<String>,
        requester: impl Into<String>,
    ) -> Self {
        Self {
            id: EntryId::next(),
            title: title.into(),
            url: url.into(),
            file_path: None,
            requester: requester.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// True when the file path is set and the file is on disk.
    pub async fn is_ready(&self) -> bool {
        match &self.file_path {
            Some(path) => tokio::fs::metadata(path)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false),
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    SongAdded(QueueEntry),
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<QueueEntry>,
    current: Option<QueueEntry>,
}

pub struct SongQueue {
    inner: Mutex<Inner>,
    events: broadcast::Sender<QueueEvent>,
}

impl Default for SongQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SongQueue {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Receives every subsequent `SongAdded`. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Appends to the back of the queue.
    pub async fn enqueue(&self, entry: QueueEntry) {
        let mut inner = self.inner.lock().await;
        debug!("queue: enqueue {} {}", entry.id, entry.url);
        inner.pending.push_back(entry.clone());
        drop(inner);
        self.publish(entry);
    }

    /// Puts `entry` ahead of everything pending ("play next").
    pub async fn enqueue_front(&self, entry: QueueEntry) {
        let mut inner = self.inner.lock().await;
        debug!("queue: enqueue_front {} {}", entry.id, entry.url);
        inner.pending.push_front(entry.clone());
        drop(inner);
        self.publish(entry);
    }

    pub async fn peek_front(&self) -> Option<QueueEntry> {
        self.inner.lock().await.pending.front().cloned()
    }

    pub async fn dequeue_front(&self) -> Option<QueueEntry> {
        self.inner.lock().await.pending.pop_front()
    }

    /// Pending entries in playback order.
    pub async fn list(&self) -> Vec<QueueEntry> {
        self.inner.lock().await.pending.iter().cloned().collect()
    }

    /// Drops every pending entry (the current slot is untouched). Returns
    /// how many were removed.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let removed = inner.pending.len();
        inner.pending.clear();
        removed
    }

    /// Removes one pending entry.
    pub async fn remove(&self, id: EntryId) -> Option<QueueEntry> {
        let mut inner = self.inner.lock().await;
        let pos = inner.pending.iter().position(|e| e.id == id)?;
        inner.pending.remove(pos)
    }

    pub async fn current(&self) -> Option<QueueEntry> {
        self.inner.lock().await.current.clone()
    }

    pub async fn set_current(&self, entry: Option<QueueEntry>) {
        self.inner.lock().await.current = entry;
    }

    pub async fn take_current(&self) -> Option<QueueEntry> {
        self.inner.lock().await.current.take()
    }

    pub async fn clear_current(&self) {
        self.inner.lock().await.current = None;
    }

    /// Clears the current slot only if it still holds `id`, so a late
    /// cleanup cannot wipe out a newer entry.
    pub async fn clear_current_if(&self, id: EntryId) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.current.as_ref().map(|e| e.id) == Some(id) {
            inner.current = None;
            true
        } else {
            false
        }
    }

    /// Current entry (if any) followed by the pending entries, taken under
    /// one lock.
    pub async fn snapshot(&self) -> (Option<QueueEntry>, Vec<QueueEntry>) {
        let inner = self.inner.lock().await;
        (inner.current.clone(), inner.pending.iter().cloned().collect())
    }

    /// Applies `f` to the entry with `id`, whether it is pending or current.
    /// Returns false when the entry is gone.
    pub async fn update<F>(&self, id: EntryId, f: F) -> bool
    where
        F: FnOnce(&mut QueueEntry),
    {
        let mut inner = self.inner.lock().await;
        let Inner { pending, current } = &mut *inner;
        let target = current
            .as_mut()
            .filter(|e| e.id == id)
            .or_else(|| pending.iter_mut().find(|e| e.id == id));
        match target {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Applies `f` to every entry (pending or current) matching `pred`.
    /// Returns the ids of the entries it touched.
    pub async fn update_matching<P, F>(&self, pred: P, mut f: F) -> Vec<EntryId>
    where
        P: Fn(&QueueEntry) -> bool,
        F: FnMut(&mut QueueEntry),
    {
        let mut inner = self.inner.lock().await;
        let Inner { pending, current } = &mut *inner;
        let mut touched = Vec::new();
        for entry in current.iter_mut().chain(pending.iter_mut()) {
            if pred(entry) {
                f(entry);
                touched.push(entry.id);
            }
        }
        touched
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.pending.is_empty()
    }

    fn publish(&self, entry: QueueEntry) {
        // No receivers is fine: the fetch loop still finds the entry by polling.
        let _ = self.events.send(QueueEvent::SongAdded(entry));
    }
}
