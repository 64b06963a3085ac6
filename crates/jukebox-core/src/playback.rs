//! Drives the output sink from the front of the queue.
//!
//! Per cycle:
//!
//! ```text
//!   Idle ─dequeue─► WaitingForDownload ─file ready─► Playing ─┬─ completed ─► Completed ─┐
//!    ▲                    │ timeout / skipped                 ├─ slot cleared ► Skipped ──┤
//!    │                    ▼                                   └─ safety timeout (warn) ───┤
//!    └──────────────── entry abandoned, current cleared ◄─────────────────────────────────┘
//! ```
//!
//! A skip or stop is detected by the current slot no longer holding the entry
//! being played; the streamer's completion event is the natural end.

use crate::collab::Streamer;
use crate::config::PlaybackConfig;
use crate::queue::{EntryId, QueueEntry, SongQueue};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_ERROR_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    #[default]
    Idle,
    WaitingForDownload,
    Playing,
    Completed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    /// Sleep between dequeue attempts on an empty queue.
    pub idle_poll: Duration,
    /// Poll interval for file readiness and for skip detection.
    pub ready_poll: Duration,
    pub ready_timeout: Duration,
    pub max_track_duration: Duration,
    /// Pause after a cycle blew up.
    pub error_pause: Duration,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self::from(&PlaybackConfig::default())
    }
}

impl From<&PlaybackConfig> for PlaybackSettings {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            idle_poll: Duration::from_millis(500),
            ready_poll: Duration::from_millis(250),
            ready_timeout: config.ready_timeout(),
            max_track_duration: config.max_track_duration(),
            error_pause: DEFAULT_ERROR_PAUSE,
        }
    }
}

enum Ready {
    Path(PathBuf),
    TimedOut,
    Skipped,
    Cancelled,
}

enum End {
    Completed,
    Skipped,
    TimedOut,
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
enum Cycle {
    Idle,
    Continue,
    Cancelled,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PlaybackDriver {
    queue: Arc<SongQueue>,
    streamer: Arc<dyn Streamer>,
    settings: PlaybackSettings,
    state: watch::Sender<PlaybackState>,
    running: Mutex<Option<Running>>,
}

impl PlaybackDriver {
    pub fn new(
        queue: Arc<SongQueue>,
        streamer: Arc<dyn Streamer>,
        settings: PlaybackSettings,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(PlaybackState::Idle);
        Arc::new(Self {
            queue,
            streamer,
            settings,
            state,
            running: Mutex::new(None),
        })
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    /// Starts the playback loop. Returns false (and does nothing) if it is
    /// already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().map(|r| !r.handle.is_finished()).unwrap_or(false) {
            debug!("playback: start ignored, loop already running");
            return false;
        }
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.run(token).await });
        *running = Some(Running { cancel, handle });
        info!("playback: loop started");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancels the loop, waits for it to exit, stops the streamer and clears
    /// the current slot.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                warn!("playback: loop ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.streamer.stop().await {
            warn!("playback: streamer stop failed: {}", e);
        }
        self.queue.clear_current().await;
        self.state.send_replace(PlaybackState::Idle);
        info!("playback: stopped");
    }

    /// Stops the current track; the loop moves on to the next entry.
    /// Returns the entry that was playing, if any.
    pub async fn skip(&self) -> Option<QueueEntry> {
        if let Err(e) = self.streamer.stop().await {
            warn!("playback: streamer stop failed: {}", e);
        }
        let skipped = self.queue.take_current().await;
        if let Some(entry) = &skipped {
            info!("playback: skipped {} '{}'", entry.id, entry.title);
        }
        skipped
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let this = Arc::clone(&self);
            let token = cancel.clone();
            match tokio::spawn(async move { this.cycle(&token).await }).await {
                Ok(Cycle::Cancelled) => break,
                Ok(Cycle::Idle) | Ok(Cycle::Continue) => {}
                Err(e) => {
                    error!("playback: cycle failed: {}", e);
                    // Whatever the cycle was holding is abandoned.
                    self.queue.clear_current().await;
                    self.state.send_replace(PlaybackState::Idle);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.error_pause) => {}
                    }
                }
            }
        }
        debug!("playback: loop exiting");
    }

    async fn cycle(&self, cancel: &CancellationToken) -> Cycle {
        let Some(entry) = self.queue.dequeue_front().await else {
            self.state.send_if_modified(|state| {
                let changed = *state != PlaybackState::Idle;
                *state = PlaybackState::Idle;
                changed
            });
            return tokio::select! {
                _ = cancel.cancelled() => Cycle::Cancelled,
                _ = tokio::time::sleep(self.settings.idle_poll) => Cycle::Idle,
            };
        };

        self.queue.set_current(Some(entry.clone())).await;
        self.state.send_replace(PlaybackState::WaitingForDownload);
        debug!("playback: waiting for {} ({})", entry.id, entry.url);

        let path = match self.wait_until_ready(entry.id, cancel).await {
            Ready::Path(path) => path,
            Ready::TimedOut => {
                warn!(
                    "playback: {} '{}' not ready after {:?}, dropping it",
                    entry.id, entry.title, self.settings.ready_timeout
                );
                self.finish(entry.id, PlaybackState::Idle).await;
                return Cycle::Continue;
            }
            Ready::Skipped => {
                self.finish(entry.id, PlaybackState::Skipped).await;
                return Cycle::Continue;
            }
            Ready::Cancelled => return Cycle::Cancelled,
        };

        // Subscribe before play so a very short track cannot finish unseen.
        let mut completed = self.streamer.subscribe_completed();
        if let Err(e) = self.streamer.play(&path).await {
            error!("playback: failed to play {:?}: {}", path, e);
            self.finish(entry.id, PlaybackState::Idle).await;
            return Cycle::Continue;
        }
        self.state.send_replace(PlaybackState::Playing);
        let title = self
            .queue
            .current()
            .await
            .map(|e| e.title)
            .unwrap_or(entry.title);
        info!("playback: playing {} '{}'", entry.id, title);

        match self.wait_for_end(entry.id, &mut completed, cancel).await {
            End::Completed => {
                debug!("playback: {} completed", entry.id);
                self.finish(entry.id, PlaybackState::Completed).await;
            }
            End::Skipped => {
                debug!("playback: {} skipped or stopped", entry.id);
                self.finish(entry.id, PlaybackState::Skipped).await;
            }
            End::TimedOut => {
                warn!(
                    "playback: {} still playing after {:?}, moving on",
                    entry.id, self.settings.max_track_duration
                );
                self.finish(entry.id, PlaybackState::Completed).await;
            }
            End::Cancelled => return Cycle::Cancelled,
        }
        Cycle::Continue
    }

    /// Ends a cycle. The terminal state stays visible until the next
    /// dequeue (or an empty queue resets it to `Idle`).
    async fn finish(&self, id: EntryId, terminal: PlaybackState) {
        self.queue.clear_current_if(id).await;
        self.state.send_replace(terminal);
    }

    async fn wait_until_ready(&self, id: EntryId, cancel: &CancellationToken) -> Ready {
        let deadline = Instant::now() + self.settings.ready_timeout;
        loop {
            match self.queue.current().await {
                Some(current) if current.id == id => {
                    if current.is_ready().await {
                        if let Some(path) = current.file_path {
                            return Ready::Path(path);
                        }
                    }
                }
                _ => return Ready::Skipped,
            }
            if Instant::now() >= deadline {
                return Ready::TimedOut;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ready::Cancelled,
                _ = tokio::time::sleep(self.settings.ready_poll) => {}
            }
        }
    }

    async fn wait_for_end(
        &self,
        id: EntryId,
        completed: &mut broadcast::Receiver<()>,
        cancel: &CancellationToken,
    ) -> End {
        let deadline = tokio::time::sleep(self.settings.max_track_duration);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.settings.ready_poll);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return End::Cancelled,
                _ = &mut deadline => return End::TimedOut,
                event = completed.recv() => match event {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => return End::Completed,
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("playback: streamer completion channel closed");
                        return End::Completed;
                    }
                },
                _ = poll.tick() => {
                    if self.queue.current().await.map(|e| e.id) != Some(id) {
                        return End::Skipped;
                    }
                }
            }
        }
    }
}
