/// mpv IPC driver with separated reader/writer tasks, exposed to the core as
/// a [`Streamer`].
///
/// Architecture:
///
/// ```text
///   MpvStreamer::play()
///         │ (spawns mpv on first use or after it died)
///         ├── writer_task   ← receives MpvRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event → event_pump → `end-file` (eof) → completed
/// ```
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use jukebox_core::collab::Streamer;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// True for `end-file` with reason `eof`. Stops, replacements and
    /// errors report other reasons.
    pub fn is_natural_end(&self) -> bool {
        self.event_name() == Some("end-file")
            && self.raw.get("reason").and_then(|r| r.as_str()) == Some("eof")
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load_file(&self, path: &Path, volume: f32) -> anyhow::Result<()> {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("non UTF-8 path {:?}", path))?;
        self.send(json!(["loadfile", path, "replace"])).await?;
        let vol_pct = (volume * 100.0).clamp(0.0, 100.0);
        let _ = self.send(json!(["set_property", "volume", vol_pct])).await;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    /// Health-check: returns Ok(()) if mpv is responsive.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.send(json!(["get_property", "volume"])).await?;
        Ok(())
    }
}

// ── process ───────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    volume: f32,
}

impl MpvDriver {
    pub fn new(volume: f32) -> Self {
        Self {
            socket_name: jukebox_core::platform::mpv_socket_name(),
            process: None,
            volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        info!("mpv: spawning new process");
        let mpv_binary = jukebox_core::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let ipc_arg = jukebox_core::platform::mpv_socket_arg();

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(&ipc_arg)
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process()?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel. Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── streamer ──────────────────────────────────────────────────────────────────

/// mpv as the jukebox output sink. The process is started lazily and
/// respawned if it has died since the last call.
pub struct MpvStreamer {
    driver: Mutex<MpvDriver>,
    handle: Mutex<Option<MpvHandle>>,
    volume: f32,
    completed: broadcast::Sender<()>,
}

impl MpvStreamer {
    pub fn new(volume: f32) -> Self {
        let (completed, _) = broadcast::channel(16);
        Self {
            driver: Mutex::new(MpvDriver::new(volume)),
            handle: Mutex::new(None),
            volume,
            completed,
        }
    }

    async fn connected(&self) -> anyhow::Result<MpvHandle> {
        let mut handle = self.handle.lock().await;
        let mut driver = self.driver.lock().await;
        if let Some(h) = handle.as_ref() {
            if driver.process_alive() && h.ping().await.is_ok() {
                return Ok(h.clone());
            }
            warn!("mpv: process gone or unresponsive, respawning");
        }

        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(64);
        let fresh = driver.spawn_and_connect(event_tx).await?;
        tokio::spawn(event_pump(event_rx, self.completed.clone()));
        *handle = Some(fresh.clone());
        Ok(fresh)
    }

    pub async fn shutdown(&self) {
        if let Some(h) = self.handle.lock().await.take() {
            let _ = h.send(json!(["quit"])).await;
        }
        self.driver.lock().await.kill().await;
        info!("mpv: shut down");
    }
}

#[async_trait]
impl Streamer for MpvStreamer {
    async fn play(&self, path: &Path) -> anyhow::Result<()> {
        let handle = self.connected().await?;
        handle.load_file(path, self.volume).await?;
        debug!("mpv: loaded {:?}", path);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        // Nothing to stop if mpv was never started.
        let handle = self.handle.lock().await.clone();
        if let Some(h) = handle {
            h.stop().await?;
        }
        Ok(())
    }

    fn subscribe_completed(&self) -> broadcast::Receiver<()> {
        self.completed.subscribe()
    }
}

/// Turns natural `end-file` events into completion signals. Ends with the
/// connection.
async fn event_pump(mut events: mpsc::Receiver<MpvEvent>, completed: broadcast::Sender<()>) {
    while let Some(event) = events.recv().await {
        if event.is_natural_end() {
            debug!("mpv: track finished");
            let _ = completed.send(());
        }
    }
    debug!("mpv: event pump exiting");
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let _ = tx.send(response_result(req_id, val));
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, &format!("mpv IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

fn response_result(req_id: u64, val: Value) -> anyhow::Result<Value> {
    if val["error"].as_str() == Some("success") {
        debug!("mpv reader: response req={} ok", req_id);
        Ok(val)
    } else {
        let err = val["error"].as_str().unwrap_or("unknown error").to_string();
        debug!("mpv reader: response req={} err={}", req_id, err);
        Err(anyhow::anyhow!("mpv error: {}", err))
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    #[test]
    fn test_only_eof_counts_as_natural_end() {
        assert!(event(json!({"event": "end-file", "reason": "eof"})).is_natural_end());
        assert!(!event(json!({"event": "end-file", "reason": "stop"})).is_natural_end());
        assert!(!event(json!({"event": "end-file", "reason": "error"})).is_natural_end());
        assert!(!event(json!({"event": "start-file"})).is_natural_end());
    }

    #[test]
    fn test_response_result() {
        assert!(response_result(1, json!({"error": "success", "data": 50})).is_ok());
        let err = response_result(2, json!({"error": "property unavailable"})).unwrap_err();
        assert!(err.to_string().contains("property unavailable"));
    }

    /// Drives the IO tasks over an in-memory pipe standing in for mpv.
    #[tokio::test]
    async fn test_io_tasks_route_responses_and_events() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (event_tx, event_rx) = mpsc::channel(8);
        let handle = start_io_tasks(client_read, client_write, event_tx);

        let (completed, mut completed_rx) = broadcast::channel(4);
        tokio::spawn(event_pump(event_rx, completed));

        let fake_mpv = tokio::spawn(async move {
            let (server_read, mut server_write) = tokio::io::split(server);
            let mut lines = BufReader::new(server_read).lines();
            let request = lines.next_line().await.unwrap().unwrap();
            let request: Value = serde_json::from_str(&request).unwrap();
            assert_eq!(request["command"], json!(["stop"]));
            let reply = json!({"request_id": request["request_id"], "error": "success"});
            server_write
                .write_all(format!("{}\n{}\n", reply, json!({"event": "end-file", "reason": "eof"})).as_bytes())
                .await
                .unwrap();
        });

        handle.stop().await.unwrap();
        fake_mpv.await.unwrap();
        let done = tokio::time::timeout(std::time::Duration::from_secs(2), completed_rx.recv()).await;
        assert!(matches!(done, Ok(Ok(()))));
    }
}
