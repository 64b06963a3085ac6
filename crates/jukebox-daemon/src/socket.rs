use crate::BroadcastMessage;
use jukebox_core::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use jukebox_core::service::Jukebox;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    jukebox: Arc<Jukebox>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let jukebox = jukebox.clone();
                    let bcast_tx = broadcast_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    let cancel = cancel.clone();

                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = handle_client(stream, jukebox, id, bcast_tx, bcast_rx) => {}
                        }
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
        info!("TCP server stopped");
    })
}

async fn handle_client(
    stream: TcpStream,
    jukebox: Arc<Jukebox>,
    client_id: usize,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current queue snapshot on connect
    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        queue: jukebox.snapshot().await,
    };
    if write_broadcast(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let total = match Message::frame_len(&read_buf) {
                                Ok(Some(total)) => total,
                                Ok(None) => break,
                                Err(e) => {
                                    // No way to find the next frame boundary.
                                    warn!("Client {} sent an unusable frame: {}", client_id, e);
                                    let _ = write_broadcast(
                                        &mut write_half,
                                        Broadcast::Error { message: e.to_string() },
                                    )
                                    .await;
                                    return;
                                }
                            };
                            let frame: Vec<u8> = read_buf.drain(..total).collect();

                            let reply = match Message::decode(&frame) {
                                Ok((Message::Command(cmd), _)) => {
                                    info!("Client {} sent command: {:?}", client_id, cmd);
                                    execute(&jukebox, cmd, &broadcast_tx).await
                                }
                                Ok((Message::Broadcast(_), _)) => Some(Broadcast::Error {
                                    message: "Only commands are accepted".to_string(),
                                }),
                                Err(e) => {
                                    warn!("Client {} sent an invalid command: {}", client_id, e);
                                    Some(Broadcast::Error {
                                        message: format!("Invalid command: {}", e),
                                    })
                                }
                            };
                            if let Some(reply) = reply {
                                if write_broadcast(&mut write_half, reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let broadcast = match msg {
                    Ok(BroadcastMessage::QueueChanged) => Broadcast::Queue {
                        queue: jukebox.snapshot().await,
                    },
                    Ok(BroadcastMessage::TitleResolved { entry_id, title }) => {
                        Broadcast::TitleResolved { entry_id, title }
                    }
                    Ok(BroadcastMessage::CacheChanged(stats)) => Broadcast::CacheStats { stats },
                    Ok(BroadcastMessage::Log(message)) => Broadcast::Log { message },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        Broadcast::Queue {
                            queue: jukebox.snapshot().await,
                        }
                    }
                    Err(_) => break,
                };
                if write_broadcast(&mut write_half, broadcast).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Runs one client command. Returns the reply for the sending client;
/// changes everyone should see go out on `broadcast_tx`.
pub async fn execute(
    jukebox: &Jukebox,
    cmd: Command,
    broadcast_tx: &broadcast::Sender<BroadcastMessage>,
) -> Option<Broadcast> {
    let queue_changed = || {
        let _ = broadcast_tx.send(BroadcastMessage::QueueChanged);
    };

    match cmd {
        Command::Enqueue {
            query,
            requester,
            play_next,
        } => match jukebox.request(&query, &requester, play_next).await {
            Ok(entry) => {
                queue_changed();
                Some(Broadcast::Enqueued { entry })
            }
            Err(e) => {
                warn!("Enqueue of '{}' failed: {}", query, e);
                Some(Broadcast::Error {
                    message: e.to_string(),
                })
            }
        },
        Command::Skip => {
            if jukebox.skip().await.is_none() {
                return Some(Broadcast::Error {
                    message: "Nothing is playing".to_string(),
                });
            }
            queue_changed();
            None
        }
        Command::Stop => {
            jukebox.stop().await;
            queue_changed();
            None
        }
        Command::Start => {
            if !jukebox.start().await {
                return Some(Broadcast::Error {
                    message: "Playback is already running".to_string(),
                });
            }
            queue_changed();
            None
        }
        Command::ClearQueue => {
            let removed = jukebox.clear_queue().await;
            info!("Cleared {} queued entries", removed);
            queue_changed();
            None
        }
        Command::GetQueue => Some(Broadcast::Queue {
            queue: jukebox.snapshot().await,
        }),
        Command::CacheStats => Some(Broadcast::CacheStats {
            stats: jukebox.cache_stats().await,
        }),
        // The cache notifier broadcasts the new statistics.
        Command::ClearCache => {
            jukebox.clear_cache().await;
            None
        }
    }
}

async fn write_broadcast<W>(writer: &mut W, broadcast: Broadcast) -> anyhow::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let encoded = Message::Broadcast(broadcast).encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jukebox_core::collab::{Downloader, NullNotifier, Streamer};
    use jukebox_core::config::Config;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct NoDownloads;

    #[async_trait]
    impl Downloader for NoDownloads {
        async fn download(&self, _url: &str) -> Option<PathBuf> {
            None
        }

        async fn get_title(&self, _url: &str) -> Option<String> {
            None
        }

        async fn search_first_url(&self, query: &str) -> Option<String> {
            (query == "lofi").then(|| "https://example.com/lofi.mp3".to_string())
        }
    }

    struct SilentStreamer(broadcast::Sender<()>);

    #[async_trait]
    impl Streamer for SilentStreamer {
        async fn play(&self, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn subscribe_completed(&self) -> broadcast::Receiver<()> {
            self.0.subscribe()
        }
    }

    async fn jukebox(dir: &TempDir) -> Jukebox {
        let mut config = Config::default();
        config.cache.directory = dir.path().to_path_buf();
        config.cache.auto_cleanup = false;
        Jukebox::open(
            config,
            Arc::new(NoDownloads),
            Arc::new(SilentStreamer(broadcast::channel(1).0)),
            Arc::new(NullNotifier),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_replies_and_broadcasts() {
        let dir = TempDir::new().unwrap();
        let jukebox = jukebox(&dir).await;
        let (tx, mut rx) = broadcast::channel(8);

        let reply = execute(
            &jukebox,
            Command::Enqueue {
                query: "lofi".into(),
                requester: "alice".into(),
                play_next: false,
            },
            &tx,
        )
        .await;

        match reply {
            Some(Broadcast::Enqueued { entry }) => assert_eq!(entry.url, "https://example.com/lofi.mp3"),
            other => panic!("expected Enqueued, got {:?}", other),
        }
        assert!(matches!(rx.try_recv(), Ok(BroadcastMessage::QueueChanged)));
    }

    #[tokio::test]
    async fn test_failed_search_replies_with_error() {
        let dir = TempDir::new().unwrap();
        let jukebox = jukebox(&dir).await;
        let (tx, mut rx) = broadcast::channel(8);

        let reply = execute(
            &jukebox,
            Command::Enqueue {
                query: "no hits".into(),
                requester: "alice".into(),
                play_next: false,
            },
            &tx,
        )
        .await;

        assert!(matches!(reply, Some(Broadcast::Error { .. })));
        assert!(rx.try_recv().is_err());
        assert!(jukebox.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_skip_with_nothing_playing_is_an_error() {
        let dir = TempDir::new().unwrap();
        let jukebox = jukebox(&dir).await;
        let (tx, _rx) = broadcast::channel(8);

        let reply = execute(&jukebox, Command::Skip, &tx).await;
        assert!(matches!(reply, Some(Broadcast::Error { .. })));
    }

    #[tokio::test]
    async fn test_get_queue_and_clear_queue() {
        let dir = TempDir::new().unwrap();
        let jukebox = jukebox(&dir).await;
        let (tx, _rx) = broadcast::channel(8);
        jukebox.request("https://example.com/a.mp3", "bob", false).await.unwrap();

        match execute(&jukebox, Command::GetQueue, &tx).await {
            Some(Broadcast::Queue { queue }) => assert_eq!(queue.pending.len(), 1),
            other => panic!("expected Queue, got {:?}", other),
        }
        assert!(execute(&jukebox, Command::ClearQueue, &tx).await.is_none());
        assert!(jukebox.queue().is_empty().await);
    }

    /// Serves one connection on an ephemeral port.
    async fn serve_one(jukebox: Arc<Jukebox>) -> std::net::SocketAddr {
        let (tx, _) = broadcast::channel(8);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let rx = tx.subscribe();
            handle_client(stream, jukebox, 1, tx, rx).await;
        });
        addr
    }

    /// Reads until `count` messages arrived, or the server hung up.
    async fn read_messages(client: &mut TcpStream, count: usize) -> (Vec<Message>, bool) {
        let mut buf = Vec::new();
        let mut received = Vec::new();
        let mut tmp = [0u8; 4096];
        while received.len() < count {
            let n = client.read(&mut tmp).await.unwrap();
            if n == 0 {
                return (received, true);
            }
            buf.extend_from_slice(&tmp[..n]);
            while let Ok((msg, used)) = Message::decode(&buf) {
                buf.drain(..used);
                received.push(msg);
            }
        }
        (received, false)
    }

    fn raw_frame(json: &[u8]) -> Vec<u8> {
        let mut frame = (json.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(json);
        frame
    }

    #[tokio::test]
    async fn test_client_gets_hello_then_reply() {
        let dir = TempDir::new().unwrap();
        let addr = serve_one(Arc::new(jukebox(&dir).await)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&Message::Command(Command::CacheStats).encode().unwrap())
            .await
            .unwrap();

        let (received, closed) = read_messages(&mut client, 2).await;
        assert!(!closed, "server closed early");
        assert!(matches!(
            received[0],
            Message::Broadcast(Broadcast::Hello { protocol_version: PROTOCOL_VERSION, .. })
        ));
        assert!(matches!(received[1], Message::Broadcast(Broadcast::CacheStats { .. })));
    }

    #[tokio::test]
    async fn test_unknown_command_is_answered_and_skipped() {
        let dir = TempDir::new().unwrap();
        let addr = serve_one(Arc::new(jukebox(&dir).await)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut bytes = raw_frame(br#"{"cmd":"Bogus"}"#);
        bytes.extend(Message::Command(Command::CacheStats).encode().unwrap());
        client.write_all(&bytes).await.unwrap();

        let (received, closed) = read_messages(&mut client, 3).await;
        assert!(!closed, "server closed early");
        assert!(matches!(received[1], Message::Broadcast(Broadcast::Error { .. })));
        assert!(matches!(received[2], Message::Broadcast(Broadcast::CacheStats { .. })));
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let dir = TempDir::new().unwrap();
        let addr = serve_one(Arc::new(jukebox(&dir).await)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let (received, closed) = read_messages(&mut client, 3).await;
        assert_eq!(received.len(), 2);
        assert!(matches!(received[1], Message::Broadcast(Broadcast::Error { .. })));
        assert!(closed);
    }
}
