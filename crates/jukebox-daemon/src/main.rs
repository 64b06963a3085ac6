mod mpv;
mod notifier;
mod socket;
mod ytdlp;

use jukebox_core::cache::CacheStatistics;
use jukebox_core::config::Config;
use jukebox_core::queue::EntryId;
use jukebox_core::service::Jukebox;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// Queue contents or player state changed; clients re-read the snapshot.
    QueueChanged,
    TitleResolved { entry_id: EntryId, title: String },
    CacheChanged(CacheStatistics),
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        // Only WARN and ERROR go to clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is OK
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = jukebox_core::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,jukebox_daemon=debug,jukebox_core=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let yt_dlp = jukebox_core::platform::find_yt_dlp_binary()
        .ok_or_else(|| anyhow::anyhow!("yt-dlp binary not found (set YT_DLP_PATH)"))?;
    info!("Using yt-dlp at {:?}", yt_dlp);

    let downloader = Arc::new(ytdlp::YtDlp::new(yt_dlp, config.cache.directory.clone()));
    let streamer = Arc::new(mpv::MpvStreamer::new(config.playback.default_volume));
    let notifier = Arc::new(notifier::BroadcastNotifier::new(broadcast_tx.clone()));

    let bind_address = config.daemon.bind_address.clone();
    let port = config.daemon.port;
    let jukebox = Arc::new(Jukebox::open(config, downloader, streamer.clone(), notifier).await?);

    let cancel = CancellationToken::new();
    let mut handles = jukebox.start_background(&cancel).await;
    handles.push(spawn_state_forwarder(&jukebox, broadcast_tx.clone(), cancel.clone()));
    handles.push(socket::start_server(
        bind_address,
        port,
        jukebox.clone(),
        broadcast_tx.clone(),
        cancel.clone(),
    ));

    info!("Daemon initialised, waiting for Ctrl-C");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    jukebox.stop().await;
    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    streamer.shutdown().await;

    Ok(())
}

/// Player state changes reach clients as queue refreshes.
fn spawn_state_forwarder(
    jukebox: &Jukebox,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut states = jukebox.player().subscribe_state();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let _ = broadcast_tx.send(BroadcastMessage::QueueChanged);
                }
            }
        }
    })
}
