use crate::BroadcastMessage;
use jukebox_core::cache::CacheStatistics;
use jukebox_core::collab::Notifier;
use jukebox_core::queue::EntryId;
use tokio::sync::broadcast;

/// Forwards background progress to every connected control client.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastNotifier {
    pub fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl Notifier for BroadcastNotifier {
    fn on_title_resolved(&self, entry_id: EntryId, title: &str) -> anyhow::Result<()> {
        // No receivers is OK: nobody is watching.
        let _ = self.sender.send(BroadcastMessage::TitleResolved {
            entry_id,
            title: title.to_string(),
        });
        Ok(())
    }

    fn on_cache_cleared_or_evicted(&self, stats: &CacheStatistics) -> anyhow::Result<()> {
        let _ = self.sender.send(BroadcastMessage::CacheChanged(stats.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jukebox_core::queue::QueueEntry;

    #[test]
    fn test_title_is_forwarded() {
        let (tx, mut rx) = broadcast::channel(4);
        let notifier = BroadcastNotifier::new(tx);
        let id = QueueEntry::new("https://a", "u").id;

        notifier.on_title_resolved(id, "Song").unwrap();
        match rx.try_recv() {
            Ok(BroadcastMessage::TitleResolved { entry_id, title }) => {
                assert_eq!(entry_id, id);
                assert_eq!(title, "Song");
            }
            other => panic!("expected TitleResolved, got {:?}", other),
        }
    }

    #[test]
    fn test_no_receivers_is_not_an_error() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        let notifier = BroadcastNotifier::new(tx);
        assert!(notifier
            .on_cache_cleared_or_evicted(&CacheStatistics::default())
            .is_ok());
    }
}
