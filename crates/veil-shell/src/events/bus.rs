//! Broadcast channel shared by all shell components.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::Stream;
use tracing::{debug, warn};

use super::types::ShellEvent;

/// Multi-subscriber event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ShellEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers it reached;
    /// publishing with nobody listening is not an error.
    pub fn publish(&self, event: ShellEvent) -> usize {
        if let Ok(count) = self.tx.send(event) {
            debug!(receivers = count, "Event published");
            count
        } else {
            debug!("No receivers for event");
            0
        }
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Subscribe to the lifecycle events of one download.
    ///
    /// The stream ends after the terminal `download-completed` event.
    pub fn subscribe_download(&self, download_id: &str) -> impl Stream<Item = ShellEvent> + use<> {
        let mut rx = self.tx.subscribe();
        let download_id = download_id.to_string();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.download_id() != Some(download_id.as_str()) {
                            continue;
                        }
                        let terminal = event.is_terminal_download_event();
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(download_id = %download_id, skipped, "Download subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Notice;

    fn notice(title: &str) -> ShellEvent {
        ShellEvent::Notice(Notice {
            title: title.to_string(),
            body: String::new(),
        })
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(notice("nobody")), 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(notice("hello")), 2);
        assert_eq!(a.recv().await.unwrap(), notice("hello"));
        assert_eq!(b.recv().await.unwrap(), notice("hello"));
    }

    #[test]
    fn event_serializes_with_kebab_case_tag() {
        let json = serde_json::to_value(notice("Download Complete")).unwrap();
        assert_eq!(json["type"], "notice");
        assert_eq!(json["title"], "Download Complete");
    }
}
