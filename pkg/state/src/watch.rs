use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

use pkg_constants::state::WATCH_DEBOUNCE_MS;

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event representing a state mutation.
///
/// Events carry no value: consumers that care about content re-scan the
/// store, which also makes a lost event (broadcast lag) recoverable.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub key: String,
}

/// Fan-out point for state mutations. The store emits an event for every
/// put/delete; watch streams subscribe, usually filtered down to one key
/// prefix via [`EventLog::watch_prefix`].
#[derive(Clone)]
pub struct EventLog {
    sender: broadcast::Sender<WatchEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Record a mutation. Called by the store on every put/delete.
    pub fn emit(&self, event_type: EventType, key: String) {
        // A send with no subscribers is not an error.
        let _ = self.sender.send(WatchEvent { event_type, key });
    }

    /// Subscribe to the raw, unfiltered event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }

    /// Stream the events whose key starts with `prefix`.
    ///
    /// The returned channel closes when `quit` fires (a send or the sender
    /// dropping) or when the event log itself is gone. If the subscriber
    /// lags behind the broadcast buffer, a synthetic `Put` event for the
    /// prefix itself is delivered so consumers know to re-scan.
    pub fn watch_prefix(
        &self,
        prefix: String,
        mut quit: watch::Receiver<()>,
    ) -> mpsc::Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel(64);
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit.changed() => return,
                    result = events.recv() => {
                        let event = match result {
                            Ok(event) if event.key.starts_with(&prefix) => event,
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(_)) => WatchEvent {
                                event_type: EventType::Put,
                                key: prefix.clone(),
                            },
                            Err(broadcast::error::RecvError::Closed) => return,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Debounce helper shared by the watch streams: after a first event of a
/// burst has been received, wait out the window and drain whatever else
/// arrived so one re-scan covers the whole burst.
pub async fn drain_burst(events: &mut mpsc::Receiver<WatchEvent>) {
    tokio::time::sleep(Duration::from_millis(WATCH_DEBOUNCE_MS)).await;
    while events.try_recv().is_ok() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watch_prefix_filters_and_forwards() {
        let log = EventLog::new(64);
        let (_quit_tx, quit_rx) = watch::channel(());
        let mut rx = log.watch_prefix("/labels/".to_string(), quit_rx);

        log.emit(EventType::Put, "/daemon_sets/abc".to_string());
        log.emit(EventType::Put, "/labels/NODE/node1".to_string());
        log.emit(EventType::Delete, "/labels/NODE/node1".to_string());

        let first = rx.recv().await.expect("event");
        assert_eq!(first.key, "/labels/NODE/node1");
        assert_eq!(first.event_type, EventType::Put);

        let second = rx.recv().await.expect("event");
        assert_eq!(second.event_type, EventType::Delete);
    }

    #[tokio::test]
    async fn watch_prefix_closes_on_quit() {
        let log = EventLog::new(64);
        let (quit_tx, quit_rx) = watch::channel(());
        let mut rx = log.watch_prefix("/labels/".to_string(), quit_rx);

        drop(quit_tx);
        assert!(rx.recv().await.is_none());
    }
}
