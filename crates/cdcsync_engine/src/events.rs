//! Publish-and-wait event delivery.

use crate::error::{SyncError, SyncResult};
use cdcsync_protocol::{ChangeList, Snapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const SUBSCRIBER_CAPACITY: usize = 8;

/// Something subscribers must process before the publisher moves on.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A snapshot became current.
    Snapshot(Arc<Snapshot>),
    /// A batch of changes must be applied.
    Changes(Arc<ChangeList>),
}

impl SyncEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Snapshot(_) => "snapshot",
            SyncEvent::Changes(_) => "changes",
        }
    }
}

/// An event handed to one subscriber, with the channel to acknowledge it.
#[derive(Debug)]
pub struct Delivery {
    /// The event.
    pub event: SyncEvent,
    /// Acknowledgment; send the processing result.
    pub ack: oneshot::Sender<SyncResult<()>>,
}

impl Delivery {
    /// Acknowledges the delivery.
    pub fn acknowledge(self, result: SyncResult<()>) {
        let _ = self.ack.send(result);
    }
}

/// Fan-out bus where the publisher waits for every subscriber.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Delivery>>>>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber.
    pub fn subscribe(&self) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Delivers `event` to every subscriber and waits for all to acknowledge.
    ///
    /// Returns the first subscriber error. Not hearing back from every
    /// subscriber within `timeout` is `SubscriberTimeout`. Subscribers whose
    /// receiver has been dropped are removed.
    pub async fn publish(&self, event: SyncEvent, timeout: Duration) -> SyncResult<()> {
        let subscribers: Vec<_> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|tx| !tx.is_closed());
            subscribers.clone()
        };
        debug!(kind = event.kind(), subscribers = subscribers.len(), "publishing");

        let deliver_all = async {
            let mut pending = Vec::with_capacity(subscribers.len());
            for tx in &subscribers {
                let (ack, rx) = oneshot::channel();
                let delivery = Delivery {
                    event: event.clone(),
                    ack,
                };
                if tx.send(delivery).await.is_err() {
                    warn!("subscriber went away before delivery");
                    continue;
                }
                pending.push(rx);
            }

            let mut first_error = None;
            for rx in pending {
                match rx.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                    Err(_) => warn!("subscriber dropped a delivery without acknowledging"),
                }
            }
            first_error.map_or(Ok(()), Err)
        };

        match tokio::time::timeout(timeout, deliver_all).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::SubscriberTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes() -> SyncEvent {
        SyncEvent::Changes(Arc::new(ChangeList::new("", "1", Vec::new())))
    }

    #[tokio::test]
    async fn waits_for_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        tokio::spawn(async move {
            while let Some(d) = a.recv().await {
                d.acknowledge(Ok(()));
            }
        });
        tokio::spawn(async move {
            while let Some(d) = b.recv().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
                d.acknowledge(Ok(()));
            }
        });
        bus.publish(changes(), Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn returns_subscriber_error() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Some(d) = rx.recv().await {
                d.acknowledge(Err(SyncError::RowNotFound { table: "t".into() }));
            }
        });
        let err = bus.publish(changes(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SyncError::RowNotFound { .. }));
    }

    #[tokio::test]
    async fn silent_subscriber_times_out() {
        let bus = EventBus::new();
        let _rx = bus.subscribe();
        let err = bus
            .publish(changes(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SubscriberTimeout));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(changes(), Duration::from_millis(20)).await.unwrap();
    }
}
