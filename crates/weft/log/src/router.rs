use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use weft_types::{Event, TypePattern};

use crate::types::SubscriptionId;

struct Subscription {
    id: SubscriptionId,
    pattern: TypePattern,
    sender: mpsc::Sender<Event>,
}

/// Pushes newly appended events to subscribers whose pattern matches.
pub struct SubscriptionRouter {
    subscriptions: RwLock<Vec<Subscription>>,
    buffer: usize,
}

impl SubscriptionRouter {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    pub async fn subscribe(&self, pattern: TypePattern) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = SubscriptionId::new();
        debug!(subscription_id = ?id.0, pattern = %pattern, "New subscription registered");
        self.subscriptions.write().await.push(Subscription {
            id: id.clone(),
            pattern,
            sender,
        });
        (id, receiver)
    }

    /// Deliver events to matching subscribers without blocking the writer.
    /// Returns the number of deliveries.
    pub async fn route(&self, events: &[Event]) -> usize {
        let subs = self.subscriptions.read().await;
        let mut delivered = 0;
        let mut closed = Vec::new();

        for event in events {
            for sub in subs.iter().filter(|s| s.pattern.matches(&event.event_type)) {
                match sub.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            subscription_id = ?sub.id.0,
                            event_type = %event.event_type,
                            "Subscriber channel full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        if !closed.contains(&sub.id) {
                            closed.push(sub.id.clone());
                        }
                    }
                }
            }
        }
        drop(subs);

        if !closed.is_empty() {
            self.subscriptions
                .write()
                .await
                .retain(|s| !closed.contains(&s.id));
            debug!(removed = closed.len(), "Cleaned up closed subscriptions");
        }

        delivered
    }

    pub async fn unsubscribe(&self, id: &SubscriptionId) {
        self.subscriptions.write().await.retain(|s| s.id != *id);
        debug!(subscription_id = ?id.0, "Subscription removed");
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}
