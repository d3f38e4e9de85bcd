use model::events::Event;
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// A subscription handle that can be used to unsubscribe from events.
#[derive(Debug, Clone)]
pub struct Subscription {
    event_type_id: TypeId,
    subscriber_id: u64,
}

type Subscribers = HashMap<TypeId, HashMap<u64, Box<dyn Any + Send + Sync>>>;

/// Typed publish/subscribe channel for lifecycle events.
///
/// The bus is constructed explicitly and passed to whoever publishes. After
/// [`EventBus::terminate`] every subscription is dropped and later publishes
/// are discarded. Publishing never fails: a full or closed subscriber channel
/// is logged and skipped.
#[derive(Clone)]
pub struct EventBus {
    // Map of Event TypeID -> (Map of SubscriberID -> Sender)
    subscribers: Arc<RwLock<Subscribers>>,
    next_id: Arc<AtomicU64>,
    terminated: Arc<AtomicBool>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub async fn subscribe<E>(&self, sender: mpsc::Sender<Arc<E>>) -> Subscription
    where
        E: Event + Clone,
    {
        let event_type_id = TypeId::of::<E>();
        let subscriber_id = self.next_id.fetch_add(1, Ordering::AcqRel);

        if self.is_terminated() {
            warn!(
                event_type = std::any::type_name::<E>(),
                "Subscription on a terminated event bus is ignored"
            );
        } else {
            self.subscribers
                .write()
                .await
                .entry(event_type_id)
                .or_default()
                .insert(subscriber_id, Box::new(sender));

            debug!(
                event_type = std::any::type_name::<E>(),
                subscriber_id = subscriber_id,
                "Subscribed to event"
            );
        }

        Subscription {
            event_type_id,
            subscriber_id,
        }
    }

    pub async fn publish<E>(&self, event: E)
    where
        E: Event + Clone,
    {
        if self.is_terminated() {
            debug!(
                event_type = event.event_type(),
                "Event bus terminated, dropping event"
            );
            return;
        }

        let event_type_id = TypeId::of::<E>();
        let event_arc = Arc::new(event);
        let subscribers = self.subscribers.read().await;

        let Some(type_subscribers) = subscribers.get(&event_type_id) else {
            debug!(event_type = event_arc.event_type(), "No subscribers for event");
            return;
        };

        debug!(
            event_type = event_arc.event_type(),
            subscriber_count = type_subscribers.len(),
            "Publishing event"
        );

        for (subscriber_id, boxed_sender) in type_subscribers.iter() {
            let Some(sender) = boxed_sender.downcast_ref::<mpsc::Sender<Arc<E>>>() else {
                warn!(
                    event_type = event_arc.event_type(),
                    subscriber_id = subscriber_id,
                    "Failed to downcast sender for subscriber"
                );
                continue;
            };

            // try_send is non-blocking; a slow subscriber loses the event.
            if let Err(e) = sender.try_send(event_arc.clone()) {
                warn!(
                    event_type = event_arc.event_type(),
                    subscriber_id = subscriber_id,
                    error = %e,
                    "Dropped event for subscriber"
                );
            }
        }
    }

    pub async fn unsubscribe(&self, subscription: Subscription) {
        let mut subscribers = self.subscribers.write().await;

        if let Some(type_subscribers) = subscribers.get_mut(&subscription.event_type_id) {
            type_subscribers.remove(&subscription.subscriber_id);

            debug!(
                subscriber_id = subscription.subscriber_id,
                "Unsubscribed from event"
            );

            if type_subscribers.is_empty() {
                subscribers.remove(&subscription.event_type_id);
            }
        }
    }

    pub async fn subscriber_count<E>(&self) -> usize
    where
        E: Event,
    {
        let subscribers = self.subscribers.read().await;
        subscribers
            .get(&TypeId::of::<E>())
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Drops every subscription and stops accepting events. Subscribers see
    /// their channel close once the last sender is gone.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscribers.write().await.clear();
        info!("Event bus terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::events::migration::{MigrationEndpoints, MigrationStarted};

    fn started() -> MigrationStarted {
        MigrationStarted {
            endpoints: MigrationEndpoints {
                task_id: "t1".into(),
                source: "memory://a".into(),
                target: "memory://b".into(),
            },
            message_key: "migration.started".into(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_to_typed_subscribers() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::channel(4);
        bus.subscribe::<MigrationStarted>(tx).await;

        bus.publish(started()).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.endpoints.task_id, "t1");
    }

    #[tokio::test]
    async fn full_channel_does_not_block_publisher() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::channel(1);
        bus.subscribe::<MigrationStarted>(tx).await;

        bus.publish(started()).await;
        bus.publish(started()).await;
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminate_closes_subscriptions() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::channel(4);
        bus.subscribe::<MigrationStarted>(tx).await;
        assert_eq!(bus.subscriber_count::<MigrationStarted>().await, 1);

        bus.terminate().await;
        bus.publish(started()).await;

        assert!(bus.is_terminated());
        assert_eq!(bus.subscriber_count::<MigrationStarted>().await, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_sender() {
        let bus = EventBus::new();
        let (tx, _rx) = mpsc::channel::<Arc<MigrationStarted>>(4);
        let subscription = bus.subscribe(tx).await;

        bus.unsubscribe(subscription).await;
        assert_eq!(bus.subscriber_count::<MigrationStarted>().await, 0);
    }
}
