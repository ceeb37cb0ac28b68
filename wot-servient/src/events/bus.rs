//! Per-Thing event multicast

use tokio::sync::broadcast;

use super::observer::{finalize, Observer, Subscription};
use super::{EmittedEvent, EventKind, EVENT_PROPERTY_CHANGE};

/// Capacity of the underlying broadcast channel. Subscribers that lag
/// behind lose the oldest events instead of blocking emitters.
const BUS_CAPACITY: usize = 256;

/// Multi-producer multi-consumer subject of [`EmittedEvent`] values.
///
/// Subscriptions are cold: a subscriber only receives events emitted after
/// it subscribed. Delivery to a single subscriber is sequential.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EmittedEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Emits an event, stamping it with the current time. Events emitted
    /// with no active subscriber are dropped.
    pub fn emit(&self, kind: EventKind) -> EmittedEvent {
        let event = EmittedEvent::new(kind);
        let _ = self.tx.send(event.clone());
        event
    }

    /// Raw receiver for consumers that manage their own loop (long-poll
    /// handlers, binding publishers).
    pub fn receiver(&self) -> broadcast::Receiver<EmittedEvent> {
        self.tx.subscribe()
    }

    /// Subscribes an observer through a filter predicate. The forwarding
    /// task runs until the subscription is disposed (terminal `complete`)
    /// or the bus is dropped.
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&EmittedEvent) -> bool + Send + 'static,
        observer: Observer,
    ) -> Subscription {
        let subscription = Subscription::new();
        let token = subscription.token();
        let mut rx = self.tx.subscribe();

        let task_observer = observer.clone();
        tokio::spawn(finalize(observer, async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if filter(&event) {
                                task_observer.next(event);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Event subscriber lagged; dropping events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    },
                }
            }
        }));

        subscription
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter matching events by name
pub fn event_name_filter(name: impl Into<String>) -> impl Fn(&EmittedEvent) -> bool {
    let name = name.into();
    move |event| event.name() == name
}

/// Filter matching property change events for one property
pub fn property_change_filter(property: impl Into<String>) -> impl Fn(&EmittedEvent) -> bool {
    let property = property.into();
    move |event| {
        event.name() == EVENT_PROPERTY_CHANGE
            && matches!(&event.kind, EventKind::PropertyChange { name, .. } if *name == property)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_subscribers_only_see_later_events() {
        let bus = EventBus::new();

        bus.emit(EventKind::Custom {
            name: "early".into(),
            payload: None,
        });

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let sub = bus.subscribe_filtered(
            |_| true,
            Observer::new(move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        settle().await;

        bus.emit(EventKind::Custom {
            name: "late".into(),
            payload: None,
        });
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        sub.dispose();
    }

    #[tokio::test]
    async fn test_property_filter_selects_single_property() {
        let bus = EventBus::new();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let sub = bus.subscribe_filtered(
            property_change_filter("temperature"),
            Observer::new(move |event| {
                if let EventKind::PropertyChange { value, .. } = &event.kind {
                    assert_eq!(*value, json!(21.5));
                }
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        settle().await;

        bus.emit(EventKind::PropertyChange {
            name: "temperature".into(),
            value: json!(21.5),
        });
        bus.emit(EventKind::PropertyChange {
            name: "humidity".into(),
            value: json!(40),
        });
        bus.emit(EventKind::Custom {
            name: "temperature".into(),
            payload: None,
        });
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        sub.dispose();
    }

    #[tokio::test]
    async fn test_dispose_completes_subscription() {
        let bus = EventBus::new();

        let completed = Arc::new(AtomicUsize::new(0));
        let completed_clone = completed.clone();
        let sub = bus.subscribe_filtered(
            |_| true,
            Observer::with_callbacks(
                |_| {},
                move || {
                    completed_clone.fetch_add(1, Ordering::SeqCst);
                },
                |_| {},
            ),
        );
        settle().await;

        sub.dispose();
        sub.dispose();
        settle().await;

        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive_once() {
        let bus = EventBus::new();

        let mut counters = Vec::new();
        let mut subs = Vec::new();
        for _ in 0..3 {
            let count = Arc::new(AtomicUsize::new(0));
            let count_clone = count.clone();
            subs.push(bus.subscribe_filtered(
                property_change_filter("maintenanceNeeded"),
                Observer::new(move |_| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }),
            ));
            counters.push(count);
        }
        settle().await;

        bus.emit(EventKind::PropertyChange {
            name: "maintenanceNeeded".into(),
            value: json!(true),
        });
        settle().await;

        for count in &counters {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
        for sub in &subs {
            sub.dispose();
        }
    }
}
