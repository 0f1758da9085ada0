// ABOUTME: In-process per-session event fan-out with bounded subscriber buffers.
// ABOUTME: Slow consumers are evicted with a final error event; producers never block.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::event::SessionEvent;
use crate::hub::{Channel, ChannelHub};

/// Lazy, finite, non-restartable sequence of session events.
pub type EventStream = ReceiverStream<SessionEvent>;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SessionEvent>,
    /// One slot held back from the data budget so a terminal event can
    /// always be delivered, even to a full buffer.
    reserve: Option<OwnedPermit<SessionEvent>>,
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<Subscriber>,
    closed: bool,
    next_subscriber_id: u64,
}

/// Per-session publish/subscribe. One producer (the session's parser task)
/// per topic; any number of independently buffered subscribers.
pub struct EventBus {
    topics: Mutex<HashMap<String, Topic>>,
    buffer: usize,
    hub: Option<Arc<ChannelHub>>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            hub: None,
        }
    }

    /// Federate every published event into the cross-session hub under the
    /// `sessions` channel.
    pub fn with_hub(mut self, hub: Arc<ChannelHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Subscribe with the bus-wide default buffer.
    pub fn subscribe(&self, session_id: &str) -> EventStream {
        self.subscribe_with_buffer(session_id, self.buffer)
    }

    /// Subscribe with an explicit buffer depth (clamped to >= 1). Events
    /// arrive in parse order starting from now; there is no replay.
    pub fn subscribe_with_buffer(&self, session_id: &str, buffer: usize) -> EventStream {
        let buffer = buffer.max(1);
        // Capacity includes the reserved terminal-event slot.
        let (tx, rx) = mpsc::channel(buffer + 1);

        let mut topics = self.topics.lock().expect("bus lock poisoned");
        let topic = topics.entry(session_id.to_string()).or_default();
        if topic.closed {
            // Subscribing after close yields an immediately finished stream.
            drop(tx);
            return ReceiverStream::new(rx);
        }
        let reserve = tx.clone().try_reserve_owned().ok();
        let id = topic.next_subscriber_id;
        topic.next_subscriber_id += 1;
        topic.subscribers.push(Subscriber { id, tx, reserve });
        ReceiverStream::new(rx)
    }

    /// Deliver one event to every subscriber of the session.
    ///
    /// Sends are non-blocking; a subscriber whose buffer is full is evicted
    /// with a final `slow_consumer` error, without affecting anyone else.
    pub fn publish(&self, session_id: &str, event: &SessionEvent) {
        // Snapshot under the lock, send outside it.
        let snapshot: Vec<(u64, mpsc::Sender<SessionEvent>)> = {
            let mut topics = self.topics.lock().expect("bus lock poisoned");
            let Some(topic) = topics.get_mut(session_id) else {
                self.forward_to_hub(session_id, event);
                return;
            };
            if topic.closed {
                return;
            }
            topic
                .subscribers
                .iter()
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };

        let mut evicted = Vec::new();
        let mut gone = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => evicted.push(id),
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }

        if !evicted.is_empty() || !gone.is_empty() {
            let mut topics = self.topics.lock().expect("bus lock poisoned");
            if let Some(topic) = topics.get_mut(session_id) {
                topic.subscribers.retain_mut(|sub| {
                    if evicted.contains(&sub.id) {
                        warn!(
                            session_id = %session_id,
                            subscriber = sub.id,
                            "evicting slow consumer"
                        );
                        if let Some(permit) = sub.reserve.take() {
                            permit.send(SessionEvent::slow_consumer());
                        }
                        false
                    } else {
                        !gone.contains(&sub.id)
                    }
                });
            }
        }

        self.forward_to_hub(session_id, event);
    }

    /// Emit the synthetic terminal event to every subscriber, then close all
    /// streams. Later subscriptions see an already-finished stream.
    pub fn close(&self, session_id: &str, final_event: SessionEvent) {
        let subscribers = {
            let mut topics = self.topics.lock().expect("bus lock poisoned");
            let topic = topics.entry(session_id.to_string()).or_default();
            if topic.closed {
                return;
            }
            topic.closed = true;
            std::mem::take(&mut topic.subscribers)
        };

        for mut sub in subscribers {
            match sub.tx.try_send(final_event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // Deliver the terminal event through the reserved slot.
                    if let Some(permit) = sub.reserve.take() {
                        permit.send(final_event.clone());
                    }
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        debug!(session_id = %session_id, "event topic closed");

        self.forward_to_hub(session_id, &final_event);
    }

    /// Number of live subscribers for a session (diagnostics).
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let topics = self.topics.lock().expect("bus lock poisoned");
        topics
            .get(session_id)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    fn forward_to_hub(&self, session_id: &str, event: &SessionEvent) {
        if let Some(hub) = &self.hub {
            let payload = serde_json::json!({
                "session_id": session_id,
                "event": event,
            });
            hub.publish(Channel::Sessions, payload);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SessionEventKind;
    use tokio_stream::StreamExt;

    fn text_event(n: usize) -> SessionEvent {
        SessionEvent::new(
            SessionEventKind::Assistant {
                text: format!("event-{n}"),
            },
            serde_json::Value::Null,
        )
    }

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe("s-1");
        let mut b = bus.subscribe("s-1");

        for n in 0..5 {
            bus.publish("s-1", &text_event(n));
        }
        bus.close("s-1", SessionEvent::session_exit(Some(0)));

        for stream in [&mut a, &mut b] {
            for n in 0..5 {
                let event = stream.next().await.expect("event present");
                match event.kind {
                    SessionEventKind::Assistant { ref text } => {
                        assert_eq!(text, &format!("event-{n}"))
                    }
                    ref other => panic!("expected Assistant, got {other:?}"),
                }
            }
            let terminal = stream.next().await.expect("terminal event");
            assert_eq!(terminal.label(), "result");
            assert!(stream.next().await.is_none(), "stream closed after terminal");
        }
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_without_blocking() {
        let bus = EventBus::new(64);
        let mut fast = bus.subscribe("s-1");
        let mut slow = bus.subscribe_with_buffer("s-1", 1);

        let started = std::time::Instant::now();
        for n in 0..10 {
            bus.publish("s-1", &text_event(n));
        }
        assert!(
            started.elapsed() < std::time::Duration::from_millis(100),
            "publishing must never block on a slow subscriber"
        );
        assert_eq!(bus.subscriber_count("s-1"), 1, "slow subscriber removed");

        // Slow consumer: one buffered event, then the eviction notice, then
        // end of stream.
        let first = slow.next().await.unwrap();
        assert_eq!(first.label(), "assistant");
        let notice = slow.next().await.unwrap();
        assert_eq!(notice.raw["reason"], "slow_consumer");
        assert!(slow.next().await.is_none());

        // Fast consumer got everything.
        for n in 0..10 {
            let event = fast.next().await.unwrap();
            match event.kind {
                SessionEventKind::Assistant { ref text } => {
                    assert_eq!(text, &format!("event-{n}"))
                }
                ref other => panic!("expected Assistant, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn subscribe_after_close_yields_finished_stream() {
        let bus = EventBus::default();
        bus.subscribe("s-1");
        bus.close("s-1", SessionEvent::session_exit(None));

        let mut late = bus.subscribe("s-1");
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn terminal_event_reaches_a_full_subscriber() {
        let bus = EventBus::new(64);
        let mut slow = bus.subscribe_with_buffer("s-1", 1);

        bus.publish("s-1", &text_event(0));
        bus.close("s-1", SessionEvent::session_exit(Some(0)));

        assert_eq!(slow.next().await.unwrap().label(), "assistant");
        let terminal = slow.next().await.unwrap();
        assert_eq!(terminal.raw["subtype"], "session_exit");
        assert!(slow.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscriber_does_not_disturb_the_session() {
        let bus = EventBus::new(8);
        let a = bus.subscribe("s-1");
        let mut b = bus.subscribe("s-1");
        drop(a);

        bus.publish("s-1", &text_event(0));
        let event = b.next().await.unwrap();
        assert_eq!(event.label(), "assistant");
        assert_eq!(bus.subscriber_count("s-1"), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe("s-1");
        bus.close("s-1", SessionEvent::session_exit(Some(0)));
        bus.close("s-1", SessionEvent::session_exit(Some(1)));

        let terminal = sub.next().await.unwrap();
        assert_eq!(terminal.raw["exit_code"], 0);
        assert!(sub.next().await.is_none());
    }
}
