//! Pushed-event fan-out.
//!
//! Each subscriber owns an unbounded channel, so a single `dispatch` caller
//! delivers events to every subscriber in the order they were dispatched.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use openagents_gateway_proto::GatewayEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Subscription name that matches every event.
pub const ALL_EVENTS: &str = "*";

struct Subscriber {
    name: String,
    sender: mpsc::UnboundedSender<GatewayEvent>,
}

#[derive(Default)]
struct DispatcherInner {
    subscribers: Mutex<BTreeMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl DispatcherInner {
    fn subscribers(&self) -> MutexGuard<'_, BTreeMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Default)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive events named `name`, or every event for [`ALL_EVENTS`].
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.subscribers().insert(
            id,
            Subscriber {
                name: name.clone(),
                sender,
            },
        );
        Subscription {
            id,
            name,
            receiver,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(ALL_EVENTS)
    }

    /// Run `handler` for each matching event until the guard is dropped.
    pub fn on<F>(&self, name: impl Into<String>, mut handler: F) -> HandlerGuard
    where
        F: FnMut(GatewayEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe(name);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler(event);
            }
        });
        HandlerGuard { task }
    }

    /// Deliver to every matching subscriber. Returns the delivery count.
    pub fn dispatch(&self, event: &GatewayEvent) -> usize {
        let mut subscribers = self.inner.subscribers();
        let mut delivered = 0;
        subscribers.retain(|_, subscriber| {
            if subscriber.name != ALL_EVENTS && subscriber.name != event.name() {
                return true;
            }
            if subscriber.sender.send(event.clone()).is_err() {
                return false;
            }
            delivered += 1;
            true
        });
        trace!(event = event.name(), delivered, "dispatched gateway event");
        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    name: String,
    receiver: mpsc::UnboundedReceiver<GatewayEvent>,
    dispatcher: Weak<DispatcherInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next event, or `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<GatewayEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.subscribers().remove(&self.id);
        }
    }
}

/// Keeps a handler registered by [`EventDispatcher::on`] alive.
#[derive(Debug)]
pub struct HandlerGuard {
    task: JoinHandle<()>,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Last activity per in-flight chat run.
#[derive(Debug, Default)]
pub struct StreamTracker {
    runs: HashMap<String, Instant>,
}

impl StreamTracker {
    pub fn begin(&mut self, run_id: &str, now: Instant) {
        self.runs.insert(run_id.to_string(), now);
    }

    /// Refresh or finish the run an event belongs to.
    pub fn observe(&mut self, event: &GatewayEvent, now: Instant) {
        let GatewayEvent::Chat(chat) = event else {
            return;
        };
        let Some(run_id) = chat.run_id.as_deref() else {
            return;
        };
        if chat.state.is_terminal() {
            self.runs.remove(run_id);
        } else {
            self.runs.insert(run_id.to_string(), now);
        }
    }

    /// Remove and return runs idle for at least `timeout`.
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<(String, Duration)> {
        let expired: Vec<(String, Duration)> = self
            .runs
            .iter()
            .filter_map(|(run_id, last)| {
                let idle = now.saturating_duration_since(*last);
                (idle >= timeout).then(|| (run_id.clone(), idle))
            })
            .collect();
        for (run_id, _) in &expired {
            self.runs.remove(run_id);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openagents_gateway_proto::{ChatEvent, ChatState};

    fn chat(run_id: &str, seq: u64, state: ChatState) -> GatewayEvent {
        GatewayEvent::Chat(ChatEvent {
            run_id: Some(run_id.to_string()),
            session_key: None,
            seq: Some(seq),
            state,
            message: None,
            error_message: None,
            usage: None,
            stop_reason: None,
            model: None,
        })
    }

    #[tokio::test]
    async fn deltas_then_final_arrive_in_dispatch_order() {
        let dispatcher = EventDispatcher::new();
        let mut first = dispatcher.subscribe("chat");
        let mut second = dispatcher.subscribe_all();

        for seq in 1..=5 {
            dispatcher.dispatch(&chat("run", seq, ChatState::Delta));
        }
        dispatcher.dispatch(&chat("run", 6, ChatState::Final));

        for subscription in [&mut first, &mut second] {
            for expected in 1..=6 {
                let Some(GatewayEvent::Chat(event)) = subscription.recv().await else {
                    panic!("expected chat event");
                };
                assert_eq!(event.seq, Some(expected));
            }
        }
    }

    #[test]
    fn name_filter_excludes_other_events() {
        let dispatcher = EventDispatcher::new();
        let mut chat_only = dispatcher.subscribe("chat");
        assert_eq!(dispatcher.dispatch(&GatewayEvent::Tick), 0);
        assert!(chat_only.try_recv().is_none());
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let dispatcher = EventDispatcher::new();
        let subscription = dispatcher.subscribe("tick");
        let other = dispatcher.subscribe("tick");
        assert_eq!(dispatcher.subscriber_count(), 2);
        drop(subscription);
        other.unsubscribe();
        assert_eq!(dispatcher.subscriber_count(), 0);
        assert_eq!(dispatcher.dispatch(&GatewayEvent::Tick), 0);
    }

    #[tokio::test]
    async fn handler_guard_stops_delivery_on_drop() {
        let dispatcher = EventDispatcher::new();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let guard = dispatcher.on("tick", move |event| {
            let _ = seen_tx.send(event);
        });
        dispatcher.dispatch(&GatewayEvent::Tick);
        assert_eq!(seen_rx.recv().await, Some(GatewayEvent::Tick));

        drop(guard);
        for _ in 0..10 {
            if dispatcher.subscriber_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_expires_only_idle_runs() {
        let mut tracker = StreamTracker::default();
        let start = Instant::now();
        tracker.begin("quiet", start);
        tracker.begin("busy", start);

        tracker.observe(
            &chat("busy", 1, ChatState::Delta),
            start + Duration::from_secs(50),
        );
        let expired = tracker.take_expired(start + Duration::from_secs(61), Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "quiet");
        assert_eq!(tracker.len(), 1);

        tracker.observe(
            &chat("busy", 2, ChatState::Final),
            start + Duration::from_secs(62),
        );
        assert!(tracker.is_empty());
    }
}
