//! Lifecycle events and the in-process event bus.
//!
//! Sessions publish [`LifecycleEvent`]s while they run. Subscribers either
//! register a handler for one [`EventKind`] (invoked inline, in subscription
//! order) or take a broadcast [`EventBus::stream`] for async consumption.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::{AgentOutput, RequestId};
use crate::error::{Error, ErrorKind};
use crate::session::SessionId;

/// Capacity of the broadcast stream before slow receivers start lagging.
const STREAM_CAPACITY: usize = 256;

/// Closed set of event kinds a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Progress notifications.
    Update,
    /// Terminal failures.
    Error,
}

/// Progress notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub session_id: SessionId,
    /// Request the update belongs to, if any.
    pub request_id: Option<RequestId>,
    pub output: AgentOutput,
    pub at: DateTime<Utc>,
}

/// Terminal failure notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub session_id: SessionId,
    pub request_id: Option<RequestId>,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Event delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum LifecycleEvent {
    Update(UpdateEvent),
    Error(ErrorEvent),
}

impl LifecycleEvent {
    /// Builds an update event stamped with the current time.
    pub fn update(
        session_id: SessionId,
        request_id: Option<RequestId>,
        output: AgentOutput,
    ) -> Self {
        LifecycleEvent::Update(UpdateEvent {
            session_id,
            request_id,
            output,
            at: Utc::now(),
        })
    }

    /// Builds an error event from a crate error.
    pub fn error(session_id: SessionId, request_id: Option<RequestId>, error: &Error) -> Self {
        LifecycleEvent::Error(ErrorEvent {
            session_id,
            request_id,
            kind: error.kind(),
            message: error.to_string(),
            at: Utc::now(),
        })
    }

    /// Returns the kind used to route this event.
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Update(_) => EventKind::Update,
            LifecycleEvent::Error(_) => EventKind::Error,
        }
    }

    /// Returns the request this event belongs to.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            LifecycleEvent::Update(e) => e.request_id.as_ref(),
            LifecycleEvent::Error(e) => e.request_id.as_ref(),
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

struct BusState {
    subscribers: Vec<Subscriber>,
    stream: Option<broadcast::Sender<LifecycleEvent>>,
    closed: bool,
}

/// In-memory publish/subscribe channel for one session.
///
/// Handlers run on the publishing task while the bus holds a read lock, so
/// [`EventBus::close`] waits for in-flight deliveries and nothing is
/// delivered once it returns. Handlers must not subscribe or unsubscribe
/// from within a callback.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<RwLock<BusState>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an open bus with no subscribers.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(STREAM_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(BusState {
                subscribers: Vec::new(),
                stream: Some(tx),
                closed: false,
            })),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers `handler` for events of `kind`.
    ///
    /// Subscribing to a closed bus succeeds but the handler is never called.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.closed {
            state.subscribers.push(Subscriber {
                id,
                kind,
                handler: Arc::new(handler),
            });
        }
        id
    }

    /// Removes a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        state.subscribers.len() != before
    }

    /// Returns a receiver for every event published from now on.
    ///
    /// The receiver ends once the bus is closed.
    pub fn stream(&self) -> broadcast::Receiver<LifecycleEvent> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        match &state.stream {
            Some(tx) => tx.subscribe(),
            None => {
                // Closed: hand out a receiver whose sender is already gone.
                let (_tx, rx) = broadcast::channel(1);
                rx
            }
        }
    }

    /// Delivers `event` to every matching handler and stream receiver.
    ///
    /// Returns the number of handlers invoked. A panicking handler is
    /// logged and skipped.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            tracing::debug!(kind = ?event.kind(), "dropping event published after close");
            return 0;
        }

        let kind = event.kind();
        let mut delivered = 0;
        for subscriber in state.subscribers.iter().filter(|s| s.kind == kind) {
            let handler = &subscriber.handler;
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(
                        subscription = subscriber.id.0,
                        kind = ?kind,
                        "event handler panicked, continuing delivery"
                    );
                }
            }
        }

        if let Some(tx) = &state.stream {
            // No receivers is not an error.
            let _ = tx.send(event);
        }

        delivered
    }

    /// Stops all delivery and drops every subscriber.
    pub fn close(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        state.subscribers.clear();
        state.stream = None;
    }

    /// Returns true once [`EventBus::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Returns the number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn update(text: &str) -> LifecycleEvent {
        LifecycleEvent::update(SessionId::new(), None, AgentOutput::Stdout(text.to_string()))
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = seen.clone();
            bus.subscribe(EventKind::Update, move |_| seen.lock().unwrap().push(n));
        }

        assert_eq!(bus.publish(update("hello")), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn events_are_routed_by_kind() {
        let bus = EventBus::new();
        let errors = Arc::new(Mutex::new(0));
        {
            let errors = errors.clone();
            bus.subscribe(EventKind::Error, move |_| *errors.lock().unwrap() += 1);
        }

        bus.publish(update("progress"));
        assert_eq!(*errors.lock().unwrap(), 0);

        bus.publish(LifecycleEvent::error(
            SessionId::new(),
            None,
            &Error::SandboxNotReady,
        ));
        assert_eq!(*errors.lock().unwrap(), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));

        bus.subscribe(EventKind::Update, |_| panic!("handler failure"));
        {
            let reached = reached.clone();
            bus.subscribe(EventKind::Update, move |_| *reached.lock().unwrap() = true);
        }

        let delivered = bus.publish(update("still delivered"));

        assert_eq!(delivered, 1);
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn closed_bus_delivers_nothing() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        {
            let count = count.clone();
            bus.subscribe(EventKind::Update, move |_| *count.lock().unwrap() += 1);
        }

        bus.close();

        assert!(bus.is_closed());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(update("late")), 0);
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let id = bus.subscribe(EventKind::Update, |_| {});

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stream_receives_published_events_and_ends_on_close() {
        let bus = EventBus::new();
        let mut rx = bus.stream();

        bus.publish(update("one"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::Update);

        bus.close();
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn lifecycle_event_serializes_with_tag() {
        let json = serde_json::to_string(&update("hi")).unwrap();
        assert!(json.contains("\"event\":\"update\""));
    }
}
