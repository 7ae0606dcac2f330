//! Cross-context mutation broadcasting.
//!
//! A [`SyncHub`] owns one lazily created tokio broadcast channel per
//! namespace. Each cache context opens its own [`SyncBus`] endpoint on the
//! hub; an endpoint never receives its own events.
//!
//! Delivery is best-effort: no acknowledgment, no retry, no ordering across
//! publishers. A slow endpoint that lags behind the channel capacity loses
//! the overflow. When no hub or no async runtime is available, publish and
//! subscribe degrade to logged no-ops.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use corpus_core::MutationEvent;
use once_cell::sync::Lazy;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events buffered per namespace before slow endpoints start lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

static GLOBAL_HUB: Lazy<Arc<SyncHub>> =
    Lazy::new(|| Arc::new(SyncHub::new(DEFAULT_CHANNEL_CAPACITY)));

/// Callback invoked for every event published by another endpoint.
pub type EventHandler = Arc<dyn Fn(&MutationEvent) + Send + Sync>;

type HandlerList = Arc<Mutex<Vec<(u64, EventHandler)>>>;

#[derive(Debug, Clone)]
struct Envelope {
    origin: Uuid,
    event: MutationEvent,
}

/// Registry of broadcast channels, one per namespace.
pub struct SyncHub {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl SyncHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide hub.
    pub fn global() -> Arc<SyncHub> {
        Arc::clone(&GLOBAL_HUB)
    }

    /// Namespaces whose channel has been created.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.channels).keys().cloned().collect();
        names.sort();
        names
    }

    fn channel(&self, namespace: &str) -> broadcast::Sender<Envelope> {
        lock(&self.channels)
            .entry(namespace.to_string())
            .or_insert_with(|| {
                debug!(namespace, capacity = self.capacity, "Creating sync channel");
                broadcast::channel(self.capacity).0
            })
            .clone()
    }
}

impl std::fmt::Debug for SyncHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHub")
            .field("capacity", &self.capacity)
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

#[derive(Default)]
struct BusState {
    sender: Option<broadcast::Sender<Envelope>>,
    dispatcher: Option<JoinHandle<()>>,
    closed: bool,
}

/// One context's endpoint on a namespace.
pub struct SyncBus {
    namespace: String,
    origin: Uuid,
    hub: Option<Arc<SyncHub>>,
    handlers: HandlerList,
    next_handler_id: AtomicU64,
    state: Mutex<BusState>,
}

impl SyncBus {
    /// Open an endpoint. The channel itself is created on first use.
    pub fn open(hub: Arc<SyncHub>, namespace: impl Into<String>) -> Self {
        Self::build(Some(hub), namespace.into())
    }

    /// Open an endpoint on the process-wide hub.
    pub fn open_global(namespace: impl Into<String>) -> Self {
        Self::open(SyncHub::global(), namespace)
    }

    /// An endpoint with no channel behind it; every call is a no-op.
    pub fn unavailable(namespace: impl Into<String>) -> Self {
        Self::build(None, namespace.into())
    }

    fn build(hub: Option<Arc<SyncHub>>, namespace: String) -> Self {
        Self {
            namespace,
            origin: Uuid::now_v7(),
            hub,
            handlers: Arc::new(Mutex::new(Vec::new())),
            next_handler_id: AtomicU64::new(1),
            state: Mutex::new(BusState::default()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Identity stamped on every event this endpoint publishes.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Post an event to every other endpoint on the namespace.
    pub fn publish(&self, event: MutationEvent) {
        let sender = {
            let mut state = lock(&self.state);
            self.sender(&mut state)
        };
        let Some(sender) = sender else {
            warn!(
                namespace = %self.namespace,
                key = %event.cache_key(),
                "Sync bus unavailable, event not published"
            );
            return;
        };

        let action = event.action();
        let key = event.cache_key().clone();
        match sender.send(Envelope {
            origin: self.origin,
            event,
        }) {
            Ok(receivers) => {
                debug!(namespace = %self.namespace, key = %key, action = ?action, receivers, "Published mutation event");
            }
            Err(_) => {
                debug!(namespace = %self.namespace, key = %key, "No receivers for mutation event");
            }
        }
    }

    /// Register a handler for events from other endpoints.
    ///
    /// A panicking handler is logged and skipped; other handlers still run.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&MutationEvent) + Send + Sync + 'static,
    {
        if !self.ensure_dispatcher() {
            warn!(namespace = %self.namespace, "Sync bus unavailable, subscription inactive");
            return Subscription::inert();
        }

        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers).push((id, Arc::new(handler)));
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
            active: AtomicBool::new(true),
        }
    }

    /// Stop receiving, drop all handlers and refuse further publishes.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        state.sender = None;
        if let Some(dispatcher) = state.dispatcher.take() {
            dispatcher.abort();
        }
        lock(&self.handlers).clear();
        info!(namespace = %self.namespace, origin = %self.origin, "Sync bus closed");
    }

    fn sender(&self, state: &mut BusState) -> Option<broadcast::Sender<Envelope>> {
        if state.closed {
            return None;
        }
        if state.sender.is_none() {
            let hub = self.hub.as_ref()?;
            state.sender = Some(hub.channel(&self.namespace));
        }
        state.sender.clone()
    }

    fn ensure_dispatcher(&self) -> bool {
        let mut state = lock(&self.state);
        if state.dispatcher.is_some() {
            return !state.closed;
        }
        let Some(sender) = self.sender(&mut state) else {
            return false;
        };
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "No async runtime for sync dispatcher");
                return false;
            }
        };

        state.dispatcher = Some(handle.spawn(dispatch(
            sender.subscribe(),
            self.origin,
            Arc::clone(&self.handlers),
            self.namespace.clone(),
        )));
        true
    }
}

impl Drop for SyncBus {
    fn drop(&mut self) {
        if let Some(dispatcher) = lock(&self.state).dispatcher.take() {
            dispatcher.abort();
        }
    }
}

impl std::fmt::Debug for SyncBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBus")
            .field("namespace", &self.namespace)
            .field("origin", &self.origin)
            .field("available", &self.hub.is_some())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// Handle returned by [`SyncBus::subscribe`].
#[must_use = "keep the subscription to call unsubscribe() later"]
pub struct Subscription {
    id: u64,
    handlers: Weak<Mutex<Vec<(u64, EventHandler)>>>,
    active: AtomicBool,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            id: 0,
            handlers: Weak::new(),
            active: AtomicBool::new(false),
        }
    }

    /// Remove the handler. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handlers) = self.handlers.upgrade() {
            lock(&handlers).retain(|(id, _)| *id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.handlers.strong_count() > 0
    }
}

async fn dispatch(
    mut events: broadcast::Receiver<Envelope>,
    origin: Uuid,
    handlers: HandlerList,
    namespace: String,
) {
    loop {
        match events.recv().await {
            Ok(envelope) => {
                if envelope.origin == origin {
                    continue;
                }
                let snapshot: Vec<EventHandler> = lock(&handlers)
                    .iter()
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect();
                for handler in snapshot {
                    if catch_unwind(AssertUnwindSafe(|| handler(&envelope.event))).is_err() {
                        warn!(
                            namespace = %namespace,
                            key = %envelope.event.cache_key(),
                            "Sync handler panicked"
                        );
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(namespace = %namespace, skipped, "Sync bus lagged, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
