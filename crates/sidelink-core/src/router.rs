//! Typed publish/subscribe dispatch of inbound frames, keyed by message type.
//!
//! Handlers for one message type run strictly one after another, in the order
//! frames were delivered. Different message types are dispatched
//! independently of each other.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use sidelink_wire::{Message, MessageType};

type Handler = Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Registration {
    id: u64,
    once: bool,
    handler: Handler,
}

struct RouterInner {
    handlers: Mutex<HashMap<MessageType, Vec<Registration>>>,
    delivery_locks: HashMap<MessageType, tokio::sync::Mutex<()>>,
    next_id: AtomicU64,
}

impl RouterInner {
    fn remove(&self, message_type: MessageType, id: u64) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(registrations) = handlers.get_mut(&message_type) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            handlers.remove(&message_type);
        }
        removed
    }
}

/// Disposal token returned by [`MessageRouter::subscribe`] and
/// [`MessageRouter::once`]. Dropping it leaves the handler registered.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    message_type: MessageType,
    router: Weak<RouterInner>,
}

impl std::fmt::Debug for RouterInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterInner").finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Remove the handler. Returns false if it was already gone (disposed
    /// before, or a `once` handler that already fired).
    pub fn dispose(&self) -> bool {
        match self.router.upgrade() {
            Some(router) => router.remove(self.message_type, self.id),
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    pub fn new() -> Self {
        let delivery_locks = MessageType::ALL
            .into_iter()
            .map(|t| (t, tokio::sync::Mutex::new(())))
            .collect();
        Self {
            inner: Arc::new(RouterInner {
                handlers: Mutex::new(HashMap::new()),
                delivery_locks,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a durable handler for `message_type`.
    pub fn subscribe<F, Fut>(&self, message_type: MessageType, handler: F) -> Subscription
    where
        F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(message_type, false, handler)
    }

    /// Register a handler that is removed before its first invocation.
    pub fn once<F, Fut>(&self, message_type: MessageType, handler: F) -> Subscription
    where
        F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(message_type, true, handler)
    }

    fn register<F, Fut>(&self, message_type: MessageType, once: bool, handler: F) -> Subscription
    where
        F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(
            move |message| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(handler(message)) },
        );
        self.inner
            .handlers
            .lock()
            .entry(message_type)
            .or_default()
            .push(Registration { id, once, handler });
        Subscription {
            id,
            message_type,
            router: Arc::downgrade(&self.inner),
        }
    }

    pub fn handler_count(&self, message_type: MessageType) -> usize {
        self.inner
            .handlers
            .lock()
            .get(&message_type)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler registered for the message's type, awaiting each
    /// before the next. Handler failures and panics are logged and do not stop
    /// the remaining handlers. Returns how many handlers ran.
    ///
    /// Must not be awaited from inside a handler for the same message type.
    pub async fn deliver(&self, message: Message) -> usize {
        let message_type = message.message_type();
        let _ordered = match self.inner.delivery_locks.get(&message_type) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let handlers = self.take_handlers(message_type);
        if handlers.is_empty() {
            debug!(
                message_type = message_type.as_str(),
                message_id = %message.headers.message_id,
                "no handlers registered; dropping frame"
            );
            return 0;
        }

        let message = Arc::new(message);
        for (id, handler) in &handlers {
            let outcome = AssertUnwindSafe(async { handler(message.clone()).await })
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            warn!(
                message_type = message_type.as_str(),
                message_id = %message.headers.message_id,
                handler_id = id,
                "message handler failed: {failure}"
            );
        }
        handlers.len()
    }

    /// Snapshot the handlers for one delivery, unregistering `once` handlers
    /// in the same critical section.
    fn take_handlers(&self, message_type: MessageType) -> Vec<(u64, Handler)> {
        let mut handlers = self.inner.handlers.lock();
        let Some(registrations) = handlers.get_mut(&message_type) else {
            return Vec::new();
        };
        let snapshot = registrations
            .iter()
            .map(|r| (r.id, r.handler.clone()))
            .collect();
        registrations.retain(|r| !r.once);
        if registrations.is_empty() {
            handlers.remove(&message_type);
        }
        snapshot
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}
