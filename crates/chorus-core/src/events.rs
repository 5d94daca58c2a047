//! In-process event bus.
//!
//! Handlers are keyed by event type and invoked synchronously, in registration
//! order, on the publishing thread. A handler that fails or panics is logged
//! and skipped; the publisher and the remaining handlers are unaffected.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{error, trace, warn};

/// Error returned by an event handler.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a new handler error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Result of an event handler.
pub type HandlerResult = Result<(), HandlerError>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Counts from a single [`EventBus::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers that returned `Ok`.
    pub handled: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

type ErasedHandler = dyn Fn(&dyn Any) -> HandlerResult + Send + Sync;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    handler: Arc<ErasedHandler>,
}

/// Typed publish/subscribe bus.
///
/// Handler lists are copy-on-write, so a handler may subscribe or unsubscribe
/// while an event is being published without deadlocking.
pub struct EventBus {
    handlers: RwLock<HashMap<TypeId, Arc<Vec<Subscriber>>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for events of type `E`.
    pub fn subscribe<E, F>(&self, handler: F) -> SubscriptionId
    where
        E: Any + Send + Sync,
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let erased: Arc<ErasedHandler> = Arc::new(move |event: &dyn Any| {
            match event.downcast_ref::<E>() {
                Some(event) => handler(event),
                None => Ok(()),
            }
        });

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let list = handlers.entry(TypeId::of::<E>()).or_default();
        let mut next: Vec<Subscriber> = list.iter().cloned().collect();
        next.push(Subscriber { id, handler: erased });
        *list = Arc::new(next);

        trace!(event = type_name::<E>(), subscription = id.0, "Handler subscribed");
        id
    }

    /// Remove a handler.
    ///
    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                let mut next: Vec<Subscriber> = list.iter().cloned().collect();
                next.remove(pos);
                *list = Arc::new(next);
                return true;
            }
        }
        false
    }

    /// Number of handlers registered for `E`.
    #[must_use]
    pub fn subscriber_count<E: Any>(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .map_or(0, |list| list.len())
    }

    /// Publish an event to every handler registered for its type.
    pub fn publish<E: Any + Send + Sync>(&self, event: &E) -> PublishReport {
        let subscribers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .cloned();

        let mut report = PublishReport::default();
        let Some(subscribers) = subscribers else {
            return report;
        };

        for subscriber in subscribers.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                (subscriber.handler)(event as &dyn Any)
            }));
            match outcome {
                Ok(Ok(())) => report.handled += 1,
                Ok(Err(e)) => {
                    warn!(
                        event = type_name::<E>(),
                        subscription = subscriber.id.0,
                        error = %e,
                        "Event handler failed"
                    );
                    report.failed += 1;
                }
                Err(payload) => {
                    error!(
                        event = type_name::<E>(),
                        subscription = subscriber.id.0,
                        panic = panic_message(payload.as_ref()),
                        "Event handler panicked"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field("event_types", &handlers.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
