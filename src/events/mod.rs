//! Named-topic publish/subscribe.
//!
//! Dispatch is synchronous and runs handlers in registration order. A handler
//! failure (returned error or panic) is logged and does not stop the remaining
//! handlers of the same emit. Handlers may register further handlers or emit
//! other topics; emitting the topic currently being dispatched from one of its
//! own handlers is left to the caller to avoid.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};

const TARGET: &str = "atrium::events";

/// Topics the shell itself publishes or listens to.
pub mod topics {
    /// Payload: the view identifier to show.
    pub const VIEW_CHANGE: &str = "view:change";
    /// Payload: none. Re-renders the current view.
    pub const VIEW_REFRESH: &str = "view:refresh";
    /// Payload: none. Emitted once every engine has been through `init`.
    pub const PLUGINS_INITIALIZED: &str = "plugins:initialized";
    /// Payload: [`super::LocationChanged`].
    pub const LOCATION_CHANGED: &str = "settings:location-changed";
}

/// Payload of [`topics::LOCATION_CHANGED`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationChanged {
    pub city: String,
    pub country: String,
}

pub type EventHandler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by [`EventBus::on`], accepted by [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct HandlerEntry {
    id: HandlerId,
    handler: EventHandler,
}

#[derive(Default)]
struct EventBusInner {
    handlers: RwLock<HashMap<String, Vec<HandlerEntry>>>,
    next_id: AtomicU64,
    logger: Option<Logger>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(logger: Logger) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                logger: Some(logger),
                ..EventBusInner::default()
            }),
        }
    }

    pub fn on<F>(&self, topic: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .entry(topic.into())
            .or_default()
            .push(HandlerEntry {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Remove a handler. Returns `false` when it was not registered for `topic`.
    pub fn off(&self, topic: &str, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let Some(entries) = handlers.get_mut(topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(topic);
        }
        removed
    }

    pub fn emit(&self, topic: &str, payload: Value) {
        let snapshot: Vec<(HandlerId, EventHandler)> = match self.inner.handlers.read().get(topic) {
            Some(entries) => entries
                .iter()
                .map(|entry| (entry.id, Arc::clone(&entry.handler)))
                .collect(),
            None => return,
        };

        for (id, handler) in snapshot {
            let failure = match catch_unwind(AssertUnwindSafe(|| handler(&payload))) {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(error) = failure {
                emit(
                    self.inner.logger.as_ref(),
                    LogLevel::Error,
                    TARGET,
                    "handler_failed",
                    [
                        json_str("topic", topic),
                        json_kv("handler", id.0),
                        json_str("error", error),
                    ],
                );
            }
        }
    }

    /// Serialize `payload` and emit it. Serialization failures are logged and nothing is emitted.
    pub fn emit_with<T: Serialize>(&self, topic: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.emit(topic, value),
            Err(err) => emit(
                self.inner.logger.as_ref(),
                LogLevel::Error,
                TARGET,
                "payload_serialization_failed",
                [json_str("topic", topic), json_str("error", err.to_string())],
            ),
        }
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner.handlers.read().get(topic).map_or(0, Vec::len)
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("panic: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("panic: {text}")
    } else {
        "panic".to_string()
    }
}
