use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Result, ShellError};
use crate::events::panic_message;
use crate::logging::{LogLevel, Logger, emit, json_str};

pub mod keys;

pub use keys::StateKey;

const TARGET: &str = "atrium::state";

/// Key reported to subscribers for a batch update.
pub const BATCH_KEY: &str = "batch";

pub type StateRecord = Map<String, Value>;

/// Notification delivered to every subscriber after a mutation is committed.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Set { key: String, value: Value },
    /// The keys written by one `update` call. Subscribers that need more than
    /// these keys should re-read [`StateStore::get_all`].
    Batch(StateRecord),
}

impl StateChange {
    /// The key as reported to subscribers: the written key, or [`BATCH_KEY`].
    pub fn key(&self) -> &str {
        match self {
            StateChange::Set { key, .. } => key,
            StateChange::Batch(_) => BATCH_KEY,
        }
    }

    /// Whether this change wrote `key`.
    pub fn touches(&self, key: &str) -> bool {
        match self {
            StateChange::Set { key: written, .. } => written == key,
            StateChange::Batch(record) => record.contains_key(key),
        }
    }
}

type Subscriber = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Default)]
struct StateInner {
    values: RwLock<StateRecord>,
    subscribers: RwLock<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
    logger: Option<Logger>,
}

/// Shared key/value record with change notification.
///
/// Writes replace whole values. Subscribers run synchronously after the write
/// is visible, in subscription order, and see every mutation regardless of key.
#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<StateInner>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(logger: Logger) -> Self {
        Self {
            inner: Arc::new(StateInner {
                logger: Some(logger),
                ..StateInner::default()
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.values.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.values.read().contains_key(key)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.inner.values.write().insert(key.clone(), value.clone());
        self.notify(&StateChange::Set { key, value });
    }

    /// Replace every key present in `partial`, then notify once with a batch change.
    pub fn update(&self, partial: StateRecord) {
        {
            let mut values = self.inner.values.write();
            for (key, value) in &partial {
                values.insert(key.clone(), value.clone());
            }
        }
        self.notify(&StateChange::Batch(partial));
    }

    /// Shallow copy of the whole record.
    pub fn get_all(&self) -> StateRecord {
        self.inner.values.read().clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((id, Arc::new(callback)));
        Unsubscribe {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Read a schema key. `Ok(None)` when unset, `StateShape` when the stored
    /// value does not deserialize into `T`.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &StateKey<T>) -> Result<Option<T>> {
        let Some(value) = self.get(key.name()) else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| ShellError::StateShape {
                key: key.name().to_string(),
                message: err.to_string(),
            })
    }

    pub fn set_typed<T: Serialize>(&self, key: &StateKey<T>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key.name(), value);
        Ok(())
    }

    fn notify(&self, change: &StateChange) {
        let subscribers: Vec<Subscriber> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();

        for subscriber in subscribers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber(change))) {
                emit(
                    self.inner.logger.as_ref(),
                    LogLevel::Error,
                    TARGET,
                    "subscriber_failed",
                    [
                        json_str("key", change.key()),
                        json_str("error", panic_message(panic.as_ref())),
                    ],
                );
            }
        }
    }
}

/// Removes a subscription when consumed. Dropping it keeps the subscription alive.
#[must_use = "dropping an Unsubscribe keeps the subscription; call `unsubscribe` to remove it"]
pub struct Unsubscribe {
    id: u64,
    store: Weak<StateInner>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.store.upgrade() {
            inner.subscribers.write().retain(|(id, _)| *id != self.id);
        }
    }
}
