//! Best-effort save and restore of the persistent subset of the state store.

mod store;

pub use store::{FileStore, KeyValueStore, MemoryStore, StorageError, StorageResult};

use std::sync::Arc;

use serde_json::Value;

use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::state::{StateRecord, keys};

const TARGET: &str = "atrium::persistence";

/// Namespace key the snapshot is stored under unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "atrium.state";

/// Keys saved across restarts.
pub fn default_persistent_keys() -> Vec<String> {
    [
        keys::LANGUAGE.name(),
        keys::LOCATION.name(),
        keys::RECITER.name(),
        keys::CALCULATION_METHOD.name(),
        keys::THEME.name(),
        keys::ONBOARDING_COMPLETED.name(),
        keys::NOTIFICATIONS_ENABLED.name(),
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    logger: Option<Logger>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Write the whitelisted keys present in `state` as one document.
    /// Returns whether the write went through; failures are logged only.
    pub fn save<S: AsRef<str>>(&self, state: &StateRecord, keys: &[S]) -> bool {
        let snapshot: StateRecord = keys
            .iter()
            .filter_map(|key| {
                let key = key.as_ref();
                state.get(key).map(|value| (key.to_string(), value.clone()))
            })
            .collect();

        let written = serde_json::to_string(&snapshot)
            .map_err(StorageError::from)
            .and_then(|payload| self.store.set_item(&self.namespace, &payload));
        match written {
            Ok(()) => {
                self.log(
                    LogLevel::Debug,
                    "state_saved",
                    [json_kv("keys", snapshot.len())],
                );
                true
            }
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "state_save_failed",
                    [json_str("error", err.to_string())],
                );
                false
            }
        }
    }

    /// The saved document, or an empty record when nothing usable is stored.
    pub fn load(&self) -> StateRecord {
        let payload = match self.store.get_item(&self.namespace) {
            Ok(Some(payload)) => payload,
            Ok(None) => return StateRecord::new(),
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "state_load_failed",
                    [json_str("error", err.to_string())],
                );
                return StateRecord::new();
            }
        };

        match serde_json::from_str::<Value>(&payload) {
            Ok(Value::Object(record)) => record,
            Ok(other) => {
                self.log(
                    LogLevel::Warn,
                    "state_snapshot_not_an_object",
                    [json_str("kind", value_kind(&other))],
                );
                StateRecord::new()
            }
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    "state_snapshot_corrupt",
                    [json_str("error", err.to_string())],
                );
                StateRecord::new()
            }
        }
    }

    pub fn clear(&self) {
        if let Err(err) = self.store.remove_item(&self.namespace) {
            self.log(
                LogLevel::Error,
                "state_clear_failed",
                [json_str("error", err.to_string())],
            );
        }
    }

    fn log(
        &self,
        level: LogLevel,
        message: &str,
        fields: impl IntoIterator<Item = (String, Value)>,
    ) {
        emit(self.logger.as_ref(), level, TARGET, message, fields);
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use serde_json::json;

    struct Broken;

    impl KeyValueStore for Broken {
        fn get_item(&self, _key: &str) -> StorageResult<Option<String>> {
            Err(StorageError::Unavailable("quota exceeded".into()))
        }

        fn set_item(&self, _key: &str, _value: &str) -> StorageResult<()> {
            Err(StorageError::Unavailable("quota exceeded".into()))
        }

        fn remove_item(&self, _key: &str) -> StorageResult<()> {
            Err(StorageError::Unavailable("quota exceeded".into()))
        }
    }

    fn record(value: Value) -> StateRecord {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn save_keeps_only_whitelisted_keys() {
        let gateway = PersistenceGateway::new(Arc::new(MemoryStore::new()), DEFAULT_NAMESPACE);
        assert!(gateway.save(&record(json!({"a": 1, "b": 2, "c": 3})), &["a", "c"]));
        assert_eq!(gateway.load(), record(json!({"a": 1, "c": 3})));
    }

    #[test]
    fn whitelisted_but_absent_keys_are_not_written() {
        let gateway = PersistenceGateway::new(Arc::new(MemoryStore::new()), DEFAULT_NAMESPACE);
        gateway.save(&record(json!({"theme": "dark"})), &default_persistent_keys());
        assert_eq!(gateway.load(), record(json!({"theme": "dark"})));
    }

    #[test]
    fn corrupt_or_missing_payload_loads_empty() {
        let store = MemoryStore::new();
        let gateway = PersistenceGateway::new(Arc::new(store.clone()), DEFAULT_NAMESPACE);
        assert!(gateway.load().is_empty());

        store.set_item(DEFAULT_NAMESPACE, "{not json").unwrap();
        assert!(gateway.load().is_empty());

        store.set_item(DEFAULT_NAMESPACE, "[1, 2]").unwrap();
        assert!(gateway.load().is_empty());
    }

    #[test]
    fn failures_are_logged_not_raised() {
        let sink = MemorySink::new();
        let gateway = PersistenceGateway::new(Arc::new(Broken), DEFAULT_NAMESPACE)
            .with_logger(Logger::new(sink.clone()));

        assert!(!gateway.save(&record(json!({"language": "ar"})), &["language"]));
        assert!(gateway.load().is_empty());
        gateway.clear();

        assert_eq!(
            sink.messages_at(LogLevel::Error),
            vec!["state_save_failed", "state_load_failed", "state_clear_failed"]
        );
    }

    #[test]
    fn clear_removes_the_namespace_only() {
        let store = MemoryStore::new();
        store.set_item("other", "kept").unwrap();
        let gateway = PersistenceGateway::new(Arc::new(store.clone()), "prefs");
        gateway.save(&record(json!({"theme": "light"})), &["theme"]);
        assert_eq!(store.len(), 2);

        gateway.clear();
        assert!(gateway.load().is_empty());
        assert_eq!(store.get_item("other").unwrap().as_deref(), Some("kept"));
    }
}
