use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::logging::Logger;
use crate::metrics::ShellMetrics;
use crate::persistence::{DEFAULT_NAMESPACE, default_persistent_keys};
use crate::plugins::DependencyPolicy;

use super::audit::ShellAudit;

/// Configuration knobs for the application shell.
#[derive(Clone)]
pub struct ShellConfig {
    /// Optional structured logger shared by every component.
    pub logger: Option<Logger>,
    /// Receives lifecycle checkpoints.
    pub audit: Option<Arc<dyn ShellAudit>>,
    /// Counters for renders, saves and plugin init outcomes.
    pub metrics: Option<Arc<Mutex<ShellMetrics>>>,
    /// Key the persisted snapshot is stored under.
    pub storage_namespace: String,
    /// State keys saved across restarts.
    pub persistent_keys: Vec<String>,
    /// View rendered at boot when no current view is known.
    pub initial_view: String,
    /// Upper bound for each engine's `init`. `None` waits indefinitely.
    pub init_timeout: Option<Duration>,
    pub dependency_policy: DependencyPolicy,
    /// Target used when logging metrics snapshots.
    pub metrics_target: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            logger: None,
            audit: None,
            metrics: None,
            storage_namespace: DEFAULT_NAMESPACE.to_string(),
            persistent_keys: default_persistent_keys(),
            initial_view: "home".to_string(),
            init_timeout: None,
            dependency_policy: DependencyPolicy::Lenient,
            metrics_target: "atrium::metrics".to_string(),
        }
    }
}

impl ShellConfig {
    /// Enable metrics collection if it has not already been configured.
    pub fn enable_metrics(&mut self) {
        if self.metrics.is_none() {
            self.metrics = Some(Arc::new(Mutex::new(ShellMetrics::new())));
        }
    }

    /// Access the shared metrics handle if metrics are enabled.
    pub fn metrics_handle(&self) -> Option<Arc<Mutex<ShellMetrics>>> {
        self.metrics.as_ref().map(Arc::clone)
    }

    pub fn is_persistent(&self, key: &str) -> bool {
        self.persistent_keys.iter().any(|persistent| persistent == key)
    }
}

impl std::fmt::Debug for ShellConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellConfig")
            .field("logger", &self.logger)
            .field("audit", &self.audit.is_some())
            .field("metrics", &self.metrics.is_some())
            .field("storage_namespace", &self.storage_namespace)
            .field("persistent_keys", &self.persistent_keys)
            .field("initial_view", &self.initial_view)
            .field("init_timeout", &self.init_timeout)
            .field("dependency_policy", &self.dependency_policy)
            .finish()
    }
}
