//! Orchestration core for a modular application shell.
//!
//! Independently written plugins declare an engine, an optional view and
//! metadata (dependencies, route patterns, requested services). The shell
//! builds each one from a dependency bundle, initializes engines in
//! dependency order, and renders whichever plugin owns the current view id.

pub mod container;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod plugins;
pub mod routing;
pub mod shell;
pub mod state;

pub use container::{
    Dependencies, DependencyContainer, EVENTS_SERVICE, STATE_SERVICE, ServiceHandle, Services,
};
pub use error::{Result, ShellError};
pub use events::{EventBus, EventHandler, HandlerId, LocationChanged, topics};
pub use logging::{
    FileSink, LogEvent, LogFields, LogLevel, LogSink, Logger, LoggingError, LoggingResult,
    MemorySink, NullSink, StderrSink,
};
pub use metrics::{MetricSnapshot, ShellMetrics};
pub use persistence::{
    DEFAULT_NAMESPACE, FileStore, KeyValueStore, MemoryStore, PersistenceGateway, StorageError,
    StorageResult, default_persistent_keys,
};
pub use plugins::{
    DependencyPolicy, DependencyReport, Engine, ManagerOptions, MissingDependency, MountTarget,
    Plugin, PluginDescriptor, PluginFactory, PluginManager, PluginMetadata, PluginRecord,
    PluginStatus, View,
};
pub use routing::{Router, ViewRegistry};
pub use shell::audit::{
    NullShellAudit, RecordingAudit, ShellAudit, ShellAuditEvent, ShellAuditEventBuilder,
    ShellAuditStage,
};
pub use shell::{ROUTER_SERVICE, Shell, ShellConfig, ShellContext, VIEWS_SERVICE};
pub use state::keys::{Location, Theme};
pub use state::{BATCH_KEY, StateChange, StateKey, StateRecord, StateStore, Unsubscribe};
