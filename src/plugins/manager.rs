use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{Value, json};

use crate::container::{Dependencies, DependencyContainer};
use crate::error::{Result, ShellError};
use crate::events::{EventBus, panic_message, topics};
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::shell::audit::{ShellAudit, ShellAuditEventBuilder, ShellAuditStage};
use crate::state::StateStore;

use super::order::{OrderNode, resolve_order};
use super::{DependencyReport, Engine, Plugin, PluginMetadata, PluginRecord, PluginStatus, View};

const TARGET: &str = "atrium::plugins";

/// How `init` treats cycles and dependencies on unregistered plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyPolicy {
    /// Warn, drop the offending edges and initialize anyway.
    #[default]
    Lenient,
    /// Refuse to initialize anything while the graph has a cycle or a missing name.
    Strict,
}

#[derive(Clone, Default)]
pub struct ManagerOptions {
    /// When absent, `get_dependencies` can only build the minimal bundle.
    pub container: Option<DependencyContainer>,
    pub logger: Option<Logger>,
    pub audit: Option<Arc<dyn ShellAudit>>,
    /// Upper bound for a single engine's `init`. `None` waits indefinitely.
    pub init_timeout: Option<Duration>,
    pub dependency_policy: DependencyPolicy,
}

#[derive(Default)]
struct Registry {
    records: Vec<PluginRecord>,
    index: HashMap<String, usize>,
    status: HashMap<String, PluginStatus>,
}

struct ManagerInner {
    registry: RwLock<Registry>,
    initialized: AtomicBool,
    options: ManagerOptions,
}

enum InitOutcome {
    Ready,
    Failed(String),
    TimedOut(Duration),
}

/// Owns registered plugins and drives their initialization.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
    state: StateStore,
    events: EventBus,
}

impl PluginManager {
    pub fn new(state: StateStore, events: EventBus) -> Self {
        Self::with_options(state, events, ManagerOptions::default())
    }

    pub fn with_options(state: StateStore, events: EventBus, options: ManagerOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: RwLock::new(Registry::default()),
                initialized: AtomicBool::new(false),
                options,
            }),
            state,
            events,
        }
    }

    /// Store a plugin under `name`. A second registration under the same name
    /// is ignored with a warning and returns `false`.
    pub fn register(&self, name: &str, plugin: Plugin, metadata: PluginMetadata) -> bool {
        {
            let mut registry = self.inner.registry.write();
            if registry.index.contains_key(name) {
                drop(registry);
                self.log(
                    LogLevel::Warn,
                    "plugin_already_registered",
                    [json_str("plugin", name)],
                );
                self.audit(
                    ShellAuditEventBuilder::new(ShellAuditStage::RegistrationRejected)
                        .detail("plugin", name),
                );
                return false;
            }

            let record = PluginRecord {
                name: name.to_string(),
                engine: plugin.engine.clone(),
                view: plugin.view.clone(),
                metadata,
            };
            let position = registry.records.len();
            registry.records.push(record);
            registry.index.insert(name.to_string(), position);
            registry
                .status
                .insert(name.to_string(), PluginStatus::Registered);
        }

        if plugin.is_empty() {
            self.log(
                LogLevel::Warn,
                "plugin_without_capabilities",
                [json_str("plugin", name)],
            );
        }
        self.log(
            LogLevel::Debug,
            "plugin_registered",
            [
                json_str("plugin", name),
                json_kv("engine", plugin.engine.is_some()),
                json_kv("view", plugin.view.is_some()),
            ],
        );
        self.audit(
            ShellAuditEventBuilder::new(ShellAuditStage::PluginRegistered).detail("plugin", name),
        );
        true
    }

    pub fn get(&self, name: &str) -> Option<PluginRecord> {
        let registry = self.inner.registry.read();
        registry
            .index
            .get(name)
            .map(|&position| registry.records[position].clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.registry.read().index.contains_key(name)
    }

    /// The view of `name`, if the plugin exists and has one.
    pub fn view(&self, name: &str) -> Option<Arc<dyn View>> {
        self.get(name).and_then(|record| record.view)
    }

    /// Look up another plugin's engine as its concrete type.
    ///
    /// Resolved on every call; nothing is cached, so callers that need the
    /// engine repeatedly should keep the returned `Arc`.
    pub fn engine<T: Engine>(&self, name: &str) -> Option<Arc<T>> {
        let engine = self.get(name)?.engine?;
        engine.into_any_arc().downcast::<T>().ok()
    }

    pub fn status(&self, name: &str) -> Option<PluginStatus> {
        self.inner.registry.read().status.get(name).cloned()
    }

    /// Plugin names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .registry
            .read()
            .records
            .iter()
            .map(|record| record.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.registry.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Initialization order together with every dropped cycle edge and missing name.
    pub fn dependency_report(&self) -> DependencyReport {
        let registry = self.inner.registry.read();
        let nodes: Vec<OrderNode<'_>> = registry
            .records
            .iter()
            .map(|record| OrderNode {
                name: &record.name,
                dependencies: &record.metadata.dependencies,
                init_order: record.metadata.init_order,
            })
            .collect();
        resolve_order(&nodes)
    }

    /// Names ordered so each plugin follows its registered dependencies.
    /// Cycles and unregistered dependency names are logged, never fatal.
    pub fn calculate_init_order(&self) -> Vec<String> {
        let report = self.dependency_report();
        self.report_problems(&report);
        report.order
    }

    /// Fails the way `init` would under [`DependencyPolicy::Strict`], without
    /// running anything. Always `Ok` under the lenient policy.
    pub fn check_dependencies(&self) -> Result<()> {
        if self.inner.options.dependency_policy != DependencyPolicy::Strict {
            return Ok(());
        }
        let report = self.dependency_report();
        let checked = self.enforce_policy(&report);
        if checked.is_err() {
            self.report_problems(&report);
        }
        checked
    }

    fn enforce_policy(&self, report: &DependencyReport) -> Result<()> {
        if self.inner.options.dependency_policy != DependencyPolicy::Strict {
            return Ok(());
        }
        if let Some(missing) = report.missing.first() {
            return Err(ShellError::MissingDependency {
                plugin: missing.plugin.clone(),
                dependency: missing.dependency.clone(),
            });
        }
        if let Some(cycle) = report.cycles.first() {
            return Err(ShellError::DependencyCycle(cycle.clone()));
        }
        Ok(())
    }

    /// Run every engine's `init` in dependency order, one at a time.
    ///
    /// A failing, panicking or timed-out engine is logged and the sequence
    /// continues. `plugins:initialized` is emitted once the sequence ends.
    /// Calling `init` again is a no-op. Under [`DependencyPolicy::Strict`] a
    /// cycle or missing dependency is returned before any engine runs.
    pub async fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let report = self.dependency_report();
        self.report_problems(&report);
        self.enforce_policy(&report)?;

        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.audit(
            ShellAuditEventBuilder::new(ShellAuditStage::InitOrderComputed)
                .detail("order", json!(report.order)),
        );
        self.log(
            LogLevel::Info,
            "init_started",
            [json_kv("order", json!(report.order))],
        );

        let mut failures = 0usize;
        for name in &report.order {
            let Some(engine) = self.get(name).and_then(|record| record.engine) else {
                continue;
            };

            let status = match self.run_init(engine).await {
                InitOutcome::Ready => {
                    self.log(
                        LogLevel::Debug,
                        "plugin_initialized",
                        [json_str("plugin", name)],
                    );
                    self.audit(
                        ShellAuditEventBuilder::new(ShellAuditStage::PluginInitialized)
                            .detail("plugin", name.as_str()),
                    );
                    PluginStatus::Initialized
                }
                InitOutcome::Failed(error) => {
                    failures += 1;
                    self.log(
                        LogLevel::Error,
                        "plugin_init_failed",
                        [json_str("plugin", name), json_str("error", error.clone())],
                    );
                    self.audit(
                        ShellAuditEventBuilder::new(ShellAuditStage::PluginInitFailed)
                            .detail("plugin", name.as_str())
                            .detail("error", error.clone()),
                    );
                    PluginStatus::Failed(error)
                }
                InitOutcome::TimedOut(limit) => {
                    failures += 1;
                    self.log(
                        LogLevel::Error,
                        "plugin_init_timed_out",
                        [
                            json_str("plugin", name),
                            json_kv("timeout_ms", limit.as_millis() as u64),
                        ],
                    );
                    self.audit(
                        ShellAuditEventBuilder::new(ShellAuditStage::PluginInitFailed)
                            .detail("plugin", name.as_str())
                            .detail("error", "timed out"),
                    );
                    PluginStatus::TimedOut
                }
            };
            self.inner
                .registry
                .write()
                .status
                .insert(name.clone(), status);
        }

        self.log(
            LogLevel::Info,
            "plugins_initialized",
            [
                json_kv("plugins", report.order.len()),
                json_kv("failed", failures),
            ],
        );
        self.audit(
            ShellAuditEventBuilder::new(ShellAuditStage::PluginsInitialized)
                .detail("failed", failures),
        );
        self.events.emit(topics::PLUGINS_INITIALIZED, Value::Null);
        Ok(())
    }

    /// The bundle plugins are constructed with, plus the services in `additional`.
    ///
    /// Without a container only the core services are available and any
    /// requested extra fails with `ServiceNotFound`.
    pub fn get_dependencies<S: AsRef<str>>(&self, additional: &[S]) -> Result<Dependencies> {
        match &self.inner.options.container {
            Some(container) => container.create_dependencies(self, additional),
            None => {
                if let Some(name) = additional.first() {
                    return Err(ShellError::ServiceNotFound(name.as_ref().to_string()));
                }
                Ok(Dependencies::minimal(
                    self.state.clone(),
                    self.events.clone(),
                    self.clone(),
                ))
            }
        }
    }

    async fn run_init(&self, engine: Arc<dyn Engine>) -> InitOutcome {
        let guarded = AssertUnwindSafe(engine.init()).catch_unwind();
        let result = match self.inner.options.init_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(result) => result,
                Err(_) => return InitOutcome::TimedOut(limit),
            },
            None => guarded.await,
        };

        match result {
            Ok(Ok(())) => InitOutcome::Ready,
            Ok(Err(err)) => InitOutcome::Failed(format!("{err:#}")),
            Err(panic) => InitOutcome::Failed(panic_message(panic.as_ref())),
        }
    }

    fn report_problems(&self, report: &DependencyReport) {
        for cycle in &report.cycles {
            self.log(
                LogLevel::Warn,
                "dependency_cycle",
                [json_kv("path", json!(cycle))],
            );
            self.audit(
                ShellAuditEventBuilder::new(ShellAuditStage::DependencyCycle)
                    .detail("path", json!(cycle)),
            );
        }
        for missing in &report.missing {
            self.log(
                LogLevel::Warn,
                "dependency_missing",
                [
                    json_str("plugin", missing.plugin.as_str()),
                    json_str("dependency", missing.dependency.as_str()),
                ],
            );
            self.audit(
                ShellAuditEventBuilder::new(ShellAuditStage::DependencyMissing)
                    .detail("plugin", missing.plugin.as_str())
                    .detail("dependency", missing.dependency.as_str()),
            );
        }
    }

    fn log(
        &self,
        level: LogLevel,
        message: &str,
        fields: impl IntoIterator<Item = (String, Value)>,
    ) {
        emit(self.inner.options.logger.as_ref(), level, TARGET, message, fields);
    }

    fn audit(&self, builder: ShellAuditEventBuilder) {
        if let Some(audit) = self.inner.options.audit.as_ref() {
            audit.record(builder.finish());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use crate::shell::audit::RecordingAudit;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Engine for Recorder {
        async fn init(&self) -> anyhow::Result<()> {
            self.log.lock().push(self.name.to_string());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Engine for Failing {
        async fn init(&self) -> anyhow::Result<()> {
            anyhow::bail!("remote calendar unavailable")
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl Engine for Panicking {
        async fn init(&self) -> anyhow::Result<()> {
            panic!("engine bug")
        }
    }

    struct Hanging;

    #[async_trait::async_trait]
    impl Engine for Hanging {
        async fn init(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Idle;

    impl Engine for Idle {}

    fn idle() -> Plugin {
        Plugin::new().with_engine(Arc::new(Idle))
    }

    fn manager() -> PluginManager {
        PluginManager::new(StateStore::new(), EventBus::new())
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Plugin {
        Plugin::new().with_engine(Arc::new(Recorder {
            name,
            log: log.clone(),
        }))
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        let sink = MemorySink::new();
        let manager = PluginManager::with_options(
            StateStore::new(),
            EventBus::new(),
            ManagerOptions {
                logger: Some(Logger::new(sink.clone())),
                ..ManagerOptions::default()
            },
        );

        assert!(manager.register("x", Plugin::new(), PluginMetadata::new().version("1.0.0")));
        assert!(!manager.register("x", Plugin::new(), PluginMetadata::new().version("2.0.0")));

        assert_eq!(manager.get("x").unwrap().metadata.version, "1.0.0");
        assert_eq!(manager.len(), 1);
        assert!(sink.contains("plugin_already_registered"));
    }

    #[test]
    fn init_order_follows_dependencies() {
        let manager = manager();
        manager.register("C", Plugin::new(), PluginMetadata::new().depends_on(["A", "B"]));
        manager.register("A", Plugin::new(), PluginMetadata::new());
        manager.register("B", Plugin::new(), PluginMetadata::new().depends_on(["A"]));

        assert_eq!(manager.calculate_init_order(), vec!["A", "B", "C"]);
    }

    #[test]
    fn cyclic_graph_is_warned_not_fatal() {
        let sink = MemorySink::new();
        let manager = PluginManager::with_options(
            StateStore::new(),
            EventBus::new(),
            ManagerOptions {
                logger: Some(Logger::new(sink.clone())),
                ..ManagerOptions::default()
            },
        );
        manager.register("X", idle(), PluginMetadata::new().depends_on(["Y"]));
        manager.register("Y", idle(), PluginMetadata::new().depends_on(["X"]));

        let mut order = manager.calculate_init_order();
        order.sort();
        assert_eq!(order, vec!["X", "Y"]);
        assert_eq!(sink.messages_at(LogLevel::Warn), vec!["dependency_cycle"]);
    }

    #[tokio::test]
    async fn init_runs_engines_in_order_and_announces_completion() {
        let events = EventBus::new();
        let announced = Arc::new(Mutex::new(0));
        let counter = announced.clone();
        events.on(topics::PLUGINS_INITIALIZED, move |_| {
            *counter.lock() += 1;
            Ok(())
        });
        let manager = PluginManager::new(StateStore::new(), events);
        let log = Arc::new(Mutex::new(Vec::new()));

        manager.register(
            "prayer",
            recorder("prayer", &log),
            PluginMetadata::new().depends_on(["settings"]),
        );
        manager.register("settings", recorder("settings", &log), PluginMetadata::new());
        manager.register("about", Plugin::new(), PluginMetadata::new());

        manager.init().await.unwrap();
        manager.init().await.unwrap();

        assert_eq!(*log.lock(), vec!["settings", "prayer"]);
        assert_eq!(*announced.lock(), 1);
        assert_eq!(manager.status("prayer"), Some(PluginStatus::Initialized));
        assert_eq!(manager.status("about"), Some(PluginStatus::Registered));
    }

    #[tokio::test]
    async fn failures_do_not_abort_later_plugins() {
        let audit = Arc::new(RecordingAudit::new());
        let manager = PluginManager::with_options(
            StateStore::new(),
            EventBus::new(),
            ManagerOptions {
                audit: Some(audit.clone()),
                ..ManagerOptions::default()
            },
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = Plugin::new().with_engine(Arc::new(Failing));
        let panicking = Plugin::new().with_engine(Arc::new(Panicking));
        manager.register("calendar", failing, PluginMetadata::new());
        manager.register("broken", panicking, PluginMetadata::new());
        manager.register("quran", recorder("quran", &log), PluginMetadata::new());

        manager.init().await.unwrap();

        assert_eq!(*log.lock(), vec!["quran"]);
        assert!(matches!(
            manager.status("calendar"),
            Some(PluginStatus::Failed(ref message))
                if message.contains("remote calendar unavailable")
        ));
        assert!(matches!(manager.status("broken"), Some(PluginStatus::Failed(_))));
        let stages = audit.stages();
        assert_eq!(
            stages.iter().filter(|s| **s == ShellAuditStage::PluginInitFailed).count(),
            2
        );
        assert_eq!(stages.last(), Some(&ShellAuditStage::PluginsInitialized));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_init_is_cut_off_by_timeout() {
        let manager = PluginManager::with_options(
            StateStore::new(),
            EventBus::new(),
            ManagerOptions {
                init_timeout: Some(Duration::from_secs(5)),
                ..ManagerOptions::default()
            },
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let hanging = Plugin::new().with_engine(Arc::new(Hanging));
        manager.register("audio", hanging, PluginMetadata::new());
        manager.register("hadith", recorder("hadith", &log), PluginMetadata::new());

        manager.init().await.unwrap();

        assert_eq!(manager.status("audio"), Some(PluginStatus::TimedOut));
        assert_eq!(*log.lock(), vec!["hadith"]);
    }

    #[tokio::test]
    async fn strict_policy_refuses_missing_dependencies() {
        let manager = PluginManager::with_options(
            StateStore::new(),
            EventBus::new(),
            ManagerOptions {
                dependency_policy: DependencyPolicy::Strict,
                ..ManagerOptions::default()
            },
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.register(
            "qibla",
            recorder("qibla", &log),
            PluginMetadata::new().depends_on(["compas"]),
        );

        let err = manager.init().await.unwrap_err();
        assert!(matches!(
            err,
            ShellError::MissingDependency { ref dependency, .. } if dependency == "compas"
        ));
        assert!(log.lock().is_empty());
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn strict_policy_refuses_cycles() {
        let manager = PluginManager::with_options(
            StateStore::new(),
            EventBus::new(),
            ManagerOptions {
                dependency_policy: DependencyPolicy::Strict,
                ..ManagerOptions::default()
            },
        );
        manager.register("X", Plugin::new(), PluginMetadata::new().depends_on(["Y"]));
        manager.register("Y", Plugin::new(), PluginMetadata::new().depends_on(["X"]));

        let err = manager.init().await.unwrap_err();
        assert!(matches!(err, ShellError::DependencyCycle(_)));
    }

    #[test]
    fn dependency_check_matches_init_policy() {
        let lenient = manager();
        lenient.register("qibla", idle(), PluginMetadata::new().depends_on(["compass"]));
        assert!(lenient.check_dependencies().is_ok());

        let sink = MemorySink::new();
        let strict = PluginManager::with_options(
            StateStore::new(),
            EventBus::new(),
            ManagerOptions {
                logger: Some(Logger::new(sink.clone())),
                dependency_policy: DependencyPolicy::Strict,
                ..ManagerOptions::default()
            },
        );
        strict.register("qibla", idle(), PluginMetadata::new().depends_on(["compass"]));
        let err = strict.check_dependencies().unwrap_err();
        assert!(matches!(
            err,
            ShellError::MissingDependency { ref plugin, .. } if plugin == "qibla"
        ));
        assert_eq!(sink.messages_at(LogLevel::Warn), vec!["dependency_missing"]);
        assert!(!strict.is_initialized());

        strict.register("compass", idle(), PluginMetadata::new());
        assert!(strict.check_dependencies().is_ok());
    }

    #[test]
    fn engine_accessor_downcasts() {
        let manager = manager();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.register("settings", recorder("settings", &log), PluginMetadata::new());

        let engine = manager.engine::<Recorder>("settings").unwrap();
        assert_eq!(engine.name, "settings");
        assert!(manager.engine::<Failing>("settings").is_none());
        assert!(manager.engine::<Recorder>("ghost").is_none());
    }

    #[test]
    fn minimal_bundle_without_container() {
        let state = StateStore::new();
        let manager = PluginManager::new(state.clone(), EventBus::new());

        let deps = manager.get_dependencies::<&str>(&[]).unwrap();
        deps.state.set("seen", json!(1));
        assert_eq!(state.get("seen"), Some(json!(1)));
        assert!(deps.plugins.is_empty());

        let err = manager.get_dependencies(&["audio_player"]).unwrap_err();
        assert!(matches!(err, ShellError::ServiceNotFound(_)));
    }

    #[test]
    fn bundle_through_container() {
        let state = StateStore::new();
        let events = EventBus::new();
        let container = DependencyContainer::new(state.clone(), events.clone());
        container.register("api_base", Arc::new(String::from("https://api.example")));
        let manager = PluginManager::with_options(
            state,
            events,
            ManagerOptions {
                container: Some(container),
                ..ManagerOptions::default()
            },
        );

        let deps = manager.get_dependencies(&["api_base"]).unwrap();
        assert_eq!(deps.service::<String>("api_base").unwrap().as_str(), "https://api.example");
    }
}
