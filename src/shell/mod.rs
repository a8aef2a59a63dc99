//! Application shell: wires the context, plugins, routing and persistence
//! together and drives boot.

pub mod audit;
mod config;
mod render;

pub use config::ShellConfig;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::container::DependencyContainer;
use crate::error::Result;
use crate::events::{EventBus, HandlerId, topics};
use crate::logging::{LogLevel, Logger, json_kv, json_str};
use crate::metrics::{MetricSnapshot, ShellMetrics};
use crate::persistence::{KeyValueStore, PersistenceGateway};
use crate::plugins::{
    ManagerOptions, MountTarget, PluginDescriptor, PluginManager, PluginStatus,
};
use crate::routing::{Router, ViewRegistry};
use crate::state::{StateRecord, StateStore, Unsubscribe, keys};

use audit::{ShellAuditEventBuilder, ShellAuditStage};
use render::Renderer;

/// Name the router is registered under in the container.
pub const ROUTER_SERVICE: &str = "router";
/// Name the view registry is registered under in the container.
pub const VIEWS_SERVICE: &str = "views";

/// The shared services every plugin reaches through its dependency bundle.
/// Built once per shell; tests build a fresh one each.
#[derive(Clone)]
pub struct ShellContext {
    pub state: StateStore,
    pub events: EventBus,
    pub container: DependencyContainer,
}

impl ShellContext {
    pub fn new(logger: Option<Logger>) -> Self {
        let (state, events) = match logger.clone() {
            Some(logger) => (
                StateStore::with_logger(logger.clone()),
                EventBus::with_logger(logger),
            ),
            None => (StateStore::new(), EventBus::new()),
        };
        let container = DependencyContainer::new(state.clone(), events.clone());
        let container = match logger {
            Some(logger) => container.with_logger(logger),
            None => container,
        };
        Self {
            state,
            events,
            container,
        }
    }
}

pub struct Shell {
    config: ShellConfig,
    context: ShellContext,
    views: ViewRegistry,
    gateway: PersistenceGateway,
    renderer: Renderer,
    started: Instant,
    booted: AtomicBool,
    subscriptions: Mutex<Vec<Unsubscribe>>,
    handlers: Mutex<Vec<(&'static str, HandlerId)>>,
}

impl Shell {
    pub fn new(
        config: ShellConfig,
        store: Arc<dyn KeyValueStore>,
        mount: Arc<dyn MountTarget>,
    ) -> Self {
        let context = ShellContext::new(config.logger.clone());
        let plugins = PluginManager::with_options(
            context.state.clone(),
            context.events.clone(),
            ManagerOptions {
                container: Some(context.container.clone()),
                logger: config.logger.clone(),
                audit: config.audit.clone(),
                init_timeout: config.init_timeout,
                dependency_policy: config.dependency_policy,
            },
        );
        let router = match config.logger.clone() {
            Some(logger) => Router::with_logger(logger),
            None => Router::new(),
        };
        let views = ViewRegistry::new();
        context
            .container
            .register(ROUTER_SERVICE, Arc::new(router.clone()));
        context
            .container
            .register(VIEWS_SERVICE, Arc::new(views.clone()));

        let gateway = PersistenceGateway::new(store, config.storage_namespace.clone());
        let gateway = match config.logger.clone() {
            Some(logger) => gateway.with_logger(logger),
            None => gateway,
        };

        let renderer = Renderer {
            router,
            plugins,
            mount,
            logger: config.logger.clone(),
            audit: config.audit.clone(),
            metrics: config.metrics_handle(),
        };

        Self {
            config,
            context,
            views,
            gateway,
            renderer,
            started: Instant::now(),
            booted: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Build a plugin from `descriptor` and register it with the manager, the
    /// router and the view registry.
    ///
    /// A requested service that cannot be resolved is a wiring bug and is
    /// returned. A factory that fails is logged and the plugin is skipped.
    pub fn register(&self, descriptor: PluginDescriptor) -> Result<()> {
        let (name, metadata, factory) = descriptor.into_parts();
        for pattern in &metadata.routes {
            Router::validate(pattern)?;
        }

        let deps = self.renderer.plugins.get_dependencies(&metadata.services)?;
        let plugin = match factory(&deps) {
            Ok(plugin) => plugin,
            Err(err) => {
                self.renderer.log(
                    LogLevel::Error,
                    "plugin_factory_failed",
                    [json_str("plugin", name.as_str()), json_str("error", format!("{err:#}"))],
                );
                self.renderer.audit(
                    ShellAuditEventBuilder::new(ShellAuditStage::RegistrationRejected)
                        .detail("plugin", name.as_str())
                        .detail("error", format!("{err:#}")),
                );
                return Ok(());
            }
        };

        let routes = metadata.routes.clone();
        if !self.renderer.plugins.register(&name, plugin, metadata) {
            return Ok(());
        }
        self.renderer.router.register_multiple(&routes, &name)?;
        for route in &routes {
            self.views.register(route, &name);
        }
        Ok(())
    }

    pub fn register_all<I>(&self, descriptors: I) -> Result<()>
    where
        I: IntoIterator<Item = PluginDescriptor>,
    {
        for descriptor in descriptors {
            self.register(descriptor)?;
        }
        Ok(())
    }

    /// Restore persisted state, start listening for view events, initialize
    /// every plugin and render the current view. A second call is a no-op
    /// once a boot has succeeded; a failed boot leaves nothing attached and
    /// may be retried.
    pub async fn boot(&self) -> Result<()> {
        self.renderer.plugins.check_dependencies()?;
        if self.booted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.restore_state();
        self.install_autosave();
        self.install_view_handlers();

        if let Err(err) = self.renderer.plugins.init().await {
            self.detach();
            self.booted.store(false, Ordering::SeqCst);
            return Err(err);
        }
        self.record_init_outcomes();

        let view = self.current_view();
        self.context.state.set(keys::CURRENT_VIEW.name(), json!(view));
        self.renderer.render(&view);
        self.renderer.log(
            LogLevel::Info,
            "shell_booted",
            [
                json_str("view", view),
                json_kv("plugins", self.renderer.plugins.len()),
            ],
        );
        Ok(())
    }

    /// Ask the shell to show `view_id`. Only takes effect after `boot`.
    pub fn navigate(&self, view_id: &str) {
        self.context.events.emit(topics::VIEW_CHANGE, json!(view_id));
    }

    /// Re-render the current view. Only takes effect after `boot`.
    pub fn refresh(&self) {
        self.context.events.emit(topics::VIEW_REFRESH, Value::Null);
    }

    /// Render `view_id` directly, bypassing the event bus and leaving the
    /// current view untouched.
    pub fn render(&self, view_id: &str) -> bool {
        self.renderer.render(view_id)
    }

    /// The last view requested, or the configured initial view.
    pub fn current_view(&self) -> String {
        self.context
            .state
            .get_typed(&keys::CURRENT_VIEW)
            .ok()
            .flatten()
            .unwrap_or_else(|| self.config.initial_view.clone())
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::SeqCst)
    }

    /// Detach the shell's view handlers and auto-save subscription.
    pub fn shutdown(&self) {
        self.detach();
        if let Some(snapshot) = self.metrics_snapshot() {
            self.renderer.log(
                LogLevel::Info,
                "shell_metrics",
                snapshot.as_fields(),
            );
        }
    }

    fn detach(&self) {
        for (topic, id) in self.handlers.lock().drain(..) {
            self.context.events.off(topic, id);
        }
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
    }

    pub fn metrics_snapshot(&self) -> Option<MetricSnapshot> {
        self.renderer
            .metrics
            .as_ref()
            .map(|metrics| metrics.lock().snapshot(self.started.elapsed()))
    }

    /// Write the current metrics snapshot to the logger under the configured target.
    pub fn log_metrics(&self) {
        let (Some(logger), Some(snapshot)) = (self.config.logger.as_ref(), self.metrics_snapshot())
        else {
            return;
        };
        let _ = logger.log_event(snapshot.to_log_event(&self.config.metrics_target));
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn context(&self) -> &ShellContext {
        &self.context
    }

    pub fn state(&self) -> &StateStore {
        &self.context.state
    }

    pub fn events(&self) -> &EventBus {
        &self.context.events
    }

    pub fn container(&self) -> &DependencyContainer {
        &self.context.container
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.renderer.plugins
    }

    pub fn router(&self) -> &Router {
        &self.renderer.router
    }

    pub fn views(&self) -> &ViewRegistry {
        &self.views
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.gateway
    }

    fn restore_state(&self) {
        let saved = self.gateway.load();
        let mut restored = StateRecord::new();
        for (key, value) in saved {
            if !self.config.is_persistent(&key) {
                continue;
            }
            if let Err(reason) = keys::validate(&key, &value) {
                self.renderer.log(
                    LogLevel::Warn,
                    "restored_value_dropped",
                    [json_str("key", key), json_str("error", reason)],
                );
                continue;
            }
            restored.insert(key, value);
        }

        let count = restored.len();
        if count > 0 {
            self.context.state.update(restored);
        }
        self.renderer.log(LogLevel::Info, "state_restored", [json_kv("keys", count)]);
        self.renderer.audit(
            ShellAuditEventBuilder::new(ShellAuditStage::StateRestored).detail("keys", count),
        );
    }

    fn install_autosave(&self) {
        let store = self.context.state.clone();
        let gateway = self.gateway.clone();
        let persistent = self.config.persistent_keys.clone();
        let renderer = self.renderer.clone();

        let subscription = self.context.state.subscribe(move |change| {
            if !persistent.iter().any(|key| change.touches(key)) {
                return;
            }
            if gateway.save(&store.get_all(), &persistent) {
                renderer.count(ShellMetrics::record_save);
                renderer.audit(
                    ShellAuditEventBuilder::new(ShellAuditStage::StateSaved)
                        .detail("trigger", change.key()),
                );
            }
        });
        self.subscriptions.lock().push(subscription);
    }

    fn install_view_handlers(&self) {
        let state = self.context.state.clone();
        let renderer = self.renderer.clone();
        let on_change = self.context.events.on(topics::VIEW_CHANGE, move |payload| {
            let view_id = payload
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("expected a view id string, got {payload}"))?;
            renderer.count(ShellMetrics::record_event);
            state.set(keys::CURRENT_VIEW.name(), json!(view_id));
            renderer.render(view_id);
            Ok(())
        });

        let state = self.context.state.clone();
        let renderer = self.renderer.clone();
        let initial_view = self.config.initial_view.clone();
        let on_refresh = self.context.events.on(topics::VIEW_REFRESH, move |_| {
            renderer.count(ShellMetrics::record_event);
            let view = state
                .get_typed(&keys::CURRENT_VIEW)?
                .unwrap_or_else(|| initial_view.clone());
            renderer.render(&view);
            Ok(())
        });

        self.handlers.lock().extend([
            (topics::VIEW_CHANGE, on_change),
            (topics::VIEW_REFRESH, on_refresh),
        ]);
    }

    fn record_init_outcomes(&self) {
        let plugins = &self.renderer.plugins;
        let (mut initialized, mut failed) = (0, 0);
        for name in plugins.names() {
            match plugins.status(&name) {
                Some(PluginStatus::Initialized) => initialized += 1,
                Some(PluginStatus::Failed(_)) | Some(PluginStatus::TimedOut) => failed += 1,
                _ => {}
            }
        }
        self.renderer
            .count(|metrics| metrics.record_init(initialized, failed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use crate::persistence::MemoryStore;
    use crate::plugins::{Engine, PluginMetadata, View};
    use super::audit::RecordingAudit;
    use std::any::Any;

    #[derive(Default)]
    struct Screen {
        rendered: Mutex<Vec<String>>,
    }

    impl MountTarget for Screen {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl Screen {
        fn log(&self) -> Vec<String> {
            self.rendered.lock().clone()
        }
    }

    struct Label(&'static str);

    impl View for Label {
        fn render(&self, mount: &dyn MountTarget) -> anyhow::Result<()> {
            let screen = mount
                .as_any()
                .downcast_ref::<Screen>()
                .ok_or_else(|| anyhow::anyhow!("unexpected mount target"))?;
            screen.rendered.lock().push(self.0.to_string());
            Ok(())
        }
    }

    struct Faulty;

    impl View for Faulty {
        fn render(&self, _mount: &dyn MountTarget) -> anyhow::Result<()> {
            anyhow::bail!("template missing")
        }
    }

    struct Settings {
        state: StateStore,
    }

    #[async_trait::async_trait]
    impl Engine for Settings {
        async fn init(&self) -> anyhow::Result<()> {
            if self.state.get(keys::LANGUAGE.name()).is_none() {
                self.state.set(keys::LANGUAGE.name(), json!("en"));
            }
            Ok(())
        }
    }

    fn settings(deps: &crate::Dependencies) -> anyhow::Result<Settings> {
        Ok(Settings {
            state: deps.state.clone(),
        })
    }

    fn label(name: &'static str, routes: &[&str]) -> PluginDescriptor {
        let metadata = PluginMetadata::new().routes(routes.iter().copied());
        PluginDescriptor::view_only(name, metadata, move |_| Ok(Label(name)))
    }

    fn shell_with(config: ShellConfig, store: MemoryStore) -> (Shell, Arc<Screen>) {
        let screen = Arc::new(Screen::default());
        let shell = Shell::new(config, Arc::new(store), screen.clone());
        (shell, screen)
    }

    #[tokio::test]
    async fn boot_renders_initial_view_and_follows_navigation() {
        let (shell, screen) = shell_with(ShellConfig::default(), MemoryStore::new());
        shell.register(label("home", &["home"])).unwrap();
        shell.register(label("coran", &["coran*"])).unwrap();

        shell.boot().await.unwrap();
        shell.navigate("coran-surahs");
        shell.navigate("qibla");
        assert_eq!(shell.current_view(), "qibla");
        shell.refresh();
        shell.navigate("home");
        shell.refresh();

        assert_eq!(screen.log(), vec!["home", "coran", "home", "home"]);
        assert_eq!(shell.views().plugin_for("coran*").as_deref(), Some("coran"));
    }

    #[tokio::test]
    async fn persisted_state_is_restored_and_saved() {
        let store = MemoryStore::new();
        let seed = PersistenceGateway::new(Arc::new(store.clone()), "atrium.state");
        let mut saved = StateRecord::new();
        saved.insert("theme".into(), json!("dark"));
        saved.insert("location".into(), json!("not an object"));
        saved.insert("scratch".into(), json!(42));
        seed.save(&saved, &["theme", "location", "scratch"]);

        let mut config = ShellConfig::default();
        config.enable_metrics();
        let (shell, _) = shell_with(config, store);
        shell
            .register(PluginDescriptor::engine_only("settings", PluginMetadata::new(), settings))
            .unwrap();
        shell.boot().await.unwrap();

        let state = shell.state();
        assert_eq!(state.get_typed(&keys::THEME).unwrap(), Some(keys::Theme::Dark));
        assert!(state.get("location").is_none());
        assert!(state.get("scratch").is_none());

        let reloaded = shell.gateway().load();
        assert_eq!(reloaded.get("language"), Some(&json!("en")));
        assert_eq!(reloaded.get("theme"), Some(&json!("dark")));

        state.set("scratch", json!(1));
        let snapshot = shell.metrics_snapshot().unwrap();
        assert_eq!(snapshot.state_saves, 1);
        assert_eq!(snapshot.plugins_initialized, 1);
    }

    #[tokio::test]
    async fn unknown_service_fails_registration() {
        let (shell, _) = shell_with(ShellConfig::default(), MemoryStore::new());
        let descriptor = PluginDescriptor::view_only(
            "audio",
            PluginMetadata::new().services(["audio_player"]),
            |_| Ok(Label("audio")),
        );
        let err = shell.register(descriptor).unwrap_err();
        assert!(matches!(
            err,
            crate::ShellError::ServiceNotFound(ref name) if name == "audio_player"
        ));
        assert!(shell.plugins().is_empty());
    }

    #[tokio::test]
    async fn failing_factory_skips_the_plugin() {
        let sink = MemorySink::new();
        let config = ShellConfig {
            logger: Some(Logger::new(sink.clone())),
            ..ShellConfig::default()
        };
        let (shell, _) = shell_with(config, MemoryStore::new());
        let descriptor = PluginDescriptor::view_only::<Label, _>(
            "hadith",
            PluginMetadata::new().routes(["hadith*"]),
            |_| anyhow::bail!("collection index unreadable"),
        );

        shell.register(descriptor).unwrap();
        assert!(shell.plugins().get("hadith").is_none());
        assert!(shell.router().is_empty());
        assert!(sink.contains("plugin_factory_failed"));
    }

    #[tokio::test]
    async fn duplicate_plugin_does_not_add_routes() {
        let (shell, _) = shell_with(ShellConfig::default(), MemoryStore::new());
        shell.register(label("home", &["home"])).unwrap();
        shell.register(label("home", &["dashboard"])).unwrap();

        assert_eq!(shell.router().routes(), vec![("home".to_string(), "home".to_string())]);
    }

    #[tokio::test]
    async fn render_outcomes_are_audited_and_counted() {
        let audit = Arc::new(RecordingAudit::new());
        let mut config = ShellConfig {
            audit: Some(audit.clone()),
            ..ShellConfig::default()
        };
        config.enable_metrics();
        let (shell, _) = shell_with(config, MemoryStore::new());
        shell.register(label("home", &["home"])).unwrap();
        shell
            .register(PluginDescriptor::view_only(
                "broken",
                PluginMetadata::new().routes(["broken"]),
                |_| Ok(Faulty),
            ))
            .unwrap();

        shell.boot().await.unwrap();
        assert!(!shell.render("broken"));
        assert!(!shell.render("nowhere"));

        let snapshot = shell.metrics_snapshot().unwrap();
        assert_eq!(snapshot.renders, 1);
        assert_eq!(snapshot.render_failures, 1);
        assert_eq!(snapshot.unresolved_renders, 1);
        assert!(audit.stages().contains(&ShellAuditStage::ViewUnresolved));
    }

    #[tokio::test]
    async fn malformed_view_change_payload_is_isolated() {
        let (shell, screen) = shell_with(ShellConfig::default(), MemoryStore::new());
        shell.register(label("home", &["home"])).unwrap();
        shell.boot().await.unwrap();

        shell.events().emit(topics::VIEW_CHANGE, json!({"view": "home"}));
        assert_eq!(screen.log(), vec!["home"]);
        assert_eq!(shell.current_view(), "home");
    }

    #[tokio::test]
    async fn strict_boot_failure_can_be_retried() {
        let config = ShellConfig {
            dependency_policy: crate::plugins::DependencyPolicy::Strict,
            ..ShellConfig::default()
        };
        let (shell, screen) = shell_with(config, MemoryStore::new());
        shell
            .register(PluginDescriptor::engine_only(
                "qibla",
                PluginMetadata::new().depends_on(["compass"]),
                settings,
            ))
            .unwrap();
        shell.register(label("home", &["home"])).unwrap();

        let err = shell.boot().await.unwrap_err();
        assert!(matches!(
            err,
            crate::ShellError::MissingDependency { ref dependency, .. } if dependency == "compass"
        ));
        assert!(!shell.is_booted());
        assert_eq!(shell.events().handler_count(topics::VIEW_CHANGE), 0);
        assert_eq!(shell.state().subscriber_count(), 0);
        assert!(screen.log().is_empty());

        shell
            .register(PluginDescriptor::engine_only(
                "compass",
                PluginMetadata::new(),
                settings,
            ))
            .unwrap();
        shell.boot().await.unwrap();

        assert!(shell.is_booted());
        assert!(shell.plugins().is_initialized());
        assert_eq!(shell.plugins().status("qibla"), Some(PluginStatus::Initialized));
        assert_eq!(shell.events().handler_count(topics::VIEW_CHANGE), 1);
        assert_eq!(screen.log(), vec!["home"]);
    }

    #[tokio::test]
    async fn shutdown_detaches_handlers() {
        let (shell, screen) = shell_with(ShellConfig::default(), MemoryStore::new());
        shell.register(label("home", &["home"])).unwrap();
        shell.boot().await.unwrap();
        shell.boot().await.unwrap();
        shell.shutdown();

        shell.refresh();
        assert_eq!(screen.log(), vec!["home"]);
        assert_eq!(shell.events().handler_count(topics::VIEW_CHANGE), 0);
    }
}
