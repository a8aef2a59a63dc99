//! Named service locator handed to plugins at construction.
//!
//! Services are type-erased `Arc`s keyed by name. A factory runs at most once
//! successfully; its result is promoted into the instance table so every later
//! `resolve` returns the same `Arc`.

use std::any::{Any, type_name};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, ShellError};
use crate::events::EventBus;
use crate::logging::{LogLevel, Logger, emit, json_str};
use crate::plugins::PluginManager;
use crate::state::StateStore;

const TARGET: &str = "atrium::container";

/// Name the state store is registered under.
pub const STATE_SERVICE: &str = "state";
/// Name the event bus is registered under.
pub const EVENTS_SERVICE: &str = "events";

pub type ServiceHandle = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&DependencyContainer) -> anyhow::Result<ServiceHandle> + Send + Sync>;

#[derive(Default)]
struct ContainerInner {
    instances: RwLock<HashMap<String, ServiceHandle>>,
    factories: RwLock<HashMap<String, Factory>>,
    resolving: Mutex<HashSet<String>>,
}

#[derive(Clone)]
pub struct DependencyContainer {
    inner: Arc<ContainerInner>,
    state: StateStore,
    events: EventBus,
    logger: Option<Logger>,
}

impl DependencyContainer {
    pub fn new(state: StateStore, events: EventBus) -> Self {
        let container = Self {
            inner: Arc::new(ContainerInner::default()),
            state,
            events,
            logger: None,
        };
        container.register_core();
        container
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    fn register_core(&self) {
        self.register(STATE_SERVICE, Arc::new(self.state.clone()));
        self.register(EVENTS_SERVICE, Arc::new(self.events.clone()));
    }

    /// Store a ready singleton, replacing any instance or factory of the same name.
    pub fn register<T>(&self, name: impl Into<String>, instance: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        let name = name.into();
        self.inner.factories.write().remove(&name);
        self.inner.instances.write().insert(name, instance);
    }

    /// Store a lazy singleton. The factory receives the container so it can
    /// resolve its own dependencies.
    pub fn register_factory<T, F>(&self, name: impl Into<String>, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&DependencyContainer) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        let name = name.into();
        let erased: Factory = Arc::new(move |container| {
            factory(container).map(|service| service as ServiceHandle)
        });
        self.inner.instances.write().remove(&name);
        self.inner.factories.write().insert(name, erased);
    }

    /// Whether `name` is known, without running its factory.
    pub fn has(&self, name: &str) -> bool {
        self.inner.instances.read().contains_key(name)
            || self.inner.factories.read().contains_key(name)
    }

    pub fn resolve<T>(&self, name: &str) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let handle = self.resolve_handle(name)?;
        handle
            .downcast::<T>()
            .map_err(|_| ShellError::ServiceTypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Resolve every name, failing the whole call on the first unresolvable one.
    pub fn resolve_many<S: AsRef<str>>(&self, names: &[S]) -> Result<Services> {
        let mut services = Services::default();
        for name in names {
            let name = name.as_ref();
            let handle = self.resolve_handle(name)?;
            services.entries.insert(name.to_string(), handle);
        }
        Ok(services)
    }

    /// Build the bundle passed to every plugin: the core services plus `additional`.
    pub fn create_dependencies<S: AsRef<str>>(
        &self,
        plugins: &PluginManager,
        additional: &[S],
    ) -> Result<Dependencies> {
        let services = self.resolve_many(additional)?;
        Ok(Dependencies {
            state: self.state.clone(),
            events: self.events.clone(),
            plugins: plugins.clone(),
            services,
        })
    }

    /// Drop every instance and factory, the core registrations included.
    /// Intended for teardown between tests; `create_dependencies` keeps working.
    pub fn clear(&self) {
        self.inner.instances.write().clear();
        self.inner.factories.write().clear();
    }

    fn resolve_handle(&self, name: &str) -> Result<ServiceHandle> {
        if let Some(instance) = self.inner.instances.read().get(name) {
            return Ok(Arc::clone(instance));
        }

        let factory = self
            .inner
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ShellError::ServiceNotFound(name.to_string()))?;

        let built = {
            let Some(_guard) = ResolvingGuard::enter(&self.inner.resolving, name) else {
                return Err(ShellError::CircularFactory(name.to_string()));
            };
            factory(self)
        };

        let instance = built.map_err(|err| {
            emit(
                self.logger.as_ref(),
                LogLevel::Error,
                TARGET,
                "factory_failed",
                [json_str("service", name), json_str("error", format!("{err:#}"))],
            );
            match err.downcast::<ShellError>() {
                Ok(circular @ ShellError::CircularFactory(_)) => circular,
                Ok(other) => ShellError::ServiceFactory {
                    name: name.to_string(),
                    message: other.to_string(),
                },
                Err(err) => ShellError::ServiceFactory {
                    name: name.to_string(),
                    message: format!("{err:#}"),
                },
            }
        })?;

        // A nested resolve may already have promoted this name; keep the first instance.
        let instance = {
            let mut instances = self.inner.instances.write();
            Arc::clone(
                instances
                    .entry(name.to_string())
                    .or_insert_with(|| instance),
            )
        };
        self.inner.factories.write().remove(name);
        emit(
            self.logger.as_ref(),
            LogLevel::Debug,
            TARGET,
            "factory_promoted",
            [json_str("service", name)],
        );
        Ok(instance)
    }
}

/// Marks a name as being built; unmarked on drop, so a panicking factory
/// does not leave the name stuck.
struct ResolvingGuard<'a> {
    resolving: &'a Mutex<HashSet<String>>,
    name: String,
}

impl<'a> ResolvingGuard<'a> {
    fn enter(resolving: &'a Mutex<HashSet<String>>, name: &str) -> Option<Self> {
        if !resolving.lock().insert(name.to_string()) {
            return None;
        }
        Some(Self {
            resolving,
            name: name.to_string(),
        })
    }
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        self.resolving.lock().remove(&self.name);
    }
}

/// Services resolved for one plugin, keyed by the name they were requested under.
#[derive(Clone, Default)]
pub struct Services {
    entries: HashMap<String, ServiceHandle>,
}

impl Services {
    pub fn get<T>(&self, name: &str) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let handle = self
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| ShellError::ServiceNotFound(name.to_string()))?;
        handle
            .downcast::<T>()
            .map_err(|_| ShellError::ServiceTypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Services").field("names", &names).finish()
    }
}

/// The capability bundle every plugin is constructed with. This is the only
/// way plugins reach shared services or each other.
#[derive(Clone)]
pub struct Dependencies {
    pub state: StateStore,
    pub events: EventBus,
    pub plugins: PluginManager,
    pub services: Services,
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl Dependencies {
    /// Bundle with the core services only.
    pub fn minimal(state: StateStore, events: EventBus, plugins: PluginManager) -> Self {
        Self {
            state,
            events,
            plugins,
            services: Services::default(),
        }
    }

    pub fn service<T>(&self, name: &str) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.services.get(name)
    }
}
