//! Plugin capability contracts and the records the manager keeps for them.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod descriptor;
pub mod manager;
pub mod order;

pub use descriptor::{PluginDescriptor, PluginFactory};
pub use manager::{DependencyPolicy, ManagerOptions, PluginManager};
pub use order::{DependencyReport, MissingDependency};

/// Upcast used by [`PluginManager::engine`] to hand out concrete engine types.
pub trait AsAnyArc: Any + Send + Sync {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Non-visual half of a plugin.
#[async_trait]
pub trait Engine: AsAnyArc {
    /// One-time setup, awaited in dependency order. Every engine this plugin
    /// depends on has finished `init` before this runs.
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Opaque render target. The shell passes it through without looking inside;
/// views downcast it to the surface type they expect.
pub trait MountTarget: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Visual half of a plugin.
pub trait View: Send + Sync {
    fn render(&self, mount: &dyn MountTarget) -> anyhow::Result<()>;
}

/// Engine and view of one plugin, both optional.
#[derive(Clone, Default)]
pub struct Plugin {
    pub engine: Option<Arc<dyn Engine>>,
    pub view: Option<Arc<dyn View>>,
}

impl Plugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine<E: Engine>(mut self, engine: Arc<E>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_view<V: View + 'static>(mut self, view: Arc<V>) -> Self {
        self.view = Some(view);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.engine.is_none() && self.view.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginMetadata {
    pub version: String,
    /// Plugins that must finish `init` before this one.
    pub dependencies: Vec<String>,
    /// Route patterns this plugin renders.
    pub routes: Vec<String>,
    /// Extra container services resolved into this plugin's dependency bundle.
    pub services: Vec<String>,
    /// Plugins with an explicit value are visited first, lowest value first.
    /// Dependencies still initialize before their dependents.
    pub init_order: Option<i32>,
}

impl Default for PluginMetadata {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            dependencies: Vec::new(),
            routes: Vec::new(),
            services: Vec::new(),
            init_order: None,
        }
    }
}

impl PluginMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn routes<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn services<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn init_order(mut self, order: i32) -> Self {
        self.init_order = Some(order);
        self
    }
}

/// A registered plugin. Immutable once stored by the manager.
#[derive(Clone)]
pub struct PluginRecord {
    pub name: String,
    pub engine: Option<Arc<dyn Engine>>,
    pub view: Option<Arc<dyn View>>,
    pub metadata: PluginMetadata,
}

impl std::fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRecord")
            .field("name", &self.name)
            .field("engine", &self.engine.is_some())
            .field("view", &self.view.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Lifecycle position of a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    Registered,
    Initialized,
    Failed(String),
    TimedOut,
}
