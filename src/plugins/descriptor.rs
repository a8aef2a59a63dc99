//! Declarative registration entries the shell iterates over at boot.

use std::sync::Arc;

use crate::container::Dependencies;

use super::{Engine, Plugin, PluginMetadata, View};

/// Builds a plugin from its dependency bundle. Runs exactly once.
pub type PluginFactory = Box<dyn FnOnce(&Dependencies) -> anyhow::Result<Plugin> + Send>;

pub struct PluginDescriptor {
    pub name: String,
    pub metadata: PluginMetadata,
    factory: PluginFactory,
}

impl PluginDescriptor {
    pub fn new<F>(name: impl Into<String>, metadata: PluginMetadata, factory: F) -> Self
    where
        F: FnOnce(&Dependencies) -> anyhow::Result<Plugin> + Send + 'static,
    {
        Self {
            name: name.into(),
            metadata,
            factory: Box::new(factory),
        }
    }

    /// A plugin with logic but nothing to render.
    pub fn engine_only<E, F>(name: impl Into<String>, metadata: PluginMetadata, engine: F) -> Self
    where
        E: Engine,
        F: FnOnce(&Dependencies) -> anyhow::Result<E> + Send + 'static,
    {
        Self::new(name, metadata, move |deps| {
            let engine = Arc::new(engine(deps)?);
            Ok(Plugin::new().with_engine(engine))
        })
    }

    /// A plugin whose view is built from the bundle plus the engine constructed
    /// just before it.
    pub fn engine_with_view<E, V, FE, FV>(
        name: impl Into<String>,
        metadata: PluginMetadata,
        engine: FE,
        view: FV,
    ) -> Self
    where
        E: Engine,
        V: View + 'static,
        FE: FnOnce(&Dependencies) -> anyhow::Result<E> + Send + 'static,
        FV: FnOnce(&Dependencies, Arc<E>) -> anyhow::Result<V> + Send + 'static,
    {
        Self::new(name, metadata, move |deps| {
            let engine = Arc::new(engine(deps)?);
            let view = Arc::new(view(deps, Arc::clone(&engine))?);
            Ok(Plugin::new().with_engine(engine).with_view(view))
        })
    }

    /// A static screen with no engine.
    pub fn view_only<V, F>(name: impl Into<String>, metadata: PluginMetadata, view: F) -> Self
    where
        V: View + 'static,
        F: FnOnce(&Dependencies) -> anyhow::Result<V> + Send + 'static,
    {
        Self::new(name, metadata, move |deps| {
            Ok(Plugin::new().with_view(Arc::new(view(deps)?)))
        })
    }

    pub fn build(self, deps: &Dependencies) -> anyhow::Result<Plugin> {
        (self.factory)(deps)
    }

    pub fn into_parts(self) -> (String, PluginMetadata, PluginFactory) {
        (self.name, self.metadata, self.factory)
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
