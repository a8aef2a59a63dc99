use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Default)]
struct ViewIndex {
    owners: HashMap<String, String>,
    by_plugin: HashMap<String, BTreeSet<String>>,
}

/// Bookkeeping of which plugin declared which view ids. Introspection only;
/// rendering always goes through [`super::Router`].
#[derive(Debug, Clone, Default)]
pub struct ViewRegistry {
    index: Arc<RwLock<ViewIndex>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `view` as owned by `plugin`. A view id already owned by another
    /// plugin moves to the new owner.
    pub fn register(&self, view: &str, plugin: &str) {
        let mut index = self.index.write();
        if let Some(previous) = index.owners.insert(view.to_string(), plugin.to_string()) {
            if let Some(views) = index.by_plugin.get_mut(&previous) {
                views.remove(view);
            }
        }
        index
            .by_plugin
            .entry(plugin.to_string())
            .or_default()
            .insert(view.to_string());
    }

    pub fn plugin_for(&self, view: &str) -> Option<String> {
        self.index.read().owners.get(view).cloned()
    }

    /// View ids of `plugin`, sorted.
    pub fn views_of(&self, plugin: &str) -> Vec<String> {
        self.index
            .read()
            .by_plugin
            .get(plugin)
            .map(|views| views.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, view: &str) -> bool {
        self.index.read().owners.contains_key(view)
    }
}
