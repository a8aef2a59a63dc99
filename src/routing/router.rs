use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use crate::error::{Result, ShellError};
use crate::logging::{LogLevel, Logger, emit, json_str};
use crate::plugins::{PluginManager, View};

const TARGET: &str = "atrium::routing";

/// Marker matching zero or more characters.
pub const WILDCARD: char = '*';

#[derive(Debug, Clone)]
struct Route {
    pattern: String,
    matcher: Regex,
    plugin: String,
}

/// Ordered pattern table mapping view ids to the plugin that renders them.
/// The first registered match wins.
#[derive(Clone, Default)]
pub struct Router {
    routes: Arc<RwLock<Vec<Route>>>,
    logger: Option<Logger>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(logger: Logger) -> Self {
        Self {
            routes: Arc::default(),
            logger: Some(logger),
        }
    }

    pub fn register(&self, pattern: &str, plugin: &str) -> Result<()> {
        let matcher = compile(pattern)?;
        self.routes.write().push(Route {
            pattern: pattern.to_string(),
            matcher,
            plugin: plugin.to_string(),
        });
        emit(
            self.logger.as_ref(),
            LogLevel::Debug,
            TARGET,
            "route_registered",
            [json_str("pattern", pattern), json_str("plugin", plugin)],
        );
        Ok(())
    }

    /// Register every pattern for `plugin`, stopping at the first invalid one.
    pub fn register_multiple<S: AsRef<str>>(&self, patterns: &[S], plugin: &str) -> Result<()> {
        for pattern in patterns {
            self.register(pattern.as_ref(), plugin)?;
        }
        Ok(())
    }

    /// Check that `pattern` would be accepted by [`Router::register`].
    pub fn validate(pattern: &str) -> Result<()> {
        compile(pattern).map(|_| ())
    }

    /// Name of the plugin owning `view_id`.
    pub fn resolve(&self, view_id: &str) -> Option<String> {
        self.routes
            .read()
            .iter()
            .find(|route| route.matcher.is_match(view_id))
            .map(|route| route.plugin.clone())
    }

    /// View of the owning plugin. A missing route and a plugin without a view
    /// both mean nothing to render.
    pub fn get_view(&self, view_id: &str, plugins: &PluginManager) -> Option<Arc<dyn View>> {
        let plugin = self.resolve(view_id)?;
        plugins.view(&plugin)
    }

    /// `(pattern, plugin)` pairs in registration order.
    pub fn routes(&self) -> Vec<(String, String)> {
        self.routes
            .read()
            .iter()
            .map(|route| (route.pattern.clone(), route.plugin.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    if pattern.is_empty() {
        return Err(ShellError::InvalidRoute {
            pattern: pattern.to_string(),
            reason: "pattern is empty".to_string(),
        });
    }

    let body = pattern
        .split(WILDCARD)
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).map_err(|err| ShellError::InvalidRoute {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}
