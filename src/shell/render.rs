use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::events::panic_message;
use crate::logging::{LogLevel, Logger, emit, json_str};
use crate::metrics::ShellMetrics;
use crate::plugins::{MountTarget, PluginManager};
use crate::routing::Router;

use super::audit::{ShellAudit, ShellAuditEventBuilder, ShellAuditStage};

const TARGET: &str = "atrium::shell";

/// Everything needed to turn a view id into a `render` call. Cloned into the
/// shell's event handlers.
#[derive(Clone)]
pub(crate) struct Renderer {
    pub router: Router,
    pub plugins: PluginManager,
    pub mount: Arc<dyn MountTarget>,
    pub logger: Option<Logger>,
    pub audit: Option<Arc<dyn ShellAudit>>,
    pub metrics: Option<Arc<Mutex<ShellMetrics>>>,
}

impl Renderer {
    /// Render the view owning `view_id` into the mount target. Returns whether
    /// a view ran to completion.
    pub fn render(&self, view_id: &str) -> bool {
        let plugin = self.router.resolve(view_id);
        let Some((plugin, view)) = plugin.and_then(|name| {
            let view = self.plugins.view(&name)?;
            Some((name, view))
        }) else {
            self.log(LogLevel::Debug, "view_unresolved", [json_str("view", view_id)]);
            self.audit(
                ShellAuditEventBuilder::new(ShellAuditStage::ViewUnresolved)
                    .detail("view", view_id),
            );
            self.count(ShellMetrics::record_unresolved);
            return false;
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| view.render(self.mount.as_ref()))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        match outcome {
            Ok(()) => {
                self.log(
                    LogLevel::Debug,
                    "view_rendered",
                    [json_str("view", view_id), json_str("plugin", plugin.as_str())],
                );
                self.audit(
                    ShellAuditEventBuilder::new(ShellAuditStage::ViewRendered)
                        .detail("view", view_id)
                        .detail("plugin", plugin),
                );
                self.count(ShellMetrics::record_render);
                true
            }
            Err(error) => {
                self.log(
                    LogLevel::Error,
                    "view_render_failed",
                    [
                        json_str("view", view_id),
                        json_str("plugin", plugin),
                        json_str("error", error),
                    ],
                );
                self.count(ShellMetrics::record_render_failure);
                false
            }
        }
    }

    pub fn count(&self, record: impl FnOnce(&mut ShellMetrics)) {
        if let Some(metrics) = self.metrics.as_ref() {
            let mut guard = metrics.lock();
            record(&mut *guard);
        }
    }

    pub fn log(
        &self,
        level: LogLevel,
        message: &str,
        fields: impl IntoIterator<Item = (String, Value)>,
    ) {
        emit(self.logger.as_ref(), level, TARGET, message, fields);
    }

    pub fn audit(&self, builder: ShellAuditEventBuilder) {
        if let Some(audit) = self.audit.as_ref() {
            audit.record(builder.finish());
        }
    }
}
