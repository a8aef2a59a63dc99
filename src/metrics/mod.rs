//! Shell counters, snapshotted into a log event on demand.

use std::time::Duration;

use serde_json::json;

use crate::logging::{LogEvent, LogFields, LogLevel};

#[derive(Debug, Default, Clone)]
pub struct ShellMetrics {
    events: u64,
    renders: u64,
    unresolved_renders: u64,
    render_failures: u64,
    state_saves: u64,
    plugins_initialized: u64,
    plugins_failed: u64,
}

impl ShellMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `view:change` or `view:refresh` handled by the shell.
    pub fn record_event(&mut self) {
        self.events = self.events.saturating_add(1);
    }

    pub fn record_render(&mut self) {
        self.renders = self.renders.saturating_add(1);
    }

    pub fn record_unresolved(&mut self) {
        self.unresolved_renders = self.unresolved_renders.saturating_add(1);
    }

    pub fn record_render_failure(&mut self) {
        self.render_failures = self.render_failures.saturating_add(1);
    }

    pub fn record_save(&mut self) {
        self.state_saves = self.state_saves.saturating_add(1);
    }

    pub fn record_init(&mut self, initialized: usize, failed: usize) {
        self.plugins_initialized = self.plugins_initialized.saturating_add(initialized as u64);
        self.plugins_failed = self.plugins_failed.saturating_add(failed as u64);
    }

    pub fn snapshot(&self, uptime: Duration) -> MetricSnapshot {
        MetricSnapshot {
            uptime_ms: uptime.as_millis() as u64,
            events: self.events,
            renders: self.renders,
            unresolved_renders: self.unresolved_renders,
            render_failures: self.render_failures,
            state_saves: self.state_saves,
            plugins_initialized: self.plugins_initialized,
            plugins_failed: self.plugins_failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub uptime_ms: u64,
    pub events: u64,
    pub renders: u64,
    pub unresolved_renders: u64,
    pub render_failures: u64,
    pub state_saves: u64,
    pub plugins_initialized: u64,
    pub plugins_failed: u64,
}

impl MetricSnapshot {
    pub fn to_log_event(&self, target: &str) -> LogEvent {
        LogEvent::with_fields(LogLevel::Info, target, "shell_metrics", self.as_fields())
    }

    pub fn as_fields(&self) -> LogFields {
        let mut map = LogFields::new();
        map.insert("uptime_ms".to_string(), json!(self.uptime_ms));
        map.insert("events".to_string(), json!(self.events));
        map.insert("renders".to_string(), json!(self.renders));
        map.insert("unresolved_renders".to_string(), json!(self.unresolved_renders));
        map.insert("render_failures".to_string(), json!(self.render_failures));
        map.insert("state_saves".to_string(), json!(self.state_saves));
        map.insert("plugins_initialized".to_string(), json!(self.plugins_initialized));
        map.insert("plugins_failed".to_string(), json!(self.plugins_failed));
        map
    }
}
