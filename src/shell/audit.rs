//! Shell lifecycle audit hooks.
//!
//! Records capture a stage identifier plus structured details so callers can
//! log, buffer or assert on the boot sequence without hooking into the core.

use std::time::SystemTime;

use parking_lot::Mutex;
use serde_json::Value;

/// Checkpoints emitted by the plugin manager and the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellAuditStage {
    /// A plugin was stored by the manager.
    PluginRegistered,
    /// A registration was ignored because the name was taken.
    RegistrationRejected,
    /// The initialization order was computed.
    InitOrderComputed,
    /// A dependency edge was dropped to break a cycle.
    DependencyCycle,
    /// A declared dependency names no registered plugin.
    DependencyMissing,
    /// An engine finished `init`.
    PluginInitialized,
    /// An engine's `init` failed, panicked or timed out.
    PluginInitFailed,
    /// Every engine has been through `init`.
    PluginsInitialized,
    /// A view rendered into the mount target.
    ViewRendered,
    /// No plugin view matched the requested view id.
    ViewUnresolved,
    /// Persisted state was merged into the store.
    StateRestored,
    /// The persistent subset of the store was written.
    StateSaved,
}

#[derive(Debug, Clone)]
pub struct ShellAuditEvent {
    pub timestamp: SystemTime,
    pub stage: ShellAuditStage,
    pub details: Vec<(String, Value)>,
}

impl ShellAuditEvent {
    fn new(stage: ShellAuditStage) -> Self {
        Self {
            timestamp: SystemTime::now(),
            stage,
            details: Vec::new(),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }
}

pub struct ShellAuditEventBuilder {
    event: ShellAuditEvent,
}

impl ShellAuditEventBuilder {
    pub fn new(stage: ShellAuditStage) -> Self {
        Self {
            event: ShellAuditEvent::new(stage),
        }
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event.details.push((key.into(), value.into()));
        self
    }

    pub fn finish(self) -> ShellAuditEvent {
        self.event
    }
}

/// Trait implemented by any audit sink.
pub trait ShellAudit: Send + Sync {
    fn record(&self, event: ShellAuditEvent);
}

#[derive(Debug, Default)]
pub struct NullShellAudit;

impl ShellAudit for NullShellAudit {
    fn record(&self, _event: ShellAuditEvent) {}
}

/// Keeps every audit event in memory.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<ShellAuditEvent>>,
}

impl RecordingAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ShellAuditEvent> {
        self.events.lock().clone()
    }

    pub fn stages(&self) -> Vec<ShellAuditStage> {
        self.events.lock().iter().map(|event| event.stage).collect()
    }
}

impl ShellAudit for RecordingAudit {
    fn record(&self, event: ShellAuditEvent) {
        self.events.lock().push(event);
    }
}
