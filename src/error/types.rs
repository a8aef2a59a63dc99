use thiserror::Error;

use crate::persistence::StorageError;

/// Unified result type for the shell core.
pub type Result<T> = std::result::Result<T, ShellError>;

/// Errors surfaced by the orchestration core.
///
/// Most failure modes of the shell are logged and swallowed; the variants here
/// cover the cases that are returned to a caller.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("service `{0}` not found")]
    ServiceNotFound(String),
    #[error("service `{name}` is not a `{expected}`")]
    ServiceTypeMismatch { name: String, expected: &'static str },
    #[error("service `{0}` resolves itself through its factory")]
    CircularFactory(String),
    #[error("factory for service `{name}` failed: {message}")]
    ServiceFactory { name: String, message: String },
    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidRoute { pattern: String, reason: String },
    #[error("plugin `{plugin}` depends on unregistered plugin `{dependency}`")]
    MissingDependency { plugin: String, dependency: String },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("state key `{key}` holds an unexpected shape: {message}")]
    StateShape { key: String, message: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
