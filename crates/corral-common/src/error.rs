//! Common error types for the Corral engine.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CorralError`].
pub type CorralResult<T> = Result<T, CorralError>;

/// Errors raised by lifecycle, graph, pod and volume operations.
#[derive(Error, Diagnostic, Debug)]
pub enum CorralError {
    /// An operation's precondition on the current state was violated.
    ///
    /// Nothing was changed or persisted.
    #[error("Cannot {operation} {id}: {reason}")]
    #[diagnostic(code(corral::invalid_state))]
    InvalidState {
        /// Entity the operation targeted.
        id: String,
        /// The operation that was refused.
        operation: String,
        /// Why the current state does not allow it.
        reason: String,
    },

    /// Entity not found.
    #[error("No such {kind}: {id}")]
    #[diagnostic(code(corral::not_found))]
    NotFound {
        /// Kind of entity (container, pod, volume, storage, ...).
        kind: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// Entity already exists.
    #[error("{kind} already exists: {id}")]
    #[diagnostic(code(corral::already_exists))]
    AlreadyExists {
        /// Kind of entity.
        kind: &'static str,
        /// The conflicting identifier or name.
        id: String,
    },

    /// The dependency set contains a cycle.
    #[error("Dependency cycle detected among containers: {}", containers.join(", "))]
    #[diagnostic(
        code(corral::graph::cycle),
        help("Remove one of the dependencies between the listed containers")
    )]
    CycleDetected {
        /// Containers that are part of the cycle, sorted.
        containers: Vec<String>,
    },

    /// A declared dependency does not resolve inside the container set.
    #[error("Container {container} depends on {dependency}, which is not part of the set")]
    #[diagnostic(code(corral::graph::dependency_not_found))]
    DependencyNotFound {
        /// The dependent container.
        container: String,
        /// The unresolved dependency.
        dependency: String,
    },

    /// A dependency failed, so the dependent was never attempted.
    #[error("Container {container} was not attempted: dependency {dependency} failed")]
    #[diagnostic(code(corral::graph::dependency_failed))]
    DependencyFailed {
        /// The skipped container.
        container: String,
        /// The failed dependency.
        dependency: String,
    },

    /// Entity is still referenced by other entities.
    #[error("{kind} {id} is in use by: {}", dependents.join(", "))]
    #[diagnostic(code(corral::in_use))]
    InUse {
        /// Kind of entity.
        kind: &'static str,
        /// The referenced entity.
        id: String,
        /// The entities holding references.
        dependents: Vec<String>,
    },

    /// A bounded wait expired.
    #[error("Timed out after {after_ms}ms waiting to {operation} {id}")]
    #[diagnostic(code(corral::timeout))]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// Entity concerned.
        id: String,
        /// The bound that expired.
        after_ms: u64,
    },

    /// The runtime supervisor failed a requested transition.
    #[error("Runtime failed to {operation} container {id}: {source}")]
    #[diagnostic(code(corral::runtime))]
    RuntimeFailure {
        /// The supervisor operation.
        operation: &'static str,
        /// Container concerned.
        id: String,
        /// Underlying collaborator error.
        #[source]
        source: Box<CorralError>,
    },

    /// The entity was removed while the caller still held a handle to it.
    #[error("{kind} {id} has been removed")]
    #[diagnostic(code(corral::removed))]
    Removed {
        /// Kind of entity.
        kind: &'static str,
        /// The removed entity.
        id: String,
    },

    /// The network plugin has no default network configured yet.
    #[error("Network not ready: {message}")]
    #[diagnostic(code(corral::network::not_ready))]
    NetworkNotReady {
        /// Plugin message.
        message: String,
    },

    /// An external collaborator reported a failure.
    #[error("{component} error: {message}")]
    #[diagnostic(code(corral::external))]
    External {
        /// The collaborator (supervisor, storage, network, ...).
        component: &'static str,
        /// The error message.
        message: String,
    },

    /// Feature not supported by the host or configuration.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(corral::unsupported),
        help("Pause and unpause require cgroup support in the runtime supervisor")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Every lock in the allocator is in use.
    #[error("All {capacity} locks are allocated")]
    #[diagnostic(
        code(corral::locks_exhausted),
        help("Raise `num_locks` in the runtime configuration or remove unused entities")
    )]
    LocksExhausted {
        /// Size of the lock pool.
        capacity: u32,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(corral::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(corral::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(corral::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(corral::internal),
        help("This is a bug, please report it at https://github.com/corral-containers/corral/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl CorralError {
    /// Build an [`CorralError::InvalidState`] error.
    pub fn invalid_state(
        id: impl ToString,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.to_string(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`CorralError::NotFound`] error.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Wrap a supervisor error with the operation and container it failed.
    pub fn runtime(operation: &'static str, id: impl ToString, source: Self) -> Self {
        Self::RuntimeFailure {
            operation,
            id: id.to_string(),
            source: Box::new(source),
        }
    }

    /// Build an [`CorralError::External`] error.
    pub fn external(component: &'static str, message: impl Into<String>) -> Self {
        Self::External {
            component,
            message: message.into(),
        }
    }

    /// Returns true for [`CorralError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for [`CorralError::InvalidState`].
    #[must_use]
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

impl From<serde_json::Error> for CorralError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CorralError::not_found("container", "abc123");
        assert_eq!(err.to_string(), "No such container: abc123");
    }

    #[test]
    fn cycle_lists_members() {
        let err = CorralError::CycleDetected {
            containers: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected among containers: a, b"
        );
    }

    #[test]
    fn runtime_failure_keeps_source() {
        let err = CorralError::runtime(
            "start",
            "web",
            CorralError::external("supervisor", "exit status 1"),
        );
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("supervisor error: exit status 1"));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CorralError = io_err.into();
        assert!(matches!(err, CorralError::Io(_)));
    }
}
