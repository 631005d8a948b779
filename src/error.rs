//! Error types for Berth

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for Berth operations
pub type Result<T> = std::result::Result<T, BerthError>;

/// Configuration errors
///
/// All of these are detected while loading the compose document, before any
/// network, volume or container is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    DanglingDependency { service: String, dependency: String },

    #[error("Cyclic dependency detected: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("Service '{0}' must have either 'image' or 'build' specified")]
    MissingImage(String),

    #[error("Service '{service}' mounts unknown volume '{volume}'")]
    UnknownVolume { service: String, volume: String },

    #[error("Invalid readiness endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Service '{service}' has invalid restart policy '{value}'")]
    InvalidRestartPolicy { service: String, value: String },

    #[error("No compose file found in {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Compose file parse error: {0}")]
    Parse(String),
}

/// Berth error types
#[derive(Error, Debug)]
pub enum BerthError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Launch error for service '{service}': {message}")]
    Launch { service: String, message: String },

    #[error("Readiness timeout for {endpoint} after {elapsed:?}")]
    ReadinessTimeout { endpoint: String, elapsed: Duration },

    #[error("Readiness probe for {endpoint} failed: {source}")]
    Probe {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service '{service}' cannot start: dependency '{dependency}' did not become ready")]
    DependencyFailed { service: String, dependency: String },

    #[error("Service '{service}' exhausted {attempts} restart attempts")]
    RestartsExhausted { service: String, attempts: u32 },

    #[error("Service '{service}' cannot move from {from} to {to}")]
    InvalidTransition {
        service: String,
        from: String,
        to: String,
    },

    #[error("Launch aborted: {} service(s) failed ({})", .failures.len(), .failures.iter().map(|f| f.service.as_str()).collect::<Vec<_>>().join(", "))]
    LaunchAborted { failures: Vec<InstanceFailure> },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BerthError {
    /// Name of the error kind, as reported to the user
    pub fn kind(&self) -> &'static str {
        match self {
            BerthError::Config(_) => "ConfigError",
            BerthError::Launch { .. } | BerthError::DependencyFailed { .. } => "LaunchError",
            BerthError::ReadinessTimeout { .. } => "ReadinessTimeoutError",
            BerthError::Probe { .. } => "ProbeError",
            BerthError::RestartsExhausted { .. } => "RestartError",
            BerthError::InvalidTransition { .. } => "StateError",
            BerthError::LaunchAborted { .. } => "LaunchAbortedError",
            BerthError::Cancelled => "CancelledError",
            BerthError::Runtime(_) => "RuntimeError",
            BerthError::Io(_) => "IoError",
            BerthError::Json(_) => "JsonError",
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BerthError::Config(_) => 2,
            BerthError::Cancelled => 0,
            _ => 1,
        }
    }

    /// Whether this error came from a cancellation request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BerthError::Cancelled)
    }

    pub(crate) fn launch(service: &str, message: impl Into<String>) -> Self {
        BerthError::Launch {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

/// A failure contained to one service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFailure {
    /// Service name
    pub service: String,
    /// Error kind (see [`BerthError::kind`])
    pub kind: &'static str,
    /// Rendered error message
    pub message: String,
}

impl InstanceFailure {
    /// Record a failure of `service` caused by `error`
    pub fn new(service: &str, error: &BerthError) -> Self {
        Self {
            service: service.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for InstanceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.service, self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config: BerthError = ConfigError::UnknownService("y".to_string()).into();
        assert_eq!(config.exit_code(), 2);
        assert_eq!(BerthError::Cancelled.exit_code(), 0);
        assert_eq!(BerthError::launch("web", "pull failed").exit_code(), 1);
    }

    #[test]
    fn test_cycle_message_names_path() {
        let err = ConfigError::CyclicDependency {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_instance_failure_display() {
        let err = BerthError::ReadinessTimeout {
            endpoint: "db:5432".to_string(),
            elapsed: Duration::from_secs(30),
        };
        let failure = InstanceFailure::new("db", &err);
        assert_eq!(failure.kind, "ReadinessTimeoutError");
        assert_eq!(
            failure.to_string(),
            "db: ReadinessTimeoutError: Readiness timeout for db:5432 after 30s"
        );
    }
}
