//! Error types for the federation accelerator

use crate::circuit_breaker::CircuitBreakerError;
use crate::dataloader::LoaderError;
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the accelerator
///
/// Every failure that can end up in an execution result is funneled through
/// this enum. Cache and metrics internals never produce one of these; they
/// degrade silently instead.
#[derive(Error, Debug)]
pub enum Error {
    /// The external planner could not produce a plan
    #[error("Planning error: {0}")]
    Planning(String),

    /// The plan handed back by the planner cannot be executed
    #[error("Invalid query plan: {0}")]
    InvalidPlan(String),

    /// A subgraph call was attempted and failed
    #[error("Subgraph '{service}' failed: {message}")]
    Subgraph { service: String, message: String },

    /// The call was not attempted because the service's circuit is open
    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerError),

    /// A batched entity lookup failed
    #[error(transparent)]
    Batch(#[from] LoaderError),

    /// A step was skipped because a step it depends on failed
    #[error("Step '{step}' skipped: dependency '{dependency}' failed")]
    DependencyFailed { step: String, dependency: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Any other error
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a subgraph error
    pub fn subgraph(service: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Subgraph {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Stable, low-cardinality label used to group errors in metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Planning(_) => "planning",
            Error::InvalidPlan(_) => "invalid_plan",
            Error::Subgraph { .. } => "subgraph",
            Error::CircuitOpen(_) | Error::Batch(LoaderError::CircuitOpen(_)) => "circuit_open",
            Error::Batch(_) => "batch",
            Error::DependencyFailed { .. } => "dependency_failed",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
            Error::Other(_) => "unknown",
        }
    }

    /// Error code exposed in GraphQL error extensions
    pub fn code(&self) -> &'static str {
        match self {
            Error::Planning(_) => "PLANNING_ERROR",
            Error::InvalidPlan(_) => "INVALID_PLAN",
            Error::Subgraph { .. } => "SUBGRAPH_ERROR",
            Error::CircuitOpen(_) | Error::Batch(LoaderError::CircuitOpen(_)) => {
                "SERVICE_UNAVAILABLE"
            }
            Error::Batch(_) => "BATCH_ERROR",
            Error::DependencyFailed { .. } => "DEPENDENCY_FAILED",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "UNKNOWN_ERROR",
        }
    }

    /// Convert error to GraphQL error format
    ///
    /// # Security
    ///
    /// In production (ENV=production), internal error details are sanitized
    /// to prevent information disclosure. Only safe error types show their
    /// full message to clients.
    pub fn to_graphql_error(&self) -> GraphQLError {
        let is_production = std::env::var("ENV")
            .map(|e| e == "production" || e == "prod")
            .unwrap_or(false);

        let message = if is_production {
            match self {
                Error::Subgraph { .. } => "Backend service error".to_string(),
                Error::Batch(LoaderError::CircuitOpen(err)) => err.to_string(),
                Error::Batch(_) => "Backend service error".to_string(),
                Error::Internal(_) | Error::Io(_) => "Internal server error".to_string(),
                Error::Serialization(_) => "Data processing error".to_string(),
                Error::Config(_) => "Internal server error".to_string(),
                Error::Other(_) => "An unexpected error occurred".to_string(),
                // These errors are safe to expose to clients
                Error::Planning(msg) => format!("Planning error: {}", msg),
                Error::InvalidPlan(msg) => format!("Invalid query plan: {}", msg),
                Error::CircuitOpen(err) => err.to_string(),
                Error::DependencyFailed { .. } => self.to_string(),
            }
        } else {
            self.to_string()
        };

        GraphQLError {
            message,
            extensions: self.extensions(),
        }
    }

    fn extensions(&self) -> HashMap<String, serde_json::Value> {
        let mut map = match self {
            Error::CircuitOpen(err) | Error::Batch(LoaderError::CircuitOpen(err)) => {
                err.to_extensions()
            }
            _ => HashMap::new(),
        };
        match self {
            Error::Subgraph { service, .. } => {
                map.insert("service".to_string(), serde_json::json!(service));
            }
            Error::Batch(err) => {
                map.insert("service".to_string(), serde_json::json!(err.service()));
            }
            _ => {}
        }
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map
    }
}

/// GraphQL error response format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl From<Error> for GraphQLError {
    fn from(err: Error) -> Self {
        err.to_graphql_error()
    }
}

/// Serializes tests that mutate the `ENV` variable
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = Error::Planning("unknown field".to_string());
        assert_eq!(err.to_string(), "Planning error: unknown field");

        let err = Error::subgraph("users", "connection reset");
        assert_eq!(err.to_string(), "Subgraph 'users' failed: connection reset");

        let err = Error::DependencyFailed {
            step: "reviews".to_string(),
            dependency: "products".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'reviews' skipped: dependency 'products' failed"
        );
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(err.kind(), "serialization");
    }

    #[test]
    fn test_error_from_anyhow() {
        let err: Error = anyhow::anyhow!("something went wrong").into();
        assert!(matches!(err, Error::Other(_)));
        assert_eq!(err.code(), "UNKNOWN_ERROR");
    }

    #[test]
    fn test_circuit_open_extensions() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::remove_var("ENV");

        let err: Error = CircuitBreakerError::CircuitOpen {
            service: "inventory".to_string(),
            retry_after: Some(Duration::from_secs(12)),
        }
        .into();
        let gql_err = err.to_graphql_error();
        assert_eq!(gql_err.extensions.get("code").unwrap(), "SERVICE_UNAVAILABLE");
        assert_eq!(gql_err.extensions.get("service").unwrap(), "inventory");
        assert_eq!(gql_err.extensions.get("retryAfter"), Some(&serde_json::json!(12)));
    }

    #[test]
    fn test_batch_error_tagged_with_service() {
        let err: Error = LoaderError::BatchFailed {
            service: "products".to_string(),
            message: "timeout".to_string(),
        }
        .into();
        let gql_err = err.to_graphql_error();
        assert_eq!(gql_err.extensions.get("code").unwrap(), "BATCH_ERROR");
        assert_eq!(gql_err.extensions.get("service").unwrap(), "products");
    }

    #[test]
    fn test_rejected_batch_reports_unavailable() {
        let err: Error = LoaderError::CircuitOpen(CircuitBreakerError::CircuitOpen {
            service: "reviews".to_string(),
            retry_after: None,
        })
        .into();
        assert_eq!(err.kind(), "circuit_open");
        let gql_err = err.to_graphql_error();
        assert_eq!(gql_err.extensions.get("code").unwrap(), "SERVICE_UNAVAILABLE");
        assert_eq!(gql_err.extensions.get("service").unwrap(), "reviews");
    }

    #[test]
    fn test_graphql_error_conversion_production_sanitized() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("ENV", "production");

        let gql_err = Error::Internal("sensitive data here".to_string()).to_graphql_error();
        assert_eq!(gql_err.message, "Internal server error");

        let gql_err = Error::subgraph("users", "db password rejected").to_graphql_error();
        assert_eq!(gql_err.message, "Backend service error");
        assert_eq!(gql_err.extensions.get("service").unwrap(), "users");

        let gql_err = Error::Planning("no such field".to_string()).to_graphql_error();
        assert_eq!(gql_err.message, "Planning error: no such field");

        std::env::remove_var("ENV");
    }

    #[test]
    fn test_all_error_variants_have_codes() {
        let errors = vec![
            Error::Planning("test".to_string()),
            Error::InvalidPlan("test".to_string()),
            Error::subgraph("svc", "test"),
            Error::Config("test".to_string()),
            Error::Internal("test".to_string()),
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "test")),
            Error::Other(anyhow::anyhow!("test")),
        ];

        for err in errors {
            let gql_err = err.to_graphql_error();
            assert!(gql_err.extensions.contains_key("code"));
        }
    }

    #[test]
    fn test_graphql_error_empty_extensions_skipped() {
        let gql_err = GraphQLError {
            message: "Test".to_string(),
            extensions: HashMap::new(),
        };

        let json = serde_json::to_string(&gql_err).unwrap();
        assert!(!json.contains("extensions"));
    }
}
