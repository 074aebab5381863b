//! Error types for instance orchestration
//!
//! Errors carry the instance or operation they belong to so a failed
//! `create` or `delete` can be traced back to the step that produced it.
//! The variants map onto four categories callers act on: configuration
//! mistakes (fix the instance), platform failures (the cluster API said no),
//! timeouts (a bounded poll ran out of attempts) and everything else.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for stratum operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid size tag or malformed instance spec.
    ///
    /// Always raised before any cluster mutation.
    #[error("configuration error for {instance}: {message}")]
    Configuration {
        /// Name of the instance with invalid configuration
        instance: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.size")
        field: Option<String>,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cluster operation failure not originating from a kube-rs call
    #[error("platform error [{operation}]: {message}")]
    Platform {
        /// Operation that failed (e.g., "apply", "run_clone")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// A bounded poll exhausted its attempts
    #[error("timed out waiting for {operation} after {attempts} attempts")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Number of checks performed before giving up
        attempts: u32,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            instance: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with instance context
    pub fn configuration_for(instance: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            instance: instance.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with instance context and field path
    pub fn configuration_for_field(
        instance: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            instance: instance.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a platform error for the named operation
    pub fn platform(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Platform {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named wait
    pub fn timeout(operation: impl Into<String>, attempts: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            attempts,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for spec/size problems detected before touching the cluster
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration { .. })
    }

    /// True for any cluster API failure
    pub fn is_platform(&self) -> bool {
        matches!(self, Error::Kube { .. } | Error::Platform { .. })
    }

    /// True when a bounded poll ran out of attempts
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// True when the cluster reported the resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// Check if retrying the whole operation later could succeed
    ///
    /// Configuration and serialization errors need a spec fix first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Configuration { .. } => false,
            Error::Platform { .. } => true,
            Error::Timeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the instance name if this error is associated with one
    pub fn instance(&self) -> Option<&str> {
        match self {
            Error::Configuration { instance, .. } => Some(instance),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: bad specs are rejected with the offending field before any cluster call
    #[test]
    fn story_configuration_errors_point_at_the_field() {
        let err = Error::configuration_for_field("bd1", "spec.size", "unknown size 'huge'");
        assert!(err.to_string().contains("configuration error for bd1"));
        assert!(err.to_string().contains("huge"));
        assert_eq!(err.instance(), Some("bd1"));
        match &err {
            Error::Configuration { field, .. } => assert_eq!(field.as_deref(), Some("spec.size")),
            _ => panic!("Expected Configuration variant"),
        }
        assert!(err.is_configuration());
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeout_is_distinct_from_platform() {
        let err = Error::timeout("pods running in ns1", 3);
        assert!(err.is_timeout());
        assert!(!err.is_platform());
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "timed out waiting for pods running in ns1 after 3 attempts"
        );
    }

    #[test]
    fn platform_errors_carry_operation() {
        let err = Error::platform("apply", "connection refused");
        assert!(err.is_platform());
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("[apply]"));
    }

    #[test]
    fn kube_not_found_is_detected() {
        let err: Error = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "namespaces \"ns1\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        })
        .into();
        assert!(err.is_not_found());
        assert!(err.is_platform());
        assert!(!err.is_retryable());
    }

    #[test]
    fn serialization_errors_keep_kind() {
        let err = Error::serialization_for_kind("Deployment", "missing field");
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("Deployment")),
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        assert_eq!(err.instance(), None);
    }
}
