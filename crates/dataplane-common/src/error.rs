//! Error types for the dataplane operator
//!
//! Errors carry enough context (node set name, reconcile stage) to be
//! useful in logs and in the condition messages written back to status.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for dataplane operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A declared value failed validation (unknown service, malformed reference)
    #[error("validation error for {node_set}: {message}")]
    Validation {
        /// Name of the node set with invalid configuration
        node_set: String,
        /// Description of what's invalid
        message: String,
    },

    /// A dependency stage (IP reservation, DNS data, bare metal) failed
    #[error("{stage} failed for {node_set}: {message}")]
    Dependency {
        /// Name of the node set being reconciled
        node_set: String,
        /// Stage that failed (e.g. "ipset", "dnsdata", "baremetal")
        stage: String,
        /// Description of what failed
        message: String,
    },

    /// Required input (the SSH key secret) is missing or incomplete
    #[error("input not ready: {message}")]
    InputInvalid {
        /// Description of the missing input
        message: String,
    },

    /// Inventory generation failed
    #[error("unable to generate inventory for {node_set}: {message}")]
    Inventory {
        /// Name of the node set
        node_set: String,
        /// Description of what failed
        message: String,
    },

    /// A sibling deployment reported an error for this node set
    #[error("deployment error: {message}")]
    DeploymentFailed {
        /// Description pointing the operator at the detailed statuses
        message: String,
    },

    /// The reconciled object has no namespace
    #[error("missing namespace on OpenStackDataPlaneNodeSet")]
    MissingNamespace,

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "watcher")
        context: String,
    },
}

impl Error {
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

    /// Create a validation error for a node set
    pub fn validation_for(node_set: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            node_set: node_set.into(),
            message: msg.into(),
        }
    }

    /// Create a dependency stage error
    pub fn dependency(
        node_set: impl Into<String>,
        stage: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Dependency {
            node_set: node_set.into(),
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create an input error
    pub fn input_invalid(msg: impl Into<String>) -> Self {
        Self::InputInvalid {
            message: msg.into(),
        }
    }

    /// Create an inventory generation error
    pub fn inventory(node_set: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Inventory {
            node_set: node_set.into(),
            message: msg.into(),
        }
    }

    /// Create a deployment aggregation error
    pub fn deployment_failed(msg: impl Into<String>) -> Self {
        Self::DeploymentFailed {
            message: msg.into(),
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

    /// True when the API server answered 404 Not Found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True when the API server rejected a write because the resource version moved on
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec change before a retry
    /// can succeed. Everything else may clear up on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::MissingNamespace => false,
            Error::Dependency { .. }
            | Error::InputInvalid { .. }
            | Error::Inventory { .. }
            | Error::DeploymentFailed { .. }
            | Error::Internal { .. } => true,
        }
    }

    /// Get the node set name if this error is associated with one
    pub fn node_set(&self) -> Option<&str> {
        match self {
            Error::Validation { node_set, .. }
            | Error::Dependency { node_set, .. }
            | Error::Inventory { node_set, .. } => Some(node_set),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn not_found_is_classified_from_api_code() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn conflict_is_classified_and_retryable() {
        let err = api_error(409);
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!api_error(422).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    #[test]
    fn validation_errors_name_the_node_set() {
        let err = Error::validation_for("edge-a", "service 'nova' not found");
        assert_eq!(err.node_set(), Some("edge-a"));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("validation error for edge-a"));
    }

    #[test]
    fn dependency_error_message_includes_stage() {
        let err = Error::dependency("edge-a", "ipset", "reservation pool exhausted");
        assert_eq!(
            err.to_string(),
            "ipset failed for edge-a: reservation pool exhausted"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
