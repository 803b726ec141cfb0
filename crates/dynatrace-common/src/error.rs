//! Error types for the Dynatrace webhook
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the context needed to tell which stage of a pod mutation
//! failed and whether a retry can help.

use thiserror::Error;

/// Main error type for webhook operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The DynaKube does not carry information the pipeline requires
    #[error("configuration error for {dynakube}: {message}")]
    Configuration {
        /// Name of the DynaKube with incomplete configuration
        dynakube: String,
        /// Description of what's missing
        message: String,
        /// The offending field path (e.g., "status.oneAgent.connectionInfoStatus.tenantUUID")
        field: Option<String>,
    },

    /// Resolving the owning workload of a pod failed
    #[error("workload lookup failed for {kind}/{name}: {message}")]
    WorkloadLookup {
        /// Kind of the owner that was being resolved
        kind: String,
        /// Name of the owner that was being resolved
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The kind of value being serialized (if known)
        kind: Option<String>,
    },

    /// The caller cancelled the request or its deadline passed
    #[error("operation '{operation}' aborted: {reason}")]
    Cancelled {
        /// Operation that was in flight
        operation: String,
        /// Why it was aborted (cancelled, deadline exceeded)
        reason: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reinvocation", "replication")
        context: String,
    },
}

impl Error {
    /// Create a configuration error with a field path
    pub fn configuration_for_field(
        dynakube: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            dynakube: dynakube.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a workload lookup error
    pub fn workload_lookup(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::WorkloadLookup {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with value kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// The request was cancelled by the caller while `operation` was running
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: "cancelled".to_string(),
        }
    }

    /// The request deadline passed while `operation` was running
    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: "deadline exceeded".to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration errors need the DynaKube (or its status) to change first,
    /// so an immediate retry of the admission will fail the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (forbidden, invalid, ...)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Configuration { .. } => false,
            Error::WorkloadLookup { .. } => true,
            Error::Serialization { .. } => false,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error is the result of cancellation or deadline expiry
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Cancelled { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

/// Returns true if the kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Returns true if the kube error is an API 409 (AlreadyExists / Conflict)
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}
