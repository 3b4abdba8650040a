//! Error types for the Tether operator

use thiserror::Error;

/// Main error type for Tether operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error against the local cluster
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The remote cluster could not be reached or authenticated against
    #[error("remote cluster '{cluster}' unreachable: {message}")]
    RemoteUnreachable {
        /// Name of the remote cluster
        cluster: String,
        /// What went wrong
        message: String,
    },

    /// The remote service account or its token secret does not exist (yet)
    #[error("remote state missing in cluster '{cluster}': {message}")]
    RemoteStateMissing {
        /// Name of the remote cluster
        cluster: String,
        /// What is missing
        message: String,
    },

    /// A concurrent writer updated the mirrored secret between our read and
    /// our write
    #[error("write conflict on secret '{secret}'")]
    WriteConflict {
        /// Name of the contended secret
        secret: String,
    },

    /// No connection material exists for the named cluster
    #[error("no connection material for cluster '{cluster}': {message}")]
    ConnectionNotFound {
        /// Name of the cluster
        cluster: String,
        /// Where we looked
        message: String,
    },

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a remote-unreachable error for the given cluster
    pub fn remote_unreachable(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteUnreachable {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    /// Create a remote-state-missing error for the given cluster
    pub fn remote_state_missing(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteStateMissing {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    /// Create a write-conflict error for the given secret name
    pub fn write_conflict(secret: impl Into<String>) -> Self {
        Self::WriteConflict {
            secret: secret.into(),
        }
    }

    /// Create a connection-not-found error for the given cluster
    pub fn connection_not_found(cluster: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            cluster: cluster.into(),
            message: message.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether a reconcile hitting this error should be retried.
    ///
    /// Remote state may appear later (bootstrap material arriving, service
    /// account being created) and conflicts resolve on the next pass, so
    /// almost everything retries. Validation and serialization failures are
    /// user or code errors that no amount of retrying will fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RemoteUnreachable { .. }
            | Error::RemoteStateMissing { .. }
            | Error::WriteConflict { .. }
            | Error::ConnectionNotFound { .. } => true,
            // 4xx API errors other than 409/429 won't resolve on their own
            Error::Kube(kube::Error::Api(e)) => {
                !(400..500).contains(&e.code) || e.code == 409 || e.code == 429
            }
            Error::Kube(_) => true,
            Error::Validation(_) | Error::Serialization(_) => false,
        }
    }

    /// The remote cluster this error concerns, if any
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::RemoteUnreachable { cluster, .. }
            | Error::RemoteStateMissing { cluster, .. }
            | Error::ConnectionNotFound { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation During Credential Mirroring
    // ==========================================================================
    //
    // These tests demonstrate how errors flow through the reconcile loop.
    // Each category drives a different requeue decision.

    /// Story: a remote cluster being down is transient, not fatal
    ///
    /// When the target cluster's API server is unreachable, the import goes
    /// to Error status and the reconcile is requeued with backoff. The
    /// controller process itself keeps running.
    #[test]
    fn story_remote_outage_is_retryable() {
        let err = Error::remote_unreachable("cluster2", "connection refused");
        assert!(err.is_retryable());
        assert_eq!(err.cluster(), Some("cluster2"));
        assert!(err.to_string().contains("cluster2"));
        assert!(err.to_string().contains("connection refused"));
    }

    /// Story: remote state may simply not exist yet
    ///
    /// An import can be created before the remote service account. That is
    /// an ordering problem, not a configuration problem, so we retry.
    #[test]
    fn story_missing_remote_service_account_is_retryable() {
        let err = Error::remote_state_missing("cluster2", "serviceaccount 'pod-lister' not found");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("pod-lister"));
    }

    /// Story: write conflicts resolve themselves on the next pass
    ///
    /// Two reconcile passes racing on the same mirrored secret produce a 409.
    /// The loser just reconciles again immediately with fresh state.
    #[test]
    fn story_write_conflict_retries_immediately() {
        let err = Error::write_conflict("cluster2-default-pod-lister-token");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("write conflict"));
    }

    /// Story: bootstrap material can arrive after the import
    ///
    /// The connection secret for a cluster is deposited by an external
    /// bootstrap step. Until it exists, resolution fails but must be retried
    /// on every call rather than cached as a permanent failure.
    #[test]
    fn story_connection_material_arrives_late() {
        let err = Error::connection_not_found(
            "cluster2",
            "no secret 'cluster2' in tether-system and no kubeconfig context",
        );
        assert!(err.is_retryable());
        assert_eq!(err.cluster(), Some("cluster2"));
    }

    /// Story: validation failures are terminal
    #[test]
    fn story_validation_errors_do_not_retry() {
        let err = Error::validation("spec.clusterName must not be empty");
        assert!(!err.is_retryable());
        assert!(err.cluster().is_none());

        let err = Error::serialization("invalid secret payload");
        assert!(!err.is_retryable());
    }

    /// Story: API error codes split into retryable and terminal
    #[test]
    fn story_api_errors_categorized_by_code() {
        fn api_error(code: u16) -> Error {
            Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: "test".to_string(),
                code,
            }))
        }

        // Conflicts and throttling recover on retry
        assert!(api_error(409).is_retryable());
        assert!(api_error(429).is_retryable());
        // Server errors recover on retry
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
        // Bad requests and forbidden do not
        assert!(!api_error(400).is_retryable());
        assert!(!api_error(403).is_retryable());
        assert!(!api_error(404).is_retryable());
    }

    /// Story: error constructors accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let cluster = "prod-us-west";
        let err = Error::remote_unreachable(cluster, format!("dial tcp: timeout to {cluster}"));
        assert!(err.to_string().contains("prod-us-west"));

        let err = Error::validation("static message");
        assert!(err.to_string().contains("static message"));
    }
}
