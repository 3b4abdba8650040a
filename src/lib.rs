//! Tether - Kubernetes operator for multi-cluster service-account federation
//!
//! Tether lets workloads in one cluster authenticate to the API server of
//! another cluster. A `ServiceAccountImport` declares that a remote service
//! account's credential should be mirrored locally; the controller keeps a
//! local secret in sync with the remote token, and an admission webhook mounts
//! that secret into annotated pods. Workloads then use the [`resolver`] to
//! turn the mounted credential into a ready-to-use client configuration.
//!
//! # Modules
//!
//! - [`crd`] - The `ServiceAccountImport` custom resource
//! - [`registry`] - Cached client connections to named remote clusters
//! - [`controller`] - Credential mirror reconciliation logic
//! - [`webhook`] - Mutating admission webhook for pod credential injection
//! - [`resolver`] - Client configuration resolution from mounted credentials
//! - [`leader`] - Lease-based leader election for HA deployments
//! - [`retry`] - Retry with exponential backoff for startup operations
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod leader;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the wire-level contract between the controller, the
// admission webhook, and workloads consuming mounted credentials. Centralizing
// them here keeps the annotation key, mount layout, and secret keys consistent
// across components and test fixtures.

/// API group for Tether custom resources
pub const API_GROUP: &str = "multicluster.tether.dev";

/// Pod annotation listing the service-account imports to mount.
///
/// The value is a comma-separated, ordered list of import names resolved in
/// the pod's own namespace.
pub const ANNOTATION_IMPORT_NAMES: &str = "multicluster.tether.dev/service-account-import.name";

/// Label on mirrored secrets naming the owning import
pub const LABEL_IMPORT_NAME: &str = "multicluster.tether.dev/import";

/// Root directory under which imported credentials are mounted.
///
/// Each import gets its own subdirectory named after the import, containing
/// the `token`, `namespace`, `server`, and `ca.crt` files from the mirrored
/// secret.
pub const MOUNT_ROOT: &str = "/var/run/secrets/tether.dev/serviceaccountimports";

/// Namespace holding the controller's own resources (leases, remote
/// connection secrets)
pub const TETHER_SYSTEM_NAMESPACE: &str = "tether-system";

/// Field manager name used for server-side apply
pub const FIELD_MANAGER: &str = "tether-controller";

/// Mirrored secret data key holding the bearer token
pub const DATA_KEY_TOKEN: &str = "token";

/// Mirrored secret data key holding the remote namespace
pub const DATA_KEY_NAMESPACE: &str = "namespace";

/// Mirrored secret data key holding the remote API server URL
pub const DATA_KEY_SERVER: &str = "server";

/// Mirrored secret data key holding the remote API CA certificate
pub const DATA_KEY_CA: &str = "ca.crt";

/// Default port for the admission webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;
