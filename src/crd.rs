//! ServiceAccountImport CRD
//!
//! A ServiceAccountImport declares that a remote service account's credential
//! should be mirrored into the local cluster. The mirror controller keeps a
//! local secret in sync with the remote token; the admission webhook mounts
//! that secret into annotated pods.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ServiceAccountImport identifies a remote service account to mirror.
///
/// The targeting fields are effectively immutable: changing them re-points
/// the import and triggers a full re-sync of the mirrored secret.
///
/// Example:
/// ```yaml
/// apiVersion: multicluster.tether.dev/v1alpha1
/// kind: ServiceAccountImport
/// metadata:
///   name: cluster2-default-pod-lister
///   namespace: default
/// spec:
///   clusterName: cluster2
///   namespace: default
///   name: pod-lister
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "multicluster.tether.dev",
    version = "v1alpha1",
    kind = "ServiceAccountImport",
    namespaced,
    status = "ServiceAccountImportStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Remote Namespace","type":"string","jsonPath":".spec.namespace"}"#,
    printcolumn = r#"{"name":"Remote Name","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountImportSpec {
    /// Name of the remote cluster, as known to the connection registry
    pub cluster_name: String,

    /// Namespace of the service account in the remote cluster
    pub namespace: String,

    /// Name of the service account in the remote cluster
    pub name: String,
}

/// ServiceAccountImport status, written only by the mirror controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountImportStatus {
    /// References to locally mirrored secrets, in mount order.
    ///
    /// Non-empty only once a mirrored secret has been successfully written.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<MirroredSecretRef>,

    /// Current phase
    #[serde(default)]
    pub phase: ImportPhase,

    /// Human-readable message, set on Error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the spec the controller last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the mirrored secret was confirmed in sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<String>,
}

/// Reference to a mirrored secret by name
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MirroredSecretRef {
    /// Name of the mirrored secret in the import's namespace
    pub name: String,
}

/// ServiceAccountImport phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ImportPhase {
    /// No mirrored secret exists yet
    #[default]
    Pending,
    /// A reconcile is in flight for the first time
    Syncing,
    /// The mirrored secret is present and current
    Ready,
    /// The last reconcile failed; it will be retried
    Error,
}

impl ServiceAccountImport {
    /// Deterministic name of the mirrored secret for this import.
    ///
    /// Derived from the import's own name so repeated reconciliation upserts
    /// the same object instead of accumulating duplicates.
    pub fn mirrored_secret_name(&self) -> String {
        format!("{}-token", self.metadata.name.as_deref().unwrap_or_default())
    }

    /// Whether the mirror is fully in sync: Ready phase with at least one
    /// published secret.
    ///
    /// Stricter than the webhook's mount gate
    /// ([`first_secret_name`](Self::first_secret_name)): an import whose
    /// last sync failed keeps its previously published secrets, and those
    /// stay mountable even while the phase reports Error.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == ImportPhase::Ready && !s.secrets.is_empty())
            .unwrap_or(false)
    }

    /// Name of the first mirrored secret, the one the webhook mounts
    pub fn first_secret_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.secrets.first())
            .map(|r| r.name.as_str())
    }
}
