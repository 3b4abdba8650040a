//! Credential mirror reconciliation controller
//!
//! Watches ServiceAccountImport resources and keeps a local mirrored secret
//! in sync with the referenced remote service account's token credential.
//! The mirrored secret is owned by its import, so deleting the import
//! garbage-collects the secret.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::{
    ImportPhase, MirroredSecretRef, ServiceAccountImport, ServiceAccountImportStatus,
};
use crate::error::Error;
use crate::registry::{ClusterRegistry, RemoteConnection};
use crate::{
    Result, DATA_KEY_CA, DATA_KEY_NAMESPACE, DATA_KEY_SERVER, DATA_KEY_TOKEN, FIELD_MANAGER,
    LABEL_IMPORT_NAME,
};

/// Requeue interval after a successful sync.
///
/// This is the pull half of the trigger model: the remote cluster offers no
/// watch, so periodic re-sync is what catches token rotation.
const REQUEUE_SUCCESS_SECS: u64 = 300;
/// Requeue interval after a retryable failure
const REQUEUE_ERROR_SECS: u64 = 60;
/// Requeue interval after a write conflict (retry with fresh state right away)
const REQUEUE_CONFLICT_SECS: u64 = 1;

/// Deadline for any single call against a remote cluster
const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared context for the mirror controller.
///
/// Built once at startup with its client and registry already bound; never
/// mutated afterwards.
pub struct Context {
    /// Client for the local cluster
    pub client: Client,
    /// Registry of remote cluster connections
    pub registry: Arc<ClusterRegistry>,
}

impl Context {
    /// Create a controller context
    pub fn new(client: Client, registry: Arc<ClusterRegistry>) -> Self {
        Self { client, registry }
    }
}

/// Reconcile a ServiceAccountImport.
///
/// Resolves the remote connection, fetches the remote service account's
/// token credential, upserts the local mirrored secret, and publishes
/// status. Safe to run redundantly: an unchanged remote state produces no
/// write beyond the `lastSynced` timestamp.
pub async fn reconcile(
    import: Arc<ServiceAccountImport>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let name = import.name_any();
    let namespace = import
        .namespace()
        .ok_or_else(|| Error::validation("ServiceAccountImport must be namespaced"))?;

    info!(
        import = %name,
        namespace = %namespace,
        cluster = %import.spec.cluster_name,
        "Reconciling ServiceAccountImport"
    );

    // Surface Syncing on the first pass so users can tell a new import is
    // being worked on. Later passes go straight from Ready to Ready.
    let current_phase = import.status.as_ref().map(|s| s.phase).unwrap_or_default();
    if current_phase == ImportPhase::Pending {
        update_status(&ctx.client, &import, ImportPhase::Syncing, None, None).await?;
    }

    match mirror_credential(&import, &namespace, &ctx).await {
        Ok(secret_name) => {
            update_status(
                &ctx.client,
                &import,
                ImportPhase::Ready,
                None,
                Some(vec![MirroredSecretRef { name: secret_name }]),
            )
            .await?;
            Ok(Action::requeue(Duration::from_secs(REQUEUE_SUCCESS_SECS)))
        }
        Err(Error::WriteConflict { secret }) => {
            // Another pass got there first; reconcile again with fresh state.
            // Not surfaced in status: the winning write is authoritative.
            debug!(import = %name, secret = %secret, "Write conflict, requeueing immediately");
            Ok(Action::requeue(Duration::from_secs(REQUEUE_CONFLICT_SECS)))
        }
        Err(e) => {
            warn!(
                import = %name,
                cluster = %import.spec.cluster_name,
                error = %e,
                "Failed to mirror credential"
            );
            // Previously published secret references stay in place: a stale
            // mirror is still usable until the remote credential is
            // confirmed gone.
            update_status(
                &ctx.client,
                &import,
                ImportPhase::Error,
                Some(e.to_string()),
                None,
            )
            .await?;
            Ok(Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS)))
        }
    }
}

/// Decide the requeue for errors escaping `reconcile` itself (status write
/// failures, malformed objects)
pub fn error_policy(
    import: Arc<ServiceAccountImport>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(
        import = %import.name_any(),
        error = %error,
        "Reconcile failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    } else {
        // User or code error; re-check only on the periodic resync
        Action::requeue(Duration::from_secs(REQUEUE_SUCCESS_SECS))
    }
}

/// Fetch the remote credential and upsert the local mirrored secret.
///
/// Returns the mirrored secret's name on success.
async fn mirror_credential(
    import: &ServiceAccountImport,
    local_namespace: &str,
    ctx: &Context,
) -> Result<String> {
    let cluster = &import.spec.cluster_name;
    let conn = ctx.registry.connection(cluster).await?;

    let sa = fetch_remote_service_account(&conn, import).await?;
    let token_secret = fetch_token_secret(&conn, import, &sa).await?;

    let desired = build_mirrored_secret(import, local_namespace, &conn, &token_secret)?;
    upsert_secret(&ctx.client, local_namespace, desired).await
}

/// Fetch the target service account from the remote cluster
async fn fetch_remote_service_account(
    conn: &RemoteConnection,
    import: &ServiceAccountImport,
) -> Result<ServiceAccount> {
    let cluster = &import.spec.cluster_name;
    let api: Api<ServiceAccount> =
        Api::namespaced(conn.client.clone(), &import.spec.namespace);

    let result = tokio::time::timeout(REMOTE_TIMEOUT, api.get(&import.spec.name))
        .await
        .map_err(|_| {
            Error::remote_unreachable(cluster, "timed out fetching service account")
        })?;

    match result {
        Ok(sa) => Ok(sa),
        Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::remote_state_missing(
            cluster,
            format!(
                "serviceaccount '{}/{}' not found",
                import.spec.namespace, import.spec.name
            ),
        )),
        Err(e) => Err(Error::remote_unreachable(cluster, e.to_string())),
    }
}

/// Names of the secrets a service account references, in declaration order
fn token_secret_candidates(sa: &ServiceAccount) -> Vec<String> {
    sa.secrets
        .iter()
        .flatten()
        .filter_map(|r| r.name.clone())
        .collect()
}

/// Whether a secret holds a bearer token credential
fn holds_token(secret: &Secret) -> bool {
    secret
        .data
        .as_ref()
        .map(|d| d.contains_key(DATA_KEY_TOKEN))
        .unwrap_or(false)
}

/// Fetch the remote secret holding the service account's live token.
///
/// Selection policy: the first referenced secret that resolves and carries a
/// `token` key wins. During rotation overlap a service account may carry
/// several live token secrets; we stay on the first until it disappears
/// rather than guessing which is newest.
async fn fetch_token_secret(
    conn: &RemoteConnection,
    import: &ServiceAccountImport,
    sa: &ServiceAccount,
) -> Result<Secret> {
    let cluster = &import.spec.cluster_name;
    let candidates = token_secret_candidates(sa);
    if candidates.is_empty() {
        return Err(Error::remote_state_missing(
            cluster,
            format!(
                "serviceaccount '{}/{}' references no secrets",
                import.spec.namespace, import.spec.name
            ),
        ));
    }

    let api: Api<Secret> = Api::namespaced(conn.client.clone(), &import.spec.namespace);
    for candidate in &candidates {
        let result = tokio::time::timeout(REMOTE_TIMEOUT, api.get(candidate))
            .await
            .map_err(|_| Error::remote_unreachable(cluster, "timed out fetching token secret"))?;

        match result {
            Ok(secret) if holds_token(&secret) => {
                debug!(
                    cluster = %cluster,
                    secret = %candidate,
                    "Selected token secret"
                );
                return Ok(secret);
            }
            Ok(_) => debug!(cluster = %cluster, secret = %candidate, "Secret has no token key, skipping"),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(cluster = %cluster, secret = %candidate, "Referenced secret not found, skipping");
            }
            Err(e) => return Err(Error::remote_unreachable(cluster, e.to_string())),
        }
    }

    Err(Error::remote_state_missing(
        cluster,
        format!(
            "serviceaccount '{}/{}' has no live token secret",
            import.spec.namespace, import.spec.name
        ),
    ))
}

/// Build the desired mirrored secret from remote credential material.
///
/// Content is the remote token copied verbatim plus the connection facts a
/// consumer needs to use it: remote namespace, API server URL, and CA.
fn build_mirrored_secret(
    import: &ServiceAccountImport,
    local_namespace: &str,
    conn: &RemoteConnection,
    token_secret: &Secret,
) -> Result<Secret> {
    let remote_data = token_secret
        .data
        .as_ref()
        .ok_or_else(|| Error::serialization("token secret has no data"))?;
    let token = remote_data
        .get(DATA_KEY_TOKEN)
        .ok_or_else(|| Error::serialization("token secret missing 'token' key"))?
        .clone();

    // Prefer the CA the remote cluster baked into the token secret; fall
    // back to the CA from the connection material.
    let ca = remote_data
        .get(DATA_KEY_CA)
        .cloned()
        .or_else(|| conn.ca_pem.clone().map(ByteString));

    let mut data = std::collections::BTreeMap::new();
    data.insert(DATA_KEY_TOKEN.to_string(), token);
    data.insert(
        DATA_KEY_NAMESPACE.to_string(),
        ByteString(import.spec.namespace.as_bytes().to_vec()),
    );
    data.insert(
        DATA_KEY_SERVER.to_string(),
        ByteString(conn.server.as_bytes().to_vec()),
    );
    if let Some(ca) = ca {
        data.insert(DATA_KEY_CA.to_string(), ca);
    }

    let owner_ref = import
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation("import has no metadata for owner reference"))?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(import.mirrored_secret_name()),
            namespace: Some(local_namespace.to_string()),
            labels: Some(std::collections::BTreeMap::from([(
                LABEL_IMPORT_NAME.to_string(),
                import.name_any(),
            )])),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Create or update the mirrored secret with conditional-write semantics.
///
/// The replace path carries the resourceVersion from our read, so a write
/// that raced a newer one fails with 409 instead of clobbering it.
async fn upsert_secret(client: &Client, namespace: &str, desired: Secret) -> Result<String> {
    let name = desired
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::validation("mirrored secret has no name"))?;
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);

    match api.get(&name).await {
        Ok(existing) => {
            if existing.data == desired.data {
                debug!(secret = %name, "Mirrored secret unchanged");
                return Ok(name);
            }
            let mut updated = desired;
            updated.metadata.resource_version = existing.metadata.resource_version.clone();
            match api.replace(&name, &PostParams::default(), &updated).await {
                Ok(_) => {
                    info!(secret = %name, "Mirrored secret updated");
                    Ok(name)
                }
                Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::write_conflict(name)),
                Err(e) => Err(e.into()),
            }
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {
                    info!(secret = %name, "Mirrored secret created");
                    Ok(name)
                }
                Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::write_conflict(name)),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Whether the interesting parts of the status already match.
///
/// `lastSynced` is deliberately excluded so a no-op reconcile does not loop
/// on its own status writes.
fn status_unchanged(
    current: Option<&ServiceAccountImportStatus>,
    phase: ImportPhase,
    message: Option<&str>,
    secrets: Option<&[MirroredSecretRef]>,
    observed_generation: Option<i64>,
) -> bool {
    let Some(current) = current else {
        return false;
    };
    let secrets_match = match secrets {
        Some(desired) => current.secrets == desired,
        None => true,
    };
    current.phase == phase
        && current.message.as_deref() == message
        && secrets_match
        && current.observed_generation == observed_generation
}

/// Merge patch for the status subresource.
///
/// `message` is emitted even when absent, as an explicit null: a merge
/// patch only erases keys it carries as null, so omitting the key would
/// leave a stale error message behind on the Error to Ready transition.
/// `secrets` is omitted when `None` so the published list stays untouched.
fn status_patch(
    phase: ImportPhase,
    message: Option<&str>,
    secrets: Option<&[MirroredSecretRef]>,
    observed_generation: Option<i64>,
) -> serde_json::Value {
    let mut status = serde_json::json!({
        "phase": phase,
        "message": message,
        "observedGeneration": observed_generation,
        "lastSynced": Utc::now().to_rfc3339(),
    });
    if let Some(secrets) = secrets {
        status["secrets"] = serde_json::json!(secrets);
    }
    serde_json::json!({ "status": status })
}

/// Patch the import's status subresource, skipping no-op updates
async fn update_status(
    client: &Client,
    import: &ServiceAccountImport,
    phase: ImportPhase,
    message: Option<String>,
    secrets: Option<Vec<MirroredSecretRef>>,
) -> Result<()> {
    let observed_generation = import.metadata.generation;
    if status_unchanged(
        import.status.as_ref(),
        phase,
        message.as_deref(),
        secrets.as_deref(),
        observed_generation,
    ) {
        debug!(import = %import.name_any(), "Status unchanged, skipping update");
        return Ok(());
    }

    let name = import.name_any();
    let namespace = import
        .namespace()
        .ok_or_else(|| Error::validation("ServiceAccountImport must be namespaced"))?;

    let patch = status_patch(
        phase,
        message.as_deref(),
        secrets.as_deref(),
        observed_generation,
    );
    let api: Api<ServiceAccountImport> = Api::namespaced(client.clone(), &namespace);
    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    Ok(())
}
