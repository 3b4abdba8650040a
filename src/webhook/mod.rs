//! Mutating admission webhook for pod credential injection
//!
//! Intercepts pod creation and, for pods annotated with one or more import
//! names, injects a volume plus a per-container read-only mount for each
//! requested import, sourced from the mirrored secret.
//!
//! The webhook is fail-closed: a pod referencing an import that does not
//! exist or is not yet ready is rejected, never silently admitted without
//! its credential. Controllers that recreate pods (jobs, deployments,
//! replica sets) retry and succeed once the mirror is ready.

pub mod pod;

use std::sync::Arc;

use axum::{routing::post, Router};
use kube::Client;

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Kubernetes client for looking up ServiceAccountImport resources
    pub kube: Client,
}

impl WebhookState {
    /// Create a new webhook state with the given Kubernetes client
    pub fn new(kube: Client) -> Self {
        Self { kube }
    }
}

/// Create the webhook router with all mutation endpoints
///
/// Currently supports:
/// - POST /mutate/pods - Inject import credential mounts into annotated pods
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate/pods", post(pod::mutate_handler))
        .with_state(state)
}
