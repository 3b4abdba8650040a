//! Pod mutation webhook
//!
//! Handles AdmissionReview requests for Pods, injecting credential volumes
//! and mounts for every import named in the pod's annotation.

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::{Pod, SecretVolumeSource, Volume, VolumeMount};
use kube::{
    api::Api,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    core::DynamicObject,
    Client,
};
use tracing::{debug, error, info, warn};

use crate::crd::ServiceAccountImport;
use crate::{ANNOTATION_IMPORT_NAMES, MOUNT_ROOT};

use super::WebhookState;

/// Import lookup seam for the mutation logic.
///
/// The handler is built with its lookup already bound; tests substitute a
/// mock so mutation decisions run without an API server.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ImportLookup: Send + Sync {
    /// Fetch an import by namespace and name, `None` when it does not exist
    async fn import(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccountImport>, kube::Error>;
}

/// Import lookup backed by the API server
pub struct ApiImportLookup {
    client: Client,
}

impl ApiImportLookup {
    /// Create a lookup using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ImportLookup for ApiImportLookup {
    async fn import(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccountImport>, kube::Error> {
        let api: Api<ServiceAccountImport> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(import) => Ok(Some(import)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Handle mutating admission review for Pods
///
/// This handler:
/// 1. Extracts the Pod from the admission review
/// 2. Reads the import-name annotation
/// 3. If present, looks up each named ServiceAccountImport
/// 4. Injects a credential volume and per-container mounts, or rejects
/// 5. Returns the mutated admission response
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    // Convert review to request
    let req: AdmissionRequest<Pod> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let lookup = ApiImportLookup::new(state.kube.clone());
    let response = mutate_pod(&lookup, &req).await;
    Json(response.into_review())
}

/// Reject the request with an HTTP-style status code.
///
/// The code distinguishes rejection categories for callers and audit logs:
/// 404 for an import that does not exist, 412 for one that exists but has
/// no mirrored secret yet, 500 for lookup or patch failures.
fn deny_with_code(
    request: &AdmissionRequest<Pod>,
    code: u16,
    reason: String,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(reason);
    response.result.code = code;
    response
}

/// Import names requested by a pod's annotation, in order.
///
/// The value is split on commas without deduplication: a name listed twice
/// gets two volume/mount passes, matching the declared order exactly.
fn requested_imports(pod: &Pod) -> Vec<String> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_IMPORT_NAMES))
        .map(|value| {
            value
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Process a single pod mutation request.
///
/// The original pod is never edited in place: mutation happens on a working
/// copy, and the emitted patch is the structural difference between the two.
/// The response is atomic - all requested imports mounted, or rejection.
async fn mutate_pod(lookup: &dyn ImportLookup, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let uid = request.uid.clone();

    let pod = match &request.object {
        Some(p) => p,
        None => {
            debug!(uid = %uid, "No pod object in request, allowing unchanged");
            return AdmissionResponse::from(request);
        }
    };

    let names = requested_imports(pod);
    if names.is_empty() {
        debug!(uid = %uid, pod = ?pod.metadata.name, "No import annotation, allowing unchanged");
        return AdmissionResponse::from(request);
    }

    // Imports are resolved in the pod's own namespace
    let namespace = match request
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone())
    {
        Some(ns) => ns,
        None => {
            warn!(uid = %uid, "Pod admission request carries no namespace");
            return AdmissionResponse::invalid("pod admission request has no namespace");
        }
    };

    info!(
        uid = %uid,
        pod = ?pod.metadata.name,
        namespace = %namespace,
        imports = names.len(),
        "Mutating pod for service account imports"
    );

    let mut mutated = pod.clone();
    for name in &names {
        let import = match lookup.import(&namespace, name).await {
            Ok(Some(import)) => import,
            Ok(None) => {
                warn!(
                    uid = %uid,
                    import = %name,
                    namespace = %namespace,
                    "ServiceAccountImport not found, denying to allow retry"
                );
                // Deny so the pod's controller retries - the import may not
                // be created yet
                return deny_with_code(
                    request,
                    404,
                    format!(
                        "ServiceAccountImport '{name}' not found in namespace '{namespace}', will retry"
                    ),
                );
            }
            Err(e) => {
                error!(
                    uid = %uid,
                    import = %name,
                    error = %e,
                    "Failed to lookup ServiceAccountImport"
                );
                return deny_with_code(request, 500, e.to_string());
            }
        };

        let secret_name = match import.first_secret_name() {
            Some(secret) => secret.to_string(),
            None => {
                warn!(
                    uid = %uid,
                    import = %name,
                    "ServiceAccountImport has no mirrored secret yet, denying to allow retry"
                );
                return deny_with_code(
                    request,
                    412,
                    format!(
                        "ServiceAccountImport '{name}' has no mirrored secret yet, will retry"
                    ),
                );
            }
        };

        apply_import_mount(&mut mutated, name, &secret_name);
    }

    let patch = match build_patch(pod, &mutated) {
        Ok(patch) => patch,
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to compute pod patch");
            return deny_with_code(request, 500, format!("patch computation error: {e}"));
        }
    };

    info!(uid = %uid, patch_ops = patch.0.len(), "Applying patch to pod");

    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to serialize patch");
            deny_with_code(request, 500, format!("patch serialization error: {e}"))
        }
    }
}

/// Add one credential volume and a read-only mount in every container.
///
/// The volume is named after the mirrored secret; the mount path is derived
/// deterministically from the import name.
fn apply_import_mount(pod: &mut Pod, import_name: &str, secret_name: &str) {
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };

    spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: secret_name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    });

    let mount = VolumeMount {
        name: secret_name.to_string(),
        mount_path: format!("{MOUNT_ROOT}/{import_name}"),
        read_only: Some(true),
        ..Default::default()
    };

    for container in &mut spec.containers {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(mount.clone());
    }
}

/// Compute the structural patch between the original pod and its mutated copy
fn build_patch(original: &Pod, mutated: &Pod) -> Result<json_patch::Patch, serde_json::Error> {
    let original = serde_json::to_value(original)?;
    let mutated = serde_json::to_value(mutated)?;
    Ok(json_patch::diff(&original, &mutated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ImportPhase, MirroredSecretRef, ServiceAccountImportSpec, ServiceAccountImportStatus,
    };
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use kube::Config;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;

    fn offline_client() -> Client {
        let config = Config::new("http://localhost:8080".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    fn annotated_pod(annotation: Option<&str>, containers: &[&str]) -> Pod {
        let mut pod = Pod {
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|name| Container {
                        name: name.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        };
        pod.metadata.name = Some("test-pod".to_string());
        if let Some(value) = annotation {
            pod.metadata.annotations = Some(BTreeMap::from([(
                ANNOTATION_IMPORT_NAMES.to_string(),
                value.to_string(),
            )]));
        }
        pod
    }

    fn admission_request(pod: &Pod) -> AdmissionRequest<Pod> {
        let review: AdmissionReview<Pod> = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "test-uid",
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "operation": "CREATE",
                "name": "test-pod",
                "namespace": "default",
                "userInfo": {},
                "object": serde_json::to_value(pod).unwrap(),
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn ready_import(name: &str, secret: &str) -> ServiceAccountImport {
        let mut import = ServiceAccountImport::new(
            name,
            ServiceAccountImportSpec {
                cluster_name: "cluster2".to_string(),
                namespace: "default".to_string(),
                name: "pod-lister".to_string(),
            },
        );
        import.metadata.namespace = Some("default".to_string());
        import.status = Some(ServiceAccountImportStatus {
            secrets: vec![MirroredSecretRef {
                name: secret.to_string(),
            }],
            phase: ImportPhase::Ready,
            ..Default::default()
        });
        import
    }

    fn unready_import(name: &str) -> ServiceAccountImport {
        let mut import = ready_import(name, "ignored");
        import.status = Some(ServiceAccountImportStatus {
            phase: ImportPhase::Pending,
            ..Default::default()
        });
        import
    }

    /// Apply the response's patch to the original pod and return the result
    fn patched_pod(pod: &Pod, response: &AdmissionResponse) -> Pod {
        let patch: json_patch::Patch =
            serde_json::from_slice(response.patch.as_ref().expect("response should carry a patch"))
                .unwrap();
        let mut value = serde_json::to_value(pod).unwrap();
        json_patch::patch(&mut value, &patch).unwrap();
        serde_json::from_value(value).unwrap()
    }

    // =========================================================================
    // Annotation Parsing
    // =========================================================================

    #[test]
    fn no_annotation_means_no_imports() {
        let pod = annotated_pod(None, &["main"]);
        assert!(requested_imports(&pod).is_empty());
    }

    #[test]
    fn empty_annotation_means_no_imports() {
        let pod = annotated_pod(Some(""), &["main"]);
        assert!(requested_imports(&pod).is_empty());
    }

    #[test]
    fn annotation_order_and_duplicates_are_preserved() {
        let pod = annotated_pod(Some("first,second,first"), &["main"]);
        assert_eq!(requested_imports(&pod), vec!["first", "second", "first"]);
    }

    #[test]
    fn empty_segments_are_skipped() {
        let pod = annotated_pod(Some("first,,second"), &["main"]);
        assert_eq!(requested_imports(&pod), vec!["first", "second"]);
    }

    // =========================================================================
    // Mount Injection
    // =========================================================================

    #[test]
    fn mount_is_added_to_every_container() {
        let mut pod = annotated_pod(Some("cluster2-default-pod-lister"), &["main", "sidecar"]);
        apply_import_mount(
            &mut pod,
            "cluster2-default-pod-lister",
            "cluster2-default-pod-lister-token-abc",
        );

        let spec = pod.spec.unwrap();
        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "cluster2-default-pod-lister-token-abc");
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("cluster2-default-pod-lister-token-abc")
        );

        for container in &spec.containers {
            let mounts = container.volume_mounts.as_ref().unwrap();
            assert_eq!(mounts.len(), 1);
            assert_eq!(mounts[0].name, "cluster2-default-pod-lister-token-abc");
            assert_eq!(
                mounts[0].mount_path,
                "/var/run/secrets/tether.dev/serviceaccountimports/cluster2-default-pod-lister"
            );
            assert_eq!(mounts[0].read_only, Some(true));
        }
    }

    #[test]
    fn unchanged_pod_produces_empty_patch() {
        let pod = annotated_pod(None, &["main"]);
        let patch = build_patch(&pod, &pod.clone()).unwrap();
        assert!(patch.0.is_empty());
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    /// Story: pods without the annotation pass through unchanged
    #[tokio::test]
    async fn story_unannotated_pod_admitted_unchanged() {
        let pod = annotated_pod(None, &["main"]);
        let request = admission_request(&pod);
        let lookup = MockImportLookup::new();

        let response = mutate_pod(&lookup, &request).await;
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    /// Story: a missing import rejects the pod rather than admitting it
    /// without its credential
    #[tokio::test]
    async fn story_missing_import_is_rejected() {
        let pod = annotated_pod(Some("absent"), &["main"]);
        let request = admission_request(&pod);

        let mut lookup = MockImportLookup::new();
        lookup
            .expect_import()
            .with(eq("default"), eq("absent"))
            .returning(|_, _| Ok(None));

        let response = mutate_pod(&lookup, &request).await;
        assert!(!response.allowed);
        assert_eq!(response.result.code, 404);
        let message = response.result.message;
        assert!(message.contains("absent"));
        assert!(message.contains("will retry"));
    }

    /// Story: an import whose secret is not mirrored yet rejects the pod
    #[tokio::test]
    async fn story_unready_import_is_rejected() {
        let pod = annotated_pod(Some("pending"), &["main"]);
        let request = admission_request(&pod);

        let mut lookup = MockImportLookup::new();
        lookup
            .expect_import()
            .returning(|_, name| Ok(Some(unready_import(name))));

        let response = mutate_pod(&lookup, &request).await;
        assert!(!response.allowed);
        assert_eq!(response.result.code, 412);
        assert!(response.result.message.contains("no mirrored secret"));
    }

    /// Story: a transport failure rejects with an internal error, distinct
    /// from the readiness rejection
    #[tokio::test]
    async fn story_lookup_failure_is_rejected() {
        let pod = annotated_pod(Some("any"), &["main"]);
        let request = admission_request(&pod);

        let mut lookup = MockImportLookup::new();
        lookup.expect_import().returning(|_, _| {
            Err(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "etcd timeout".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            }))
        });

        let response = mutate_pod(&lookup, &request).await;
        assert!(!response.allowed);
        // Internal errors carry 500, distinct from the 404/412 readiness
        // rejections
        assert_eq!(response.result.code, 500);
        assert!(response.result.message.contains("etcd timeout"));
        assert!(!response.result.message.contains("will retry"));
    }

    /// Story: the documented end-to-end mutation
    ///
    /// Import `cluster2-default-pod-lister` has a mirrored secret named
    /// `cluster2-default-pod-lister-token-abc`. A pod annotated with that
    /// import gains one volume named after the secret and a read-only mount
    /// of it in every container.
    #[tokio::test]
    async fn story_ready_import_mounts_credential() {
        let pod = annotated_pod(Some("cluster2-default-pod-lister"), &["main", "sidecar"]);
        let request = admission_request(&pod);

        let mut lookup = MockImportLookup::new();
        lookup
            .expect_import()
            .with(eq("default"), eq("cluster2-default-pod-lister"))
            .returning(|_, name| {
                Ok(Some(ready_import(name, "cluster2-default-pod-lister-token-abc")))
            });

        let response = mutate_pod(&lookup, &request).await;
        assert!(response.allowed);

        let mutated = patched_pod(&pod, &response);
        let spec = mutated.spec.unwrap();

        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "cluster2-default-pod-lister-token-abc");

        for container in &spec.containers {
            let mounts = container.volume_mounts.as_ref().unwrap();
            assert_eq!(mounts.len(), 1);
            assert_eq!(
                mounts[0].mount_path,
                "/var/run/secrets/tether.dev/serviceaccountimports/cluster2-default-pod-lister"
            );
            assert_eq!(mounts[0].read_only, Some(true));
        }
    }

    /// Story: N distinct ready imports yield N volumes and N mounts per
    /// container
    #[tokio::test]
    async fn story_multiple_imports_all_mounted() {
        let pod = annotated_pod(Some("first,second"), &["main"]);
        let request = admission_request(&pod);

        let mut lookup = MockImportLookup::new();
        lookup
            .expect_import()
            .returning(|_, name| Ok(Some(ready_import(name, &format!("{name}-token")))));

        let response = mutate_pod(&lookup, &request).await;
        assert!(response.allowed);

        let mutated = patched_pod(&pod, &response);
        let spec = mutated.spec.unwrap();

        let volume_names: Vec<_> = spec
            .volumes
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(volume_names, vec!["first-token", "second-token"]);

        let mounts = spec.containers[0].volume_mounts.as_ref().unwrap().clone();
        assert_eq!(mounts.len(), 2);
        assert_eq!(
            mounts[0].mount_path,
            "/var/run/secrets/tether.dev/serviceaccountimports/first"
        );
        assert_eq!(
            mounts[1].mount_path,
            "/var/run/secrets/tether.dev/serviceaccountimports/second"
        );
    }

    /// Story: one unready import rejects the whole pod, even when others are
    /// ready - partial mounting is never returned
    #[tokio::test]
    async fn story_one_unready_import_rejects_everything() {
        let pod = annotated_pod(Some("ready,pending"), &["main"]);
        let request = admission_request(&pod);

        let mut lookup = MockImportLookup::new();
        lookup.expect_import().returning(|_, name| {
            if name == "ready" {
                Ok(Some(ready_import(name, "ready-token")))
            } else {
                Ok(Some(unready_import(name)))
            }
        });

        let response = mutate_pod(&lookup, &request).await;
        assert!(!response.allowed);
        assert_eq!(response.result.code, 412);
        assert!(response.patch.is_none());
    }

    /// Story: a review without a request is rejected through the full
    /// handler, and the response review is well-formed
    #[tokio::test]
    async fn story_handler_rejects_malformed_review() {
        let state = Arc::new(WebhookState::new(offline_client()));
        let review: AdmissionReview<Pod> = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
        }))
        .unwrap();

        let Json(out) = mutate_handler(State(state), Json(review)).await;
        let response = out.response.expect("review should carry a response");
        assert!(!response.allowed);
    }
}
