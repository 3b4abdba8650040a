//! Remote cluster connection registry
//!
//! Resolves a cluster name to a usable API client connection and caches it.
//! Connection material comes from whichever bootstrap-provisioned source
//! exists for that name: a secret in the system namespace (in-cluster
//! operation), or a same-named context in the ambient kubeconfig
//! (out-of-cluster bootstrap operation).
//!
//! Successful resolutions are cached for the life of the process. Failed
//! resolutions are never cached: bootstrap material may arrive after the
//! first import referencing the cluster, so every call retries the build.
//! Concurrent calls for the same name coalesce into a single build; distinct
//! names build independently.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use crate::error::Error;
use crate::resolver;
use crate::{Result, DATA_KEY_CA, DATA_KEY_SERVER, DATA_KEY_TOKEN};

/// A cached, usable connection to a named remote cluster.
///
/// Carries the API endpoint and CA alongside the client because the mirror
/// controller writes both into the mirrored secret.
#[derive(Clone)]
pub struct RemoteConnection {
    /// Client for the remote API
    pub client: Client,
    /// Remote API server URL
    pub server: String,
    /// Remote API CA certificate in PEM form, if known
    pub ca_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("server", &self.server)
            .field("ca_pem", &self.ca_pem.as_ref().map(|c| c.len()))
            .finish_non_exhaustive()
    }
}

/// Registry of remote cluster connections, keyed by cluster name
pub struct ClusterRegistry {
    client: Client,
    namespace: String,
    connections: RwLock<HashMap<String, Arc<OnceCell<RemoteConnection>>>>,
}

impl ClusterRegistry {
    /// Create a registry reading connection secrets from the given namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a connection for the named cluster, building it on first use.
    ///
    /// Calls for the same name while a build is in flight wait for that build
    /// rather than starting their own. A build failure leaves the slot empty
    /// so the next call retries.
    pub async fn connection(&self, cluster_name: &str) -> Result<RemoteConnection> {
        let cell = self.cell_for(cluster_name).await;
        cell.get_or_try_init(|| self.build_connection(cluster_name))
            .await
            .cloned()
    }

    /// Drop the cached connection for a cluster.
    ///
    /// Call when the cluster's bootstrap secret rotates; the next
    /// [`connection`](Self::connection) call rebuilds from fresh material.
    pub async fn invalidate(&self, cluster_name: &str) {
        let removed = self.connections.write().await.remove(cluster_name);
        if removed.is_some() {
            info!(cluster = %cluster_name, "Invalidated cached connection");
        }
    }

    /// Drop every cached connection. Call on process shutdown.
    pub async fn shutdown(&self) {
        self.connections.write().await.clear();
    }

    async fn cell_for(&self, cluster_name: &str) -> Arc<OnceCell<RemoteConnection>> {
        if let Some(cell) = self.connections.read().await.get(cluster_name) {
            return Arc::clone(cell);
        }
        let mut map = self.connections.write().await;
        Arc::clone(
            map.entry(cluster_name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Build a connection from whichever material exists for this cluster
    async fn build_connection(&self, cluster_name: &str) -> Result<RemoteConnection> {
        // Preferred source: a bootstrap-provisioned secret named after the
        // cluster in the system namespace
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        match secrets.get(cluster_name).await {
            Ok(secret) => {
                let material = parse_connection_secret(&secret, cluster_name)?;
                debug!(
                    cluster = %cluster_name,
                    server = %material.server,
                    "Building connection from bootstrap secret"
                );
                return self.connect(cluster_name, material).await;
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(
                    cluster = %cluster_name,
                    namespace = %self.namespace,
                    "No bootstrap secret, trying ambient kubeconfig context"
                );
            }
            Err(e) => return Err(e.into()),
        }

        // Fallback for out-of-cluster operation: a kubeconfig context with
        // the cluster's name
        self.connect_from_context(cluster_name).await
    }

    async fn connect(
        &self,
        cluster_name: &str,
        material: ConnectionMaterial,
    ) -> Result<RemoteConnection> {
        let kubeconfig = resolver::build_kubeconfig(
            cluster_name,
            &material.server,
            material.ca_pem.as_deref(),
            &material.token,
            None,
        )
        .map_err(|e| Error::remote_unreachable(cluster_name, e.to_string()))?;

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::remote_unreachable(cluster_name, e.to_string()))?;

        let client = Client::try_from(config)
            .map_err(|e| Error::remote_unreachable(cluster_name, e.to_string()))?;

        info!(cluster = %cluster_name, server = %material.server, "Remote connection established");
        Ok(RemoteConnection {
            client,
            server: material.server,
            ca_pem: material.ca_pem,
        })
    }

    async fn connect_from_context(&self, cluster_name: &str) -> Result<RemoteConnection> {
        let kubeconfig = Kubeconfig::read().map_err(|e| {
            Error::connection_not_found(
                cluster_name,
                format!(
                    "no secret '{cluster_name}' in namespace '{}' and no kubeconfig: {e}",
                    self.namespace
                ),
            )
        })?;

        let ca_pem = context_ca_pem(&kubeconfig, cluster_name);

        let options = KubeConfigOptions {
            context: Some(cluster_name.to_string()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| {
                Error::connection_not_found(
                    cluster_name,
                    format!("no kubeconfig context '{cluster_name}': {e}"),
                )
            })?;

        let server = config.cluster_url.to_string();
        let client = Client::try_from(config)
            .map_err(|e| Error::remote_unreachable(cluster_name, e.to_string()))?;

        info!(cluster = %cluster_name, server = %server, "Remote connection from kubeconfig context");
        Ok(RemoteConnection {
            client,
            server,
            ca_pem,
        })
    }
}

/// Connection material extracted from a bootstrap secret
#[derive(Debug, Clone)]
struct ConnectionMaterial {
    server: String,
    token: String,
    ca_pem: Option<Vec<u8>>,
}

/// Extract server, token, and CA from a bootstrap secret.
///
/// The secret carries the same data keys as a mirrored secret: `server`,
/// `token`, and optionally `ca.crt`.
fn parse_connection_secret(secret: &Secret, cluster_name: &str) -> Result<ConnectionMaterial> {
    let data = secret.data.as_ref().ok_or_else(|| {
        Error::connection_not_found(cluster_name, "bootstrap secret has no data")
    })?;

    let string_key = |key: &str| -> Result<String> {
        let bytes = data.get(key).ok_or_else(|| {
            Error::connection_not_found(
                cluster_name,
                format!("bootstrap secret missing key '{key}'"),
            )
        })?;
        String::from_utf8(bytes.0.clone())
            .map_err(|e| Error::serialization(format!("bootstrap secret key '{key}': {e}")))
    };

    Ok(ConnectionMaterial {
        server: string_key(DATA_KEY_SERVER)?,
        token: string_key(DATA_KEY_TOKEN)?,
        ca_pem: data.get(DATA_KEY_CA).map(|b| b.0.clone()),
    })
}

/// Find the CA bytes for the named context in a kubeconfig
fn context_ca_pem(kubeconfig: &Kubeconfig, context_name: &str) -> Option<Vec<u8>> {
    let context = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)?
        .context
        .as_ref()?;
    let cluster = kubeconfig
        .clusters
        .iter()
        .find(|c| c.name == context.cluster)?
        .cluster
        .as_ref()?;

    if let Some(ref encoded) = cluster.certificate_authority_data {
        return STANDARD.decode(encoded).ok();
    }
    if let Some(ref path) = cluster.certificate_authority {
        return std::fs::read(path).ok();
    }
    None
}
