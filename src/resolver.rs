//! Client configuration resolution
//!
//! Turns a mounted import credential, or a fallback identity, into a usable
//! client configuration plus the remote namespace to operate in. Used by
//! workloads consuming mounted credentials, and by the controller itself to
//! run unmodified both outside any cluster (bootstrap) and in-cluster.
//!
//! Resolution entry points:
//! - [`config_for`]: a specific import by name
//! - [`sole`]: exactly one mounted import
//! - [`all`]: every mounted import, all-or-nothing
//! - [`any`]: fallback chain - sole mounted import, then ambient kubeconfig,
//!   then the in-cluster default service account

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Config;
use thiserror::Error;
use tracing::debug;

use crate::{DATA_KEY_CA, DATA_KEY_NAMESPACE, DATA_KEY_SERVER, DATA_KEY_TOKEN, MOUNT_ROOT};

/// Errors from configuration resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The named import has no credential mounted
    #[error("no credential mounted for import '{0}'")]
    NotMounted(String),

    /// No import is mounted at all
    #[error("no imports mounted")]
    NoneMounted,

    /// More than one import is mounted where exactly one was expected
    #[error("{0} imports mounted, expected exactly one")]
    Ambiguous(usize),

    /// A mounted credential exists but could not be read or parsed
    #[error("credential for import '{name}' unreadable: {message}")]
    Unreadable {
        /// Import whose credential failed to read
        name: String,
        /// What went wrong
        message: String,
    },

    /// Building the client configuration from credential material failed
    #[error("failed to build client configuration: {0}")]
    Config(String),

    /// The fallback chain was exhausted without finding an identity
    #[error("no usable identity: no mounted import, no ambient kubeconfig, not in cluster")]
    NoIdentity,
}

impl ResolveError {
    fn unreadable(name: &str, message: impl Into<String>) -> Self {
        Self::Unreadable {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Credential material read from a mounted import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedCredentials {
    /// Bearer token for the remote service account
    pub token: String,
    /// Remote namespace the credential is scoped to
    pub namespace: String,
    /// Remote API server URL
    pub server: String,
    /// Remote API CA certificate in PEM form, if mirrored
    pub ca_pem: Option<Vec<u8>>,
}

/// A resolved client configuration and the namespace to operate in
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Client configuration for the remote API
    pub config: Config,
    /// Remote namespace the credential is scoped to
    pub namespace: String,
}

/// List the import names that currently have credentials mounted
pub fn mounted_imports() -> Vec<String> {
    mounted_imports_at(Path::new(MOUNT_ROOT))
}

fn mounted_imports_at(root: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

/// Read the mounted credential for a specific import name
pub fn load(name: &str) -> Result<MountedCredentials, ResolveError> {
    load_at(Path::new(MOUNT_ROOT), name)
}

fn load_at(root: &Path, name: &str) -> Result<MountedCredentials, ResolveError> {
    let dir: PathBuf = root.join(name);
    if !dir.is_dir() {
        return Err(ResolveError::NotMounted(name.to_string()));
    }

    let read_key = |key: &str| -> Result<String, ResolveError> {
        std::fs::read_to_string(dir.join(key))
            .map_err(|e| ResolveError::unreadable(name, format!("{key}: {e}")))
    };

    let token = read_key(DATA_KEY_TOKEN)?;
    let namespace = read_key(DATA_KEY_NAMESPACE)?;
    let server = read_key(DATA_KEY_SERVER)?;
    // CA is optional: the remote API may use a publicly trusted certificate
    let ca_pem = std::fs::read(dir.join(DATA_KEY_CA)).ok();

    Ok(MountedCredentials {
        token: token.trim_end().to_string(),
        namespace: namespace.trim_end().to_string(),
        server: server.trim_end().to_string(),
        ca_pem,
    })
}

/// Build an in-memory kubeconfig from raw credential material.
///
/// The single cluster/user/context triple is named after the import or
/// cluster so errors in downstream logs stay attributable.
pub fn build_kubeconfig(
    name: &str,
    server: &str,
    ca_pem: Option<&[u8]>,
    token: &str,
    namespace: Option<&str>,
) -> Result<Kubeconfig, ResolveError> {
    let mut cluster = serde_json::json!({ "server": server });
    if let Some(ca) = ca_pem {
        cluster["certificate-authority-data"] = STANDARD.encode(ca).into();
    }

    let mut context = serde_json::json!({ "cluster": name, "user": name });
    if let Some(ns) = namespace {
        context["namespace"] = ns.into();
    }

    let value = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": name, "cluster": cluster }],
        "users": [{ "name": name, "user": { "token": token } }],
        "contexts": [{ "name": name, "context": context }],
        "current-context": name,
    });

    serde_json::from_value(value).map_err(|e| ResolveError::Config(e.to_string()))
}

/// Build a client configuration from loaded credential material
pub async fn config_from_credentials(
    name: &str,
    creds: &MountedCredentials,
) -> Result<Config, ResolveError> {
    let kubeconfig = build_kubeconfig(
        name,
        &creds.server,
        creds.ca_pem.as_deref(),
        &creds.token,
        Some(&creds.namespace),
    )?;

    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ResolveError::Config(e.to_string()))
}

/// Resolve the configuration for a specific import by name
pub async fn config_for(name: &str) -> Result<ImportConfig, ResolveError> {
    config_for_at(Path::new(MOUNT_ROOT), name).await
}

async fn config_for_at(root: &Path, name: &str) -> Result<ImportConfig, ResolveError> {
    let creds = load_at(root, name)?;
    let config = config_from_credentials(name, &creds).await?;
    Ok(ImportConfig {
        config,
        namespace: creds.namespace,
    })
}

/// Resolve the single mounted import.
///
/// Fails with [`ResolveError::NoneMounted`] when nothing is mounted and
/// [`ResolveError::Ambiguous`] when more than one import is.
pub async fn sole() -> Result<(String, ImportConfig), ResolveError> {
    sole_at(Path::new(MOUNT_ROOT)).await
}

async fn sole_at(root: &Path) -> Result<(String, ImportConfig), ResolveError> {
    let names = mounted_imports_at(root);
    match names.as_slice() {
        [] => Err(ResolveError::NoneMounted),
        [name] => {
            let config = config_for_at(root, name).await?;
            Ok((name.clone(), config))
        }
        more => Err(ResolveError::Ambiguous(more.len())),
    }
}

/// Resolve every mounted import.
///
/// All-or-nothing: a read failure on any one mounted credential fails the
/// whole call rather than returning a partial map.
pub async fn all() -> Result<BTreeMap<String, ImportConfig>, ResolveError> {
    all_at(Path::new(MOUNT_ROOT)).await
}

async fn all_at(root: &Path) -> Result<BTreeMap<String, ImportConfig>, ResolveError> {
    let mut configs = BTreeMap::new();
    for name in mounted_imports_at(root) {
        let config = config_for_at(root, &name).await?;
        configs.insert(name, config);
    }
    Ok(configs)
}

/// Resolve a configuration from the fallback chain.
///
/// A mounted import always wins. Failing that, an ambient kubeconfig
/// (out-of-cluster bootstrap operation), and finally the process's own
/// in-cluster default service account. Only exhausting all three fails.
pub async fn any() -> Result<Config, ResolveError> {
    any_at(Path::new(MOUNT_ROOT)).await
}

async fn any_at(root: &Path) -> Result<Config, ResolveError> {
    match sole_at(root).await {
        Ok((name, import)) => {
            debug!(import = %name, "Resolved configuration from mounted import");
            return Ok(import.config);
        }
        Err(ResolveError::NoneMounted) => {}
        Err(e) => return Err(e),
    }

    if let Ok(config) = Config::from_kubeconfig(&KubeConfigOptions::default()).await {
        debug!("Resolved configuration from ambient kubeconfig");
        return Ok(config);
    }

    match Config::incluster() {
        Ok(config) => {
            debug!("Resolved configuration from in-cluster service account");
            Ok(config)
        }
        Err(_) => Err(ResolveError::NoIdentity),
    }
}
