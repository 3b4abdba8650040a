//! Tether - service account federation across Kubernetes clusters

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tether::controller::{error_policy, reconcile, Context};
use tether::crd::ServiceAccountImport;
use tether::leader::{LeaderElector, LEADER_LEASE_NAME};
use tether::registry::ClusterRegistry;
use tether::retry::{retry_with_backoff, RetryConfig};
use tether::webhook::{webhook_router, WebhookState};
use tether::{DEFAULT_WEBHOOK_PORT, FIELD_MANAGER, LABEL_IMPORT_NAME, TETHER_SYSTEM_NAMESPACE};

/// Tether - mirror remote service account credentials into local secrets
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Address the admission webhook listens on
    #[arg(long, default_value_t = format!("0.0.0.0:{DEFAULT_WEBHOOK_PORT}"))]
    webhook_addr: String,

    /// Namespace holding remote cluster connection secrets and the leader lease
    #[arg(long, default_value = TETHER_SYSTEM_NAMESPACE)]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS client is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             Remote cluster connections require a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,tether=debug,kube=info,tower=warn,hyper=warn")
        }))
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML for offline installation
        let crd = serde_yaml::to_string(&ServiceAccountImport::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli).await
}

/// Ensure the ServiceAccountImport CRD is installed
///
/// The controller installs its own CRD on startup using server-side apply,
/// so the stored CRD version always matches the running binary. Installation
/// is retried: right after cluster bootstrap the apiextensions endpoint can
/// briefly refuse writes.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd_name = format!("serviceaccountimports.{}", tether::API_GROUP);

    tracing::info!(crd = %crd_name, "Installing ServiceAccountImport CRD...");
    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crd", || {
        let crds = crds.clone();
        let params = params.clone();
        let crd_name = crd_name.clone();
        async move {
            crds.patch(&crd_name, &params, &Patch::Apply(&ServiceAccountImport::crd()))
                .await
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ServiceAccountImport CRD: {}", e))?;

    tracing::info!("ServiceAccountImport CRD installed/updated");
    Ok(())
}

/// Run the webhook server and, once leadership is held, the mirror controller
async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Tether controller starting...");

    // Identity comes from the resolver's fallback chain, so the same binary
    // runs against a mounted import credential, an ambient kubeconfig, or
    // the in-cluster service account
    let config = tether::resolver::any()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to resolve client configuration: {}", e))?;
    let client = Client::try_from(config)
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    // The webhook serves on every replica so admission never depends on which
    // replica holds the lease
    let webhook_state = Arc::new(WebhookState::new(client.clone()));
    let listener = tokio::net::TcpListener::bind(&cli.webhook_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind webhook listener on {}: {}", cli.webhook_addr, e))?;
    tracing::info!(addr = %cli.webhook_addr, "Webhook listening");

    let webhook_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, webhook_router(webhook_state)).await {
            tracing::error!(error = %e, "Webhook server failed");
        }
    });

    // Only the lease holder reconciles imports
    let identity = std::env::var("HOSTNAME").unwrap_or_else(|_| format!("tether-{}", std::process::id()));
    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        LEADER_LEASE_NAME,
        &cli.namespace,
        &identity,
    ));
    let mut guard = elector.acquire().await?;

    let registry = Arc::new(ClusterRegistry::new(client.clone(), &cli.namespace));
    let ctx = Arc::new(Context::new(client.clone(), registry.clone()));

    let imports: Api<ServiceAccountImport> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());

    tracing::info!("Starting ServiceAccountImport controller...");

    // Mirrored secrets carry an owner reference and the import label, so
    // secret events (including deletion of a mirror) requeue their import
    let controller = Controller::new(imports, WatcherConfig::default())
        .owns(secrets, WatcherConfig::default().labels(LABEL_IMPORT_NAME))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Import reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Import reconciliation error");
                }
            }
        });

    tokio::select! {
        _ = controller => {
            tracing::info!("Import controller completed");
        }
        _ = guard.lost() => {
            tracing::warn!("Leadership lost, shutting down controller");
        }
        _ = webhook_server => {
            tracing::error!("Webhook server exited");
        }
    }

    if let Err(e) = guard.release_leadership().await {
        tracing::warn!(error = %e, "Failed to release lease");
    }
    registry.shutdown().await;

    tracing::info!("Tether controller shutting down");
    Ok(())
}
