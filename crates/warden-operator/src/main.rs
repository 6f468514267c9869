//! Warden Operator - keeps each IdentityServer's Ingress converged

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};

use warden_common::crd::IdentityServer;
use warden_common::telemetry::{init_telemetry, TelemetryConfig};
use warden_common::OPERATOR_NAME;
use warden_ingress::ReconcileConfig;
use warden_operator::controller_runner::{build_ingress_controllers, IngressControllerConfig};

/// Warden - reconciles the Ingress of IdentityServer resources
#[derive(Parser, Debug)]
#[command(name = "warden-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

#[derive(Args, Debug, Clone, PartialEq)]
struct ControllerArgs {
    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "WARDEN_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// IdentityServers reconciled in parallel
    #[arg(long, env = "WARDEN_CONCURRENCY", default_value_t = 4)]
    concurrency: u16,

    /// Periodic resync once converged, in seconds
    #[arg(long, env = "WARDEN_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Timeout for a single Kubernetes API call, in seconds
    #[arg(long, env = "WARDEN_CALL_TIMEOUT_SECS", default_value_t = 10)]
    call_timeout_secs: u64,

    /// Deadline for a whole reconcile pass, in seconds
    #[arg(long, env = "WARDEN_PASS_DEADLINE_SECS", default_value_t = 60)]
    pass_deadline_secs: u64,

    /// Window that coalesces bursts of events for one server, in milliseconds
    #[arg(long, env = "WARDEN_DEBOUNCE_MS", default_value_t = 500)]
    debounce_ms: u64,

    /// Do not install or update the IdentityServer CRD on startup
    #[arg(long, env = "WARDEN_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,
}

impl ControllerArgs {
    fn controller_config(&self) -> IngressControllerConfig {
        IngressControllerConfig {
            watch_namespace: self.watch_namespace.clone(),
            concurrency: self.concurrency,
            debounce: Duration::from_millis(self.debounce_ms),
            reconcile: ReconcileConfig {
                resync_interval: Duration::from_secs(self.resync_secs),
                call_timeout: Duration::from_secs(self.call_timeout_secs),
                pass_deadline: Duration::from_secs(self.pass_deadline_secs),
                ..Default::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML
        let crd = serde_yaml::to_string(&IdentityServer::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

/// Ensure the IdentityServer CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply.
/// This ensures the CRD version always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(OPERATOR_NAME).force();

    tracing::info!("Installing IdentityServer CRD...");
    crds.patch(
        IdentityServer::crd_name(),
        &params,
        &Patch::Apply(&IdentityServer::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install IdentityServer CRD: {}", e))?;

    tracing::info!("IdentityServer CRD installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crds_installed(&client).await?;
    }

    tracing::info!("Starting Warden controllers:");
    let controllers = build_ingress_controllers(client, args.controller_config());

    futures::future::join_all(controllers).await;
    tracing::info!("Warden controllers stopped");
    Ok(())
}
