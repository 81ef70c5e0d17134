//! Dataplane operator - reconciles OpenStackDataPlaneNodeSet resources

mod controller_runner;

use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dataplane_common::crd::{OpenStackDataPlaneDeployment, OpenStackDataPlaneNodeSet};
use dataplane_common::DEFAULT_FIELD_MANAGER;

use controller_runner::{run_node_set_controller, RunnerConfig};

/// Dataplane operator - drives data plane node sets to a deployable state
#[derive(Parser, Debug)]
#[command(name = "dataplane-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Field manager used for server-side apply and status writes
    #[arg(long, env = "DATAPLANE_FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,

    /// Seconds to wait for the SSH key secret before reporting it as an error
    #[arg(long, env = "DATAPLANE_CREDENTIAL_TIMEOUT_SECS", default_value = "5")]
    credential_timeout_secs: u64,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "DATAPLANE_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The operator cannot reach the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli).await,
    }
}

fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Both CRDs as a multi-document YAML stream
fn crd_manifests() -> anyhow::Result<String> {
    let node_set = serde_yaml::to_string(&OpenStackDataPlaneNodeSet::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize NodeSet CRD: {}", e))?;
    let deployment = serde_yaml::to_string(&OpenStackDataPlaneDeployment::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize Deployment CRD: {}", e))?;
    Ok(format!("{node_set}---\n{deployment}"))
}

async fn run_controller(cli: &Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    tracing::info!("Starting dataplane controllers...");
    run_node_set_controller(
        client,
        RunnerConfig {
            field_manager: cli.field_manager.clone(),
            credential_timeout: Duration::from_secs(cli.credential_timeout_secs),
            watch_namespace: cli.watch_namespace.clone(),
        },
    )
    .await;

    tracing::info!("Dataplane controllers shut down");
    Ok(())
}
