use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gateplane::{
    config::{ControlPlaneConfig, Parameters},
    observability::{init_tracing, log_config_info},
    pipeline::Pipeline,
    status::{LoggingStatusSink, StatusCache},
    store::{load_manifest_file, InMemoryStore},
    xds::{start_xds_server, SnapshotCache},
    APP_NAME, VERSION,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gateplane")]
#[command(about = "Ingress and Gateway API control plane serving Envoy over xDS")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Controller configuration file (YAML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Resource manifests to load into the store; repeatable
    #[arg(long = "resources", value_name = "FILE")]
    resources: Vec<PathBuf>,

    /// xDS server port, overrides GATEPLANE_XDS_PORT
    #[arg(long)]
    xds_port: Option<u16>,

    /// xDS bind address, overrides GATEPLANE_XDS_BIND_ADDRESS
    #[arg(long)]
    xds_address: Option<String>,

    /// Build once, report the outcome and exit without serving
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    let mut config = ControlPlaneConfig::from_env().context("loading process configuration")?;
    if let Some(port) = cli.xds_port {
        config.xds.port = port;
    }
    if let Some(address) = cli.xds_address.clone() {
        config.xds.bind_address = address;
    }
    config.validate().context("validating process configuration")?;

    init_tracing(&config.observability)?;
    info!(app_name = APP_NAME, version = VERSION, "Starting gateplane control plane");

    let params = match &cli.config {
        Some(path) => Parameters::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Parameters::defaults(),
    };
    log_config_info(&config, &params);

    let store = Arc::new(InMemoryStore::new());
    for path in &cli.resources {
        let resources = load_manifest_file(path).with_context(|| format!("loading {}", path.display()))?;
        info!(file = %path.display(), objects = resources.len(), "Loaded resource manifests");
        store.apply_all(resources);
    }

    let cache = Arc::new(SnapshotCache::new());
    let status = Arc::new(StatusCache::new(Arc::new(LoggingStatusSink)));
    let pipeline = Pipeline::new(Arc::new(params), store, cache.clone(), status, config.pipeline.clone());

    if cli.check {
        let summary = pipeline.rebuild().await?;
        info!(
            routes = summary.routes,
            invalid_objects = summary.invalid_objects,
            snapshot_version = summary.snapshot_version,
            "Configuration check complete"
        );
        if summary.invalid_objects > 0 {
            std::process::exit(2);
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for the shutdown signal");
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    let pipeline_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pipeline.run(shutdown.cancelled_owned()).await })
    };

    let xds_shutdown = shutdown.clone();
    let served = start_xds_server(&config.xds, cache, xds_shutdown.cancelled_owned()).await;

    shutdown.cancel();
    if let Err(e) = pipeline_task.await {
        error!(error = %e, "Rebuild pipeline task failed");
    }

    if let Err(e) = served {
        error!("Control plane services terminated with error: {}", e);
        std::process::exit(1);
    }

    info!("Control plane shutdown completed");
    Ok(())
}
