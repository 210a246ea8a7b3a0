use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use rudder_controller::{Engine, Scheduler, SchedulerConfig};
use rudder_kubehub::{spawn_watchers, KubeBundleApi, KubeSourceStore, KubeTargetStore, ManagedBundle};
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rudderd", version, about = "Bundle reconcile daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconcile loop against the current kube context
    Run {
        /// Only reconcile bundles carrying this class
        #[arg(long = "class")]
        class: Option<String>,

        /// Restrict watches to one namespace (default: all namespaces)
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
    /// Print the ManagedBundle CRD manifest as YAML
    Crd,
}

fn init_tracing() {
    let env = std::env::var("RUDDER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RUDDER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RUDDER_METRICS_ADDR; expected host:port");
        }
    }
}

async fn run(class: Option<String>, namespace: Option<String>) -> Result<()> {
    let client = Client::try_default().await?;

    let engine = Engine::new(
        Arc::new(KubeTargetStore::new(client.clone())),
        Arc::new(KubeSourceStore::new(client.clone())),
        Arc::new(KubeBundleApi::new(client.clone())),
    )
    .with_class(class.clone());
    let index = engine.ownership();

    let scheduler = Scheduler::spawn(Arc::new(engine), SchedulerConfig::from_env());
    let _sources = spawn_watchers(client, namespace.clone(), index, scheduler.sender());

    info!(class = ?class, ns = ?namespace, "rudderd running");
    signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { class, namespace } => run(class, namespace).await,
        Commands::Crd => {
            println!("{}", serde_yaml::to_string(&ManagedBundle::crd())?);
            Ok(())
        }
    }
}
