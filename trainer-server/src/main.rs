use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use trainer_server::api;
use trainer_server::clock::{Clock, SystemClock};
use trainer_server::config_store::ConfigStore;
use trainer_server::planner::PlannerSettings;
use trainer_server::provider::{AwsSettings, ProviderType, build_provider, default_catalog, load_catalog};
use trainer_server::trainer::{Trainer, TrainerSettings};

/// Trainer - cluster orchestrator for containerized applications
#[derive(Parser)]
#[command(name = "trainer-server")]
#[command(version)]
#[command(about = "Trainer - cluster orchestrator for containerized applications")]
struct Args {
    /// Port for the check-in and admin API
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Data directory for persisted configuration
    #[arg(long, default_value = "/var/lib/trainer")]
    data_dir: String,

    /// Cloud provider backing the fleet
    #[arg(long, value_enum, default_value_t = ProviderType::Test)]
    provider: ProviderType,

    /// Instance type catalog file (JSON); the built-in catalog when omitted
    #[arg(long)]
    catalog: Option<String>,

    /// Planner tick interval in seconds
    #[arg(long, default_value_t = 10)]
    tick_interval_secs: u64,

    /// Instance type assumed for hosts the provider cannot describe
    #[arg(long, default_value = "i1")]
    default_instance_type: String,

    /// AWS access key (AWS provider only)
    #[arg(long, env = "TRAINER_AWS_ACCESS_KEY", default_value = "")]
    aws_access_key: String,

    /// AWS secret key (AWS provider only)
    #[arg(long, env = "TRAINER_AWS_SECRET_KEY", default_value = "", hide_env_values = true)]
    aws_secret_key: String,

    /// AWS region (AWS provider only)
    #[arg(long, default_value = "us-east-1")]
    aws_region: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    tracing::info!("Trainer v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Data directory: {}", args.data_dir);

    let data_dir = PathBuf::from(&args.data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let catalog = match &args.catalog {
        Some(path) => load_catalog(Path::new(path))?,
        None => default_catalog(),
    };
    let provider = build_provider(
        args.provider,
        catalog,
        AwsSettings {
            access_key: args.aws_access_key.clone(),
            secret_key: args.aws_secret_key.clone(),
            region: args.aws_region.clone(),
            ..Default::default()
        },
    );

    let config = Arc::new(ConfigStore::open(data_dir.join("apps.json"))?);
    tracing::info!(
        applications = config.get_all().len(),
        "configuration loaded from {}",
        config.path().display()
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let settings = TrainerSettings {
        planner: PlannerSettings {
            tick_interval: Duration::from_secs(args.tick_interval_secs),
            ..Default::default()
        },
        default_instance_type: args.default_instance_type.clone(),
    };
    let trainer = Arc::new(Trainer::new(config, provider, clock, settings));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let planner = Arc::new(trainer.planner());
    let planner_task = tokio::spawn(planner.run(shutdown_rx));

    let app = api::router(trainer.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    tracing::info!("API listening on port {}", args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), planner_task).await;
    tracing::info!("trainer stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown signal received");
    }
}
