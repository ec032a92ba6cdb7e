use anyhow::{Context, Result};
use std::fs;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use modelherd::cluster::apply::ModelStore;
use modelherd::cluster::consensus::ConsensusNode;
use modelherd::cluster::storage::StateStore;
use modelherd::config::Config;
use modelherd::dashboard;
use modelherd::server::ClientServer;
use modelherd::trainer::Trainer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modelherd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)?;
    info!("node {} starting with config {}", config.node_config().id(), config_path);

    fs::create_dir_all(&config.node.data_dir)
        .with_context(|| format!("creating data dir {}", config.node.data_dir.display()))?;
    fs::create_dir_all(config.staging_dir())
        .with_context(|| format!("creating staging dir {}", config.staging_dir().display()))?;
    let models = ModelStore::new(config.models_dir())?;

    let node = ConsensusNode::new(
        config.node_config(),
        config.raft_timing(),
        StateStore::new(&config.node.data_dir),
        models.clone().callback(),
    );
    node.start().await?;

    let client_listener =
        TcpListener::bind((config.node.host.as_str(), config.node.client_port))
            .await
            .with_context(|| format!("binding client port {}", config.node.client_port))?;
    info!(
        "client interface on {}:{}",
        config.node.host, config.node.client_port
    );
    let client = ClientServer::new(
        node.clone(),
        Trainer::new(&config.trainer),
        models.clone(),
        config.staging_dir(),
    );
    tokio::spawn(client.serve(client_listener));

    if config.dashboard.enabled {
        let listener = TcpListener::bind((config.node.host.as_str(), config.dashboard.port))
            .await
            .with_context(|| format!("binding dashboard port {}", config.dashboard.port))?;
        info!(
            "dashboard on http://{}:{}",
            config.node.host, config.dashboard.port
        );
        let app = dashboard::router(node.clone(), models.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("dashboard server failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.stop().await;
    Ok(())
}
