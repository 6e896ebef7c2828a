use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use uiupdate::{create_router, listener, AgentConfig, UiAgent, UiUpdateError, UiUpdateResult};
use uiupdate_core::zk::ZkClient;

#[derive(Parser)]
#[command(name = "uiupdate")]
#[command(about = "Keeps the UI served by every master on the cluster's version", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, env = "UIUPDATE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, unless a socket is handed over
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// ZooKeeper connection string
    #[arg(long)]
    zk_address: Option<String>,

    /// Node id, detected from the host when unset
    #[arg(long)]
    node_id: Option<String>,

    /// Default log filter, e.g. "info" or "uiupdate_core=debug"
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(listen) = self.listen {
            config.http.listen_address = listen;
        }
        if let Some(address) = &self.zk_address {
            config.zookeeper.address = address.clone();
        }
        if let Some(node_id) = &self.node_id {
            config.node.id = Some(node_id.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> UiUpdateResult<()> {
    let cli = Cli::parse();
    let mut config = AgentConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level).map_err(|e| {
            UiUpdateError::ConfigurationError {
                component: "logging".to_string(),
                message: format!("Invalid log directive: {}", e),
            }
        })?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (agent, connection) = UiAgent::from_config(&config).await?;
    let version = agent.ready().await?;
    info!(node_id = %agent.node_id(), version = %version, "cluster version loaded");

    let listener = listener::acquire(config.http.listen_address).await?;
    let router = create_router(agent.service().clone());
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    agent.shutdown().await;
    connection.close().await;

    served.map_err(|e| UiUpdateError::Internal {
        message: format!("HTTP server error: {}", e),
    })
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("shutting down");
}
