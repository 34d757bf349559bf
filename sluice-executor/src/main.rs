use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use sluice_executor::{api, janitor::Janitor, registration, ApiContext, Config};
use sluice_protocol::cluster::PeerNode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Control-plane node hosting sluice pipelines and jobs
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Name of this node within the cluster
    #[arg(long, env = "SLUICE_NAME")]
    name: String,

    /// Host address to bind to
    #[arg(long, env = "SLUICE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "SLUICE_PORT", default_value = "8081")]
    port: u16,

    /// Hostname other nodes use to reach this one, defaults to the bind host
    #[arg(long, env = "SLUICE_HOSTNAME")]
    hostname: Option<String>,

    /// Username for basic authentication of control routes
    #[arg(long, env = "SLUICE_USERNAME")]
    username: String,

    /// Password for basic authentication of control routes
    #[arg(long, env = "SLUICE_PASSWORD", hide_env_values = true)]
    password: String,

    /// Accept slave registrations
    #[arg(long, env = "SLUICE_MASTER")]
    master: bool,

    /// Urls of masters to register with, comma separated
    #[arg(long, env = "SLUICE_MASTERS", value_delimiter = ',')]
    masters: Vec<String>,

    /// Seconds between two registrations with the masters
    #[arg(long, env = "SLUICE_REGISTRATION_INTERVAL_SECS", default_value = "30")]
    registration_interval_secs: u64,

    /// Log lines kept per execution
    #[arg(long, env = "SLUICE_MAX_LOG_LINES", default_value = "5000")]
    max_log_lines: usize,

    /// Minutes after which buffered log lines are dropped
    #[arg(long, env = "SLUICE_LOG_RETENTION_MINUTES")]
    log_retention_minutes: Option<u64>,

    /// Minutes a finished execution is kept before it is removed
    #[arg(long, env = "SLUICE_OBJECT_RETENTION_MINUTES", default_value = "1440")]
    object_retention_minutes: u64,

    /// Seconds between two janitor sweeps
    #[arg(long, env = "SLUICE_JANITOR_INTERVAL_SECS", default_value = "60")]
    janitor_interval_secs: u64,

    /// Seconds without registration after which a slave is considered inactive
    #[arg(long, env = "SLUICE_PEER_TIMEOUT_SECS", default_value = "300")]
    peer_timeout_secs: u64,

    /// Create unknown sequences on first use, starting at this value
    #[arg(long, env = "SLUICE_SEQUENCE_AUTO_START")]
    sequence_auto_start: Option<i64>,

    /// Repositories as name=location, comma separated
    #[arg(long, env = "SLUICE_REPOSITORIES", value_delimiter = ',')]
    repositories: Vec<String>,

    /// Properties served to peers as name=value, comma separated
    #[arg(long, env = "SLUICE_PROPERTIES", value_delimiter = ',')]
    properties: Vec<String>,

    /// Logging level (info, debug, trace)
    #[arg(long, env = "SLUICE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn config(&self) -> anyhow::Result<Config> {
        let node = PeerNode {
            master: self.master,
            ..PeerNode::new(
                self.name.clone(),
                self.hostname.clone().unwrap_or_else(|| self.host.clone()),
                self.port.to_string(),
            )
        };

        let config = Config::try_new(node, &self.username, &self.password)?
            .with_log_limits(self.max_log_lines, self.log_retention_minutes)?
            .with_object_retention(self.object_retention_minutes)?
            .with_janitor_interval(Duration::from_secs(self.janitor_interval_secs))?
            .with_peer_timeout(self.peer_timeout_secs)?
            .with_sequence_auto_start(self.sequence_auto_start)
            .with_masters(self.masters.iter().map(String::as_str))?
            .with_repositories(self.repositories.iter().map(String::as_str))?
            .with_properties(self.properties.iter().map(String::as_str))?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = Level::from_str(cli.log_level.to_lowercase().as_str()).unwrap_or(Level::INFO);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true),
        )
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    let config = cli.config().context("Invalid configuration")?;
    info!(
        node = %config.node,
        master = config.node.master,
        masters = config.masters.len(),
        version = %env!("CARGO_PKG_VERSION"),
        "Starting sluice executor"
    );

    let context = Arc::new(ApiContext::new(config));

    let shutdown_token = CancellationToken::new();
    let shutdown_token_ = shutdown_token.clone();
    tokio::spawn(async move {
        handle_shutdown_signals(shutdown_token_).await;
    });

    let janitor_handle = tokio::spawn(Janitor::new(Arc::clone(&context)).run(shutdown_token.clone()));
    let registration_handle = tokio::spawn(registration::run(
        context.config.clone(),
        Duration::from_secs(cli.registration_interval_secs.max(1)),
        shutdown_token.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .context("Failed to parse socket address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(addr = %addr, "Server started, press Ctrl+C to stop");
    let served = axum::serve(listener, api::app(context))
        .with_graceful_shutdown(shutdown_signal_handler(shutdown_token.clone()))
        .await;

    match served {
        Ok(_) => info!("Server shut down gracefully"),
        Err(e) => error!(error = %e, "Server error during shutdown"),
    }

    shutdown_token.cancel();
    let _ = tokio::join!(janitor_handle, registration_handle);

    info!("Sluice executor shutdown complete");
    Ok(())
}

/// Handler function for shutdown signals
async fn handle_shutdown_signals(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    shutdown_token.cancel();
}

/// Resolves once shutdown was requested, leaving in-flight requests a moment to finish
async fn shutdown_signal_handler(token: CancellationToken) {
    token.cancelled().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
}
