//! `aicurate` server binary: reads the configuration, installs logging and
//! serves the API until interrupted.

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use aicurate_server::cli::ServerConfig;

fn init_tracing(diagnostic: bool) {
    let default = if diagnostic {
        "info,aicurate_core=debug,aicurate_server=debug,tower_http=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let config = ServerConfig::parse();
    init_tracing(config.environment.is_diagnostic());

    let listen = config.listen;
    let environment = config.environment;
    let state = config.into_state()?;

    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, %environment, "aicurate server listening");
    axum::serve(listener, aicurate_server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
