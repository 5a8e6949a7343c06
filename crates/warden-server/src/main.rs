//! Warden daemon entry point

use std::sync::Arc;

use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};
use warden_server::{Config, Node};

fn get_env_filter() -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else if cfg!(debug_assertions) {
        EnvFilter::new("wardend=debug,warden_server=debug")
    } else {
        EnvFilter::new("wardend=info,warden_server=info")
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating shutdown...");
                    }
                }
            }
            _ => {
                tracing::warn!("Failed to register signal handlers, falling back to Ctrl+C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to register Ctrl+C handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to register Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .append(true)
        .open("server.log")?;

    // Non-blocking log appenders
    let (file_non_blocking, file_guard) = tracing_appender::non_blocking(log_file);
    let (console_non_blocking, console_guard) = tracing_appender::non_blocking(std::io::stderr());
    let _guards = (file_guard, console_guard);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_thread_ids(true)
        .with_thread_names(true);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(console_non_blocking)
        .with_ansi(true)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::time())
        .compact();

    Registry::default()
        .with(get_env_filter())
        .with(file_layer)
        .with(stderr_layer)
        .init();

    let config = Config::load_from_path("config.toml")?;

    #[cfg(debug_assertions)]
    {
        tracing::debug!("Server running in debug mode");
        if let Ok(cwd) = std::env::current_dir() {
            tracing::debug!("Current Working Directory: {}", cwd.display());
        }
    }

    let address = format!("{}:{}", config.node.host, config.node.port);
    let node = Arc::new(Node::open(config, 0)?);
    tracing::info!(
        node = node.name(),
        state = %node.state(),
        "Warden node ready on {address}"
    );

    shutdown_signal().await;

    node.shutdown();
    tracing::info!("Warden node stopped");
    Ok(())
}
