use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;
use wa_gateway::create_app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wa_gateway=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let (state, app) = create_app().await?;
    let booted = state.registry.boot().await?;

    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, bots = booted, "wa-gateway listening");

    let registry = state.registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {err}");
            }
            tracing::info!("shutting down");
        })
        .await?;

    registry.shutdown_all().await;
    Ok(())
}
