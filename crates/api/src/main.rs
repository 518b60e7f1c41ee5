use std::sync::Arc;

use anyhow::Context;

use warden_api::app::{self, services};
use warden_infra::OrchestratorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    warden_observability::init();

    let config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;
    let bind_addr = std::env::var("WARDEN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let services = Arc::new(services::build_services(config).await?);
    let background = services.start_background();
    let app = app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    background.shutdown().await;
    Ok(())
}
