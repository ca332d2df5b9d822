use super::api::{create_router, AppState};
use crate::config::WebConfig;
use tokio_util::sync::CancellationToken;

/// Serve the status API until `shutdown` is cancelled
pub async fn run_server(
    state: AppState,
    web_config: WebConfig,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&web_config.listen).await?;
    tracing::info!("Status API listening on {}", web_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("Status API shutting down gracefully");
        })
        .await
}
