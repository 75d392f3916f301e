pub mod events;
pub mod router;
pub mod state;

pub use router::build_router;
pub use state::AppState;

use tracing::info;

/// Bind and serve the JSON API (and console page) until shutdown.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(addr = %listener.local_addr()?, "api server listening");
    axum::serve(listener, router).await?;
    Ok(())
}
