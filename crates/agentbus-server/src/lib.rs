// HTTP Server
// Thin surface over the orchestrator: job CRUD, the approval endpoints,
// artifact and usage reads, the SSE event stream, /metrics, and /health.

use std::net::SocketAddr;
use std::sync::Arc;

use agentbus_core::Orchestrator;

mod http;

pub use http::app_router;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let router = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "agentbus http server listening");
    axum::serve(listener, router).await
}
