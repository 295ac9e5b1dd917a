//! HTTP server setup and configuration.

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::continuation::RelayPolicy;
use super::handlers;
use super::upstream::{HttpTransport, UpstreamTransport};
use crate::config::Config;
use crate::router::Router as ModelRouter;

/// Response header carrying the per-request correlation ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation ID assigned to every inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Shared application state. Everything in here is read-only.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ModelRouter>,
    pub transport: Arc<dyn UpstreamTransport>,
    pub policy: RelayPolicy,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build state around an explicit transport.
    pub fn new(config: Config, transport: Arc<dyn UpstreamTransport>) -> Self {
        Self {
            router: Arc::new(ModelRouter::new(config.upstream.routes.clone())),
            transport,
            policy: RelayPolicy::from_config(&config),
            config: Arc::new(config),
        }
    }

    /// Build state with the HTTP transport described by `config`.
    pub fn from_config(config: Config) -> crate::Result<Self> {
        let transport = HttpTransport::from_config(&config.upstream)?;
        Ok(Self::new(config, Arc::new(transport)))
    }
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        // Health check
        .route("/", get(handlers::health))
        // State and middleware
        .with_state(state)
        .layer(middleware::from_fn(assign_request_id))
        .layer(TraceLayer::new_for_http())
}

/// Tag the request with a fresh [`RequestId`] and echo it in the response.
async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.0.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Run the HTTP server until Ctrl-C.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    let state = AppState::from_config(config)?;
    for route in state.router.routes() {
        tracing::info!(prefix = %route.prefix, family = %route.family, url = %route.url, "Route");
    }

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting chatrelay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
