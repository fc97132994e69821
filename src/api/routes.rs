//! HTTP route definitions.
//!
//! Public: health and the per-chat file server. Protected (bearer key when
//! configured): the MCP endpoint and session listing.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    middleware,
    routing::get,
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::session::{DockerRuntime, SessionManager};
use crate::tokens::TokenClient;
use crate::tools::ToolRegistry;
use crate::util::internal_error;

use super::auth;
use super::files;
use super::mcp;
use super::types::{HealthResponse, SessionsResponse};

/// Largest accepted upload body (10GB).
const UPLOAD_BODY_LIMIT: usize = 10 * 1024 * 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub tools: Arc<ToolRegistry>,
    pub tokens: TokenClient,
}

impl AppState {
    pub fn new(config: Config, sessions: Arc<SessionManager>) -> Self {
        let tokens = TokenClient::new(config.tokens_url.clone(), config.tokens_api_key.clone());
        Self {
            config: Arc::new(config),
            sessions,
            tools: Arc::new(ToolRegistry::new()),
            tokens,
        }
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/files/:chat_id/*filename", get(files::download));

    // Uploads with increased body limit
    let upload_routes = Router::new()
        .route(
            "/api/uploads/:chat_id/*path",
            get(files::uploads_get).post(files::upload),
        )
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT));

    let protected_routes = Router::new()
        .route("/mcp", get(mcp::info).post(mcp::handle))
        .route("/api/sessions", get(list_sessions))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_mcp_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(upload_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let runtime = DockerRuntime::connect(
        config.container.docker_socket.as_deref(),
        &config.container.image,
    )?;
    let sessions = Arc::new(SessionManager::new(
        Arc::new(runtime),
        config.container.clone(),
    ));

    // The daemon may come up after us; requests report it as unavailable until then.
    if let Err(e) = sessions.runtime().ping().await {
        tracing::warn!("Docker daemon not reachable at startup: {}", e);
    }

    if config.mcp_api_key.is_none() {
        tracing::warn!("MCP_API_KEY is not set; /mcp is unauthenticated");
    }
    if config.container.skills_path.is_none() {
        tracing::info!("SKILLS_PATH not set; containers start without /mnt/skills");
    }

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(
        image = %config.container.image,
        data_dir = %config.data_dir.display(),
        "Starting computer-use server"
    );

    let state = Arc::new(AppState::new(config, sessions));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM. Containers are left running; their idle
/// timers stop them.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionsResponse>, (axum::http::StatusCode, String)> {
    let sessions = state.sessions.list_sessions().await.map_err(internal_error)?;
    Ok(Json(SessionsResponse { sessions }))
}
