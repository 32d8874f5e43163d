//! Agentline Server
//!
//! HTTP transport for agentline queries: SSE streaming of query events,
//! out-of-band cancellation and runtime stats.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{http::Method, middleware, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use agentline_core::collab::{InMemoryMetrics, SqliteChatStore, StaticDirectory, TracingAuditSink};
use agentline_core::config::{AppConfig, QuerySection};
use agentline_core::runtime::{AgentRuntime, HttpAgentRuntime, RuntimeBridge};
use agentline_core::{Collaborators, QueryOrchestrator, QueryRegistry};

pub mod auth;
pub mod error;
mod routes;
pub mod types;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Query pipeline; owns the in-flight registry.
    pub orchestrator: Arc<QueryOrchestrator>,
    /// Per-account timing shared with the orchestrator.
    pub metrics: Arc<InMemoryMetrics>,
    pub query_config: Arc<QuerySection>,
}

impl AppState {
    /// Wire the orchestrator to an agent runtime and the default collaborators.
    pub fn new(
        config: &AppConfig,
        runtime: Arc<dyn AgentRuntime>,
        directory: StaticDirectory,
        chat_store: SqliteChatStore,
    ) -> Self {
        let metrics = Arc::new(InMemoryMetrics::new());
        let collab = Collaborators {
            directory: Arc::new(directory),
            chat_store: Arc::new(chat_store),
            audit: Arc::new(TracingAuditSink),
            metrics: metrics.clone(),
        };
        let orchestrator = QueryOrchestrator::new(
            QueryRegistry::new(),
            RuntimeBridge::new(runtime, config.bridge.clone()),
            collab,
            config.query.clone(),
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            metrics,
            query_config: Arc::new(config.query.clone()),
        }
    }

    pub fn registry(&self) -> &QueryRegistry {
        self.orchestrator.registry()
    }
}

/// Build state from configuration: HTTP runtime client, SQLite chat store and
/// the account directory file.
pub async fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let runtime_config = config.runtime.clone();
    // The blocking client owns an internal runtime and must be built off the async workers
    let runtime = tokio::task::spawn_blocking(move || HttpAgentRuntime::new(&runtime_config))
        .await
        .context("Runtime client setup panicked")?
        .context("Failed to configure agent runtime")?;

    let chat_store = SqliteChatStore::open(&config.storage.database_path)?;
    let directory = match &config.directory.accounts_file {
        Some(path) => StaticDirectory::load(path)?,
        None => {
            tracing::warn!("No account directory configured, every query will get guidance");
            StaticDirectory::new()
        }
    };

    Ok(AppState::new(config, Arc::new(runtime), directory, chat_store))
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .nest(
            "/api",
            routes::api_router().layer(middleware::from_fn(auth::auth_middleware)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Agentline server and block until shutdown.
pub async fn start_server(config: AppConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = build_state(&config).await?;
    let app = build_router(state);

    tracing::info!("Agentline server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}


#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::test_support::{body_json, state};
    use super::*;

    #[tokio::test]
    async fn health_needs_no_identity() {
        let app = build_router(state(&[]));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn api_routes_require_a_user_id() {
        let app = build_router(state(&[]));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/stats")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "UNAUTHORIZED");
    }
}
