use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
    routing::get,
};
use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::config::AppConfig;
use crate::runs::{
    self,
    persistence::{
        LogStore, MetadataStore, RunKeys,
        providers::{memory::MemoryRunStore, surreal::SurrealRunStore},
    },
    runtime::RunController,
    security::rate_limit::TokenBucket,
    upstream::HttpAgentService,
};

const BODY_LIMIT: usize = 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the stores, agent client and controller described by `config`.
pub async fn build_state(config: Arc<AppConfig>) -> anyhow::Result<AppState> {
    let (log, meta) = match config.store.provider.as_str() {
        "surrealdb" => {
            let store = Arc::new(SurrealRunStore::new(&config.store.database_url).await?);
            info!(name: "store.connected", provider = "surrealdb", "Run store connected");
            split_store(store)
        }
        _ => {
            info!(name: "store.connected", provider = "memory", "Using in-memory run store");
            split_store(Arc::new(MemoryRunStore::new()))
        }
    };

    let agent = Arc::new(HttpAgentService::new(&config.agent_service)?);
    let controller = RunController::new(
        agent,
        log,
        meta,
        RunKeys::new(config.store.key_prefix.clone()),
        Duration::from_secs(config.store.ttl_secs),
    );

    Ok(AppState {
        controller,
        rate_limiter: Arc::new(TokenBucket::new(
            config.resilience.requests_per_second,
            config.resilience.burst_size,
        )),
        config,
    })
}

fn split_store<S>(store: Arc<S>) -> (Arc<dyn LogStore>, Arc<dyn MetadataStore>)
where
    S: LogStore + MetadataStore + 'static,
{
    let log: Arc<dyn LogStore> = Arc::<S>::clone(&store);
    let meta: Arc<dyn MetadataStore> = store;
    (log, meta)
}

/// Full HTTP surface: run API under `/api`, health check at `/healthz`.
pub fn build_router(state: AppState) -> Router {
    // A disabled timeout is a very long one, so the layer types stay fixed.
    let timeout_duration = if state.config.resilience.timeout_disabled {
        Duration::from_secs(365 * 24 * 60 * 60)
    } else {
        REQUEST_TIMEOUT
    };

    let timed = runs::api::router().layer(axum::middleware::from_fn(
        move |req: Request, next: Next| async move {
            match tokio::time::timeout(timeout_duration, next.run(req)).await {
                Ok(res) => res,
                Err(_) => (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response(),
            }
        },
    ));
    // SSE tails live as long as their run and are not timed.
    let api = timed
        .merge(runs::api::stream_router())
        .with_state(state.controller.clone());

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            runs::security::middleware::auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            runs::security::rate_limit::rate_limit_middleware,
        ))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let state = build_state(Arc::clone(&config)).await?;
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(name: "server.stopping", "Shutdown signal received");
        })
        .await?;
    Ok(())
}
