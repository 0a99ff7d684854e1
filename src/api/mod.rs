//! HTTP API for health checks, operation status and dead letters

use crate::broker::Broker;
use crate::chain::ChainRegistry;
use crate::config::ApiConfig;
use crate::coordination::{machine, DeadLetter};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainId, EventType, OperationId};
use crate::metrics::metrics_handler;
use crate::state::{EventStore, ExecutionRecord, OperationState};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ethers::types::H256;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EventStore>,
    pub chains: Arc<ChainRegistry>,
    pub broker: Arc<dyn Broker>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<EventStore>,
        chains: Arc<ChainRegistry>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            store,
            chains,
            broker,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/operations/:id", get(get_operation))
        .route("/dead-letters", get(get_dead_letters))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server until shutdown
pub async fn run_server(
    config: ApiConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> RelayerResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| RelayerError::Internal(format!("api server: {}", e)))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and broker reachable, every chain healthy
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.health_check().await.is_ok();
    let broker = state.broker.health_check().await.is_ok();
    let details = chain_health(&state).await;
    let chains = details.iter().all(|c| c.healthy);

    let ready = store && broker && chains;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            store,
            broker,
            chains,
            details,
        }),
    )
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let mut cursors = Vec::new();
    for chain_id in state.chains.chain_ids() {
        if let Ok(Some(cursor)) = state.store.load_cursor(chain_id).await {
            cursors.push(CursorStatus {
                chain_id,
                last_processed_block: cursor.last_processed_block,
            });
        }
    }

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        chains: chain_health(&state).await,
        cursors,
    })
}

async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OperationResponse>, ApiError> {
    let operation_id: OperationId = id.parse().map_err(ApiError::BadRequest)?;
    let store = &state.store;

    let events = store.operation_events(&operation_id).await?;
    let recorded = store.get_operation_state(&operation_id).await?;
    if events.is_empty() && recorded.is_empty() {
        return Err(ApiError::NotFound(format!("operation {}", operation_id)));
    }

    let mut executions = Vec::new();
    for event_type in EventType::ALL {
        if let Some(record) = store.execution(&operation_id, event_type).await? {
            executions.push(record);
        }
    }

    Ok(Json(OperationResponse {
        operation_id,
        archived: store.is_archived(&operation_id).await?,
        state: recorded,
        events: events
            .into_iter()
            .map(|e| EventSummary {
                chain_id: e.chain_id,
                block_number: e.block_number,
                tx_hash: e.tx_hash,
                log_index: e.log_index,
                event_type: e.event_type,
                requires_finality: machine::requires_finality(e.event_type),
            })
            .collect(),
        executions,
    }))
}

async fn get_dead_letters(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    Ok(Json(state.store.dead_letters().await?))
}

async fn chain_health(state: &AppState) -> Vec<ChainHealth> {
    state
        .chains
        .health_check()
        .await
        .into_iter()
        .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
        .collect()
}

enum ApiError {
    BadRequest(RelayerError),
    NotFound(String),
    Internal(RelayerError),
}

impl From<RelayerError> for ApiError {
    fn from(err: RelayerError) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            ApiError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    broker: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: ChainId,
    healthy: bool,
}

#[derive(Serialize)]
struct CursorStatus {
    chain_id: ChainId,
    last_processed_block: u64,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    chains: Vec<ChainHealth>,
    cursors: Vec<CursorStatus>,
}

#[derive(Serialize)]
struct EventSummary {
    chain_id: ChainId,
    block_number: u64,
    tx_hash: H256,
    log_index: u64,
    event_type: EventType,
    requires_finality: bool,
}

#[derive(Serialize)]
struct OperationResponse {
    operation_id: OperationId,
    archived: bool,
    state: OperationState,
    events: Vec<EventSummary>,
    executions: Vec<ExecutionRecord>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
