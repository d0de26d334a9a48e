//! Inbound RPC surface (spec.md §6 "Inbound RPC methods"). The source's
//! message-bus transport is out of scope; this exposes the same method
//! shape over HTTP, one route per composite id plus the `ping` diagnostic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::CacheClient;
use crate::config::CompositeRegistry;
use crate::model::RowRecord;
use crate::orchestrator::{self, CompositeRequest};

pub struct AppState {
    pub registry: CompositeRegistry,
    pub cache: Arc<dyn CacheClient>,
}

type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/composite/:id", post(call_composite))
        .route("/composites", get(list_composites))
        .route("/ping", get(ping))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: SharedState, bind: &str) -> anyhow::Result<()> {
    let app = router(state);
    info!("HTTP server listening on {}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

/// Diagnostic method returning the current wall-clock time, seconds since
/// epoch as a float (spec.md §6).
async fn ping() -> Json<f64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Json(now.as_secs_f64())
}

#[derive(Serialize)]
struct CompositeSummary {
    id: String,
    description: Option<String>,
}

async fn list_composites(State(state): State<SharedState>) -> Json<Vec<CompositeSummary>> {
    Json(
        state
            .registry
            .values()
            .map(|c| CompositeSummary {
                id: c.id.clone(),
                description: c.description.clone(),
            })
            .collect(),
    )
}

/// Body shape for `POST /composite/:id` — the fixed `node`/`period`/
/// `exclude_regexp` parameters plus whatever per-composite `<input>`
/// parameters the caller supplies, each a list of strings (spec.md §6).
#[derive(Debug, Deserialize)]
struct CompositeCall {
    node: Vec<String>,
    period: Option<u32>,
    #[serde(default)]
    exclude_regexp: Vec<String>,
    #[serde(flatten)]
    inputs: BTreeMap<String, Vec<String>>,
}

type ApiError = (StatusCode, String);

async fn call_composite(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<CompositeCall>,
) -> Result<Json<HashMap<String, Vec<RowRecord>>>, ApiError> {
    let composite = state
        .registry
        .get(&id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown composite {id:?}")))?;
    let instance = composite.instance("default").ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("composite {id:?} has no default instance"),
        )
    })?;

    if body.node.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "node is required".to_string()));
    }
    for input in &instance.inputs {
        if input.required && !body.inputs.contains_key(&input.id) {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("missing required input {:?}", input.id),
            ));
        }
    }

    let request = CompositeRequest {
        nodes: body.node,
        period: body.period.unwrap_or(CompositeRequest::DEFAULT_PERIOD),
        exclude_regexp: body.exclude_regexp,
    };

    let result = orchestrator::run(state.cache.as_ref(), instance, &request).await;
    Ok(Json(result))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        warn!(status = %self.0, message = %self.1, "composite request rejected");
        (self.0, self.1).into_response()
    }
}
