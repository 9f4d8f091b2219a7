//! Axum endpoint that runs reconciliation on request.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use custlink_core::MatchResult;
use custlink_recon::{reconciler_from_env, ReconError, Reconciler};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "custlink-web";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReconcileRequest {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    matches: Option<Vec<MatchResult>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/reconcile", post(reconcile_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CUSTLINK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(reconciler_from_env().await?);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "custlink endpoint listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ReconcileRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection, "rejected reconcile request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": rejection.body_text() })),
            )
                .into_response()
        }
    };
    match request.action.as_deref().unwrap_or_default() {
        "match" => match state.reconciler.run_match().await {
            Ok(run) => Json(json!({
                "success": true,
                "matches": run.report.matches,
                "stats": run.report.stats,
            }))
            .into_response(),
            Err(err) => recon_error(err),
        },
        "apply" => match state.reconciler.apply(request.matches).await {
            Ok(summary) => Json(json!({
                "success": true,
                "updated": summary.updated,
                "total": summary.requested,
            }))
            .into_response(),
            Err(err) => recon_error(err),
        },
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid action. Use \"match\" or \"apply\"" })),
        )
            .into_response(),
    }
}

fn recon_error(err: ReconError) -> Response {
    error!(error = %err, "reconcile request failed");
    let body = match &err {
        ReconError::LoadFailure { .. } => json!({ "error": err.to_string() }),
        ReconError::ApplyPartialFailure {
            updated, requested, ..
        } => json!({
            "error": err.to_string(),
            "updated": updated,
            "total": requested,
        }),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
