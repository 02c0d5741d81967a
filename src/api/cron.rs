// Trigger endpoint for the external scheduler

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::api::AppState;

/// GET|POST /api/cron
pub async fn run_cron(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let timestamp = Utc::now().to_rfc3339();

    if !state.auth.cron_authorized(&headers) {
        warn!("🔒 Unauthorized cron trigger");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "success": false,
                "error": "Unauthorized",
                "timestamp": timestamp,
            })),
        )
            .into_response();
    }

    info!("⏰ Cron trigger received");

    match state.reconciler.scan().await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Cron executed successfully",
                "timestamp": timestamp,
                "report": report,
            })),
        )
            .into_response(),
        Err(e) => {
            error!("❌ Cron settlement scan failed: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}
