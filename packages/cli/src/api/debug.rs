//! Interactive debug surface: feeds commands to the shell session of a
//! running step.

use axum::extract::State;
use super::Json;
use tracing::error;

use stagehand_runtime::api::DebugRequest;

use super::AppState;
use crate::error::AppError;

pub async fn handle_debug(
    State(state): State<AppState>,
    Json(req): Json<DebugRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.step_id.is_empty() {
        return Err(AppError::BadRequest("step id is not specified".to_string()));
    }

    let stage = state.registry.get(&req.stage_runtime_id).map_err(|err| {
        error!(id = %req.stage_runtime_id, "stage mapping does not exist");
        AppError::from(err)
    })?;

    stage
        .engine
        .debug(&req.step_id, &req.command, req.last)
        .await
        .map_err(|err| AppError::BadRequest(err.to_string()))?;

    Ok(Json(serde_json::json!({})))
}
