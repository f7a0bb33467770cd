//! Step execution surface. `/step` exposes a synchronous run-one-step
//! contract (start + await); `/poll_step` is the separate long-poll used by
//! callers that start and poll asynchronously.

use std::time::Instant;

use axum::extract::State;
use super::Json;
use tracing::info;

use stagehand_runtime::api::{PollStepRequest, PollStepResponse, StartStepRequest};

use super::AppState;
use crate::error::AppError;

pub async fn handle_step(
    State(state): State<AppState>,
    Json(req): Json<StartStepRequest>,
) -> Result<Json<PollStepResponse>, AppError> {
    if req.stage_runtime_id.is_empty() {
        return Err(AppError::BadRequest(
            "stage runtime id not specified".to_string(),
        ));
    }
    let started = Instant::now();

    let stage = state.registry.get(&req.stage_runtime_id)?;
    let step_id = req.config.id.clone();
    let detach = req.config.detach;

    stage.executor.start_step(req).await?;
    if detach {
        // detached steps report once the container is up; the result
        // arrives later through poll_step if anyone asks
        return Ok(Json(PollStepResponse::default()));
    }

    let response = stage
        .executor
        .poll_step(&PollStepRequest { id: step_id.clone() })
        .await?;

    info!(step_id = %step_id, latency = ?started.elapsed(), "completed the step");
    // a non-zero exit is not a transport error: 200 with error populated
    Ok(Json(response))
}

pub async fn handle_poll_step(
    State(state): State<AppState>,
    Json(req): Json<PollStepRequest>,
) -> Result<Json<PollStepResponse>, AppError> {
    if req.id.is_empty() {
        return Err(AppError::BadRequest("id not specified".to_string()));
    }

    let stage = state
        .registry
        .find_step(&req.id)
        .ok_or_else(|| AppError::NotFound(format!("step {} does not exist", req.id)))?;
    let response = stage.executor.poll_step(&req).await?;
    Ok(Json(response))
}
