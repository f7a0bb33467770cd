//! Stage teardown. The HTTP response returns immediately; the destroy runs
//! on its own task with bounded exponential backoff so client disconnects
//! never abort cleanup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use super::Json;
use backoff::ExponentialBackoff;
use tracing::{error, info};

use stagehand_runtime::api::{DestroyRequest, DestroyResponse};
use stagehand_runtime::StageRegistry;

use super::AppState;
use crate::error::AppError;

const DESTROY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub async fn handle_destroy(
    State(state): State<AppState>,
    Json(req): Json<DestroyRequest>,
) -> Result<Json<DestroyResponse>, AppError> {
    if req.id.is_empty() {
        return Err(AppError::BadRequest("id not specified".to_string()));
    }

    let registry = state.registry.clone();
    tokio::spawn(destroy_with_retry(registry, req.id));
    Ok(Json(DestroyResponse::default()))
}

async fn destroy_with_retry(registry: Arc<StageRegistry>, id: String) {
    let backoff = ExponentialBackoff {
        max_elapsed_time: Some(DESTROY_TIMEOUT),
        ..Default::default()
    };

    // consecutive identical failures are logged once
    let last_error: Mutex<Option<String>> = Mutex::new(None);
    let attempt = || async {
        destroy_stage(&registry, &id).await.map_err(|err| {
            let mut last = last_error.lock().unwrap();
            if last.as_deref() != Some(err.as_str()) {
                error!(id = %id, error = %err, "could not cleanup resources, will retry");
                *last = Some(err.clone());
            }
            backoff::Error::transient(err)
        })
    };

    match backoff::future::retry(backoff, attempt).await {
        Ok(()) => info!(id = %id, "destroyed the stage resources"),
        Err(err) => error!(id = %id, error = %err, "could not cleanup resources"),
    }
}

async fn destroy_stage(registry: &StageRegistry, id: &str) -> Result<(), String> {
    // destroying a stage that does not exist is a no-op success
    let stage = match registry.get(id) {
        Ok(stage) => stage,
        Err(_) => return Ok(()),
    };
    stage.engine.destroy().await.map_err(|err| err.to_string())?;
    let _ = registry.remove(id);
    Ok(())
}
