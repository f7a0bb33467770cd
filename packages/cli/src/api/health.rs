//! Liveness surface: version plus git/docker presence.

use crate::api::Json;

use stagehand_runtime::api::HealthResponse;

use crate::hostprep;

pub async fn handle_health() -> Json<HealthResponse> {
    let docker_installed = hostprep::docker_installed().await;
    let git_installed = hostprep::git_installed().await;
    Json(HealthResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        docker_installed,
        git_installed,
        runner_log: hostprep::runner_log_tail(),
        ok: docker_installed && git_installed,
    })
}
