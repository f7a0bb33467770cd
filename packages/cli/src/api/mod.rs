//! Request surface. Handlers are thin adapters: decode JSON, delegate to
//! the registry/executor/engine, encode JSON.

use std::any::Any;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use stagehand_runtime::StageRegistry;

use crate::config::Config;
use crate::error::AppError;

pub mod debug;
pub mod destroy;
pub mod health;
pub mod setup;
pub mod step;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<StageRegistry>,
}

/// Like `axum::Json`, but malformed bodies surface through the standard
/// `{"error_msg": ...}` error shape instead of axum's plain-text rejection.
pub struct Json<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for Json<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(Json(value)),
            Err(rejection) => Err(AppError::BadRequest(rejection.body_text())),
        }
    }
}

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/setup", post(setup::handle_setup))
        .route("/destroy", post(destroy::handle_destroy))
        .route("/step", post(step::handle_step))
        .route("/poll_step", post(step::handle_poll_step))
        .route("/debug", post(debug::handle_debug))
        .route("/healthz", get(health::handle_health))
        .layer(CatchPanicLayer::custom(recover_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handler panics become a 500 with the standard error body instead of a
/// dropped connection.
fn recover_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "recovered handler panic");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error_msg": "internal server error" })),
    )
        .into_response()
}
