// ABOUTME: HTTP surface of the submission server
// ABOUTME: Routes /health and /submit with request tracing and CORS

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::log::InputLog;

#[derive(Clone)]
struct AppState {
    log: Arc<dyn InputLog>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn reply(status: StatusCode, message: impl Into<String>) -> Response {
        (
            status,
            Json(MessageResponse {
                message: message.into(),
            }),
        )
            .into_response()
    }
}

/// Build the router. `allowed_origins` of `["*"]` allows any origin; an empty
/// list disables cross-origin access.
pub fn router(log: Arc<dyn InputLog>, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submit", post(submit))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { log })
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if allowed_origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(origins))
}

async fn health() -> &'static str {
    "healthy"
}

async fn submit(State(state): State<AppState>, body: Bytes) -> Response {
    let inputs: Vec<String> = match serde_json::from_slice(&body) {
        Ok(inputs) => inputs,
        Err(e) => {
            tracing::warn!("Rejected malformed submission: {}", e);
            return MessageResponse::reply(StatusCode::BAD_REQUEST, format!("Bad request: {}", e));
        }
    };

    match state.log.append_inputs(&inputs).await {
        Ok(()) => MessageResponse::reply(StatusCode::OK, "Data processed"),
        Err(e) => {
            tracing::warn!("Failed to process {} input(s): {}", inputs.len(), e);
            MessageResponse::reply(StatusCode::BAD_REQUEST, format!("Bad request: {}", e))
        }
    }
}
