use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Json, State};
use axum::routing::{get, post};
use axum::Router;
use dapple_core::GenerationRequest;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ServeError;
use crate::executor;
use crate::state::AppState;

#[derive(Serialize, Deserialize, Debug)]
pub struct GenerateResponse {
    /// `data:image/jpeg;base64,...`
    #[serde(rename = "imageUrl")]
    pub image_url: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub device: String,
    pub model: Option<String>,
}

/// Routes with tracing, CORS and a body limit of `max_body_bytes`.
pub fn build(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

/// Any origin, method and header, with credentials. The origin is echoed back
/// because a wildcard cannot be combined with credentials.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model_loaded: state.manager.is_loaded(),
        device: state.manager.device(),
        model: state.manager.loaded().map(|loaded| loaded.spec.id.clone()),
    })
}

async fn generate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ServeError> {
    let Json(request) = payload?;
    let image_url = executor::generate(&state.manager, &state.executor, request).await?;
    Ok(Json(GenerateResponse { image_url }))
}
