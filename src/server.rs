use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        EssayEvaluateScore, EssayRequest, EssayResponse, EvaluationResponse, ModelRegistry,
        ScoreResponse,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
}

pub fn build_router(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Router {
    // Single allowed browser origin, with credentials; methods and headers
    // mirror whatever the preflight asks for.
    let cors = CorsLayer::new()
        .allow_origin(config.cors_origin.clone())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    let state = AppState { config, registry };

    Router::new()
        .route("/health", get(health))
        .route("/generate_essay", post(generate_essay))
        .route("/generate_evaltext", post(generate_evaltext))
        .route("/evaluate", post(evaluate_essay))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health() -> &'static str {
    "ok"
}

async fn generate_essay(
    State(state): State<AppState>,
    Json(request): Json<EssayRequest>,
) -> Result<Json<EssayResponse>, ServiceError> {
    info!(band = %request.score, "generating essay");
    let essay = state
        .registry
        .essay(request.question, request.score, &state.config)
        .await?;
    Ok(Json(EssayResponse { essay }))
}

async fn generate_evaltext(
    State(state): State<AppState>,
    Json(request): Json<EssayEvaluateScore>,
) -> Result<Json<EvaluationResponse>, ServiceError> {
    info!("generating evaluation narrative");
    let evaluation_text = state
        .registry
        .evaluation(request.question, request.essay, &state.config)
        .await?;
    Ok(Json(EvaluationResponse { evaluation_text }))
}

async fn evaluate_essay(
    State(state): State<AppState>,
    Json(request): Json<EssayEvaluateScore>,
) -> Result<Json<ScoreResponse>, ServiceError> {
    let score = state.registry.score(request.question, request.essay).await?;
    info!(%score, "predicted band");
    Ok(Json(ScoreResponse { score }))
}
