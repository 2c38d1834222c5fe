//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    AiEnabledRequest, CancelResponse, ChatRequest, ChatResponse, CredentialRequest,
    CredentialResponse, EmotionRequest, ErrorResponse, MissionRequest, MissionResponse,
    SuccessResponse,
};
use super::AppState;
use crate::runtime::{AppSnapshot, StateError, SubmitOutcome};
use crate::state_machine::TransitionError;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/events", get(stream_events))
        // Chat screen
        .route("/api/chat", post(send_chat))
        .route("/api/chat/cancel", post(cancel_chat))
        // Mission screen
        .route("/api/missions", post(complete_mission))
        // Operator panel
        .route("/api/admin/emotion", post(set_emotion))
        .route("/api/admin/ai-enabled", post(set_ai_enabled))
        .route("/api/admin/credential", post(update_credential))
        .route("/api/admin/reset/soft", post(soft_reset))
        .route("/api/admin/reset/hard", post(hard_reset))
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// State
// ============================================================

async fn get_state(State(state): State<AppState>) -> Json<AppSnapshot> {
    Json(state.manager.snapshot())
}

async fn stream_events(State(state): State<AppState>) -> impl IntoResponse {
    // Subscribe before taking the snapshot so nothing falls in between
    let rx = state.manager.subscribe();
    sse_stream(
        state.manager.snapshot(),
        rx,
        state.manager.shutdown_token(),
    )
}

// ============================================================
// Chat
// ============================================================

async fn send_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    // The turn runs to completion even if the client goes away
    let manager = state.manager.clone();
    let outcome = tokio::spawn(async move { manager.submit_user_message(&req.text).await })
        .await
        .map_err(|e| AppError::Internal(format!("turn task failed: {e}")))?;

    match outcome {
        SubmitOutcome::Replied { user, reply } => Ok(Json(ChatResponse { user, reply })),
        SubmitOutcome::Rejected(e) => Err(e.into()),
    }
}

async fn cancel_chat(State(state): State<AppState>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.manager.cancel_in_flight(),
    })
}

// ============================================================
// Missions
// ============================================================

async fn complete_mission(
    State(state): State<AppState>,
    Json(req): Json<MissionRequest>,
) -> Result<Json<MissionResponse>, AppError> {
    let mission = state
        .manager
        .complete_mission(&req.mission, req.photo_ref)
        .await?;
    Ok(Json(MissionResponse { mission }))
}

// ============================================================
// Operator panel
// ============================================================

async fn set_emotion(
    State(state): State<AppState>,
    Json(req): Json<EmotionRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.manager.set_emotional_state(req.emotion).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn set_ai_enabled(
    State(state): State<AppState>,
    Json(req): Json<AiEnabledRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.manager.set_ai_feature_enabled(req.enabled).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn update_credential(
    State(state): State<AppState>,
    Json(req): Json<CredentialRequest>,
) -> Result<Json<CredentialResponse>, AppError> {
    let verdict = state.manager.update_credential(&req.token).await?;
    Ok(Json(verdict.into()))
}

async fn soft_reset(State(state): State<AppState>) -> Result<Json<SuccessResponse>, AppError> {
    state.manager.soft_reset().await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn hard_reset(State(state): State<AppState>) -> Result<Json<SuccessResponse>, AppError> {
    state.manager.hard_reset().await?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("kindred ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    /// Valid request, wrong moment (turn in flight, still loading)
    Conflict(String),
    /// Applied in memory but not persisted
    Unavailable(String),
    Internal(String),
}

impl From<TransitionError> for AppError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::TurnInFlight
            | TransitionError::NotReady
            | TransitionError::AlreadyLoaded => AppError::Conflict(e.to_string()),
            TransitionError::EmptyMessage
            | TransitionError::NoPendingTurn
            | TransitionError::InvalidTransition(_) => AppError::BadRequest(e.to_string()),
        }
    }
}

impl From<StateError> for AppError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Transition(e) => e.into(),
            StateError::Persistence { .. } => AppError::Unavailable(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
