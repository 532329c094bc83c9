use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::TurnResponse;
use crate::services::{SessionHistory, SessionInfo};

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub question: String,
}

fn parse_session_id(id: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(id).map_err(|_| AppError::Validation(format!("Invalid session id: {}", id)))
}

/// Start a new conversation
pub async fn create_session(State(state): State<AppState>) -> Result<(StatusCode, Json<SessionInfo>), AppError> {
    let info = state.sessions.create()?;
    Ok((StatusCode::CREATED, Json(info)))
}

/// Submit one message and wait for the turn's response.
/// A dropped request abandons the turn.
pub async fn submit_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, AppError> {
    let id = parse_session_id(&id)?;

    let question = payload.question.trim();
    if question.is_empty() {
        return Err(AppError::Validation("Question cannot be empty".to_string()));
    }

    let response = state.sessions.submit_turn(id, question).await?;
    Ok(Json(response))
}

pub async fn cancel_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_session_id(&id)?;
    let cancelled = state.sessions.cancel(id)?;
    Ok(Json(serde_json::json!({
        "cancelled": cancelled,
    })))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionHistory>, AppError> {
    let id = parse_session_id(&id)?;
    Ok(Json(state.sessions.history(id).await?))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_session_id(&id)?;
    state.sessions.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}
