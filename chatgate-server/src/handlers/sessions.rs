use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use shared::models::{SessionHistory, validate_session_id};
use tracing::info;

use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    middleware::request_context::RequestContext,
};

/// Validates the id and checks the caller owns the session.
async fn owned_session(
    state: &AppState,
    context: &RequestContext,
    session_id: &str,
) -> AppResult<()> {
    let caller = context.require_caller()?;
    validate_session_id(session_id).map_err(|err| ApiError::bad_request(err.to_string()))?;

    let session = state
        .repository
        .get_session(session_id)
        .await?
        .ok_or_else(|| {
            ApiError::new(StatusCode::NOT_FOUND, "not_found", "session not found")
        })?;
    if session.user_id != caller.user_id {
        return Err(ApiError::forbidden("session belongs to another user"));
    }
    Ok(())
}

/// Recent messages of a session, oldest first.
#[utoipa::path(
    get,
    path = "/api/sessions/{session_id}/history",
    params(("session_id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Most recent messages, oldest first", body = SessionHistory),
        (status = 401, description = "Missing caller identity"),
        (status = 403, description = "Session belongs to another user"),
        (status = 404, description = "Unknown session")
    ),
    tag = "Sessions"
)]
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(session_id): Path<String>,
) -> AppResult<Json<SessionHistory>> {
    owned_session(&state, &context, &session_id).await?;
    let messages = state.history.get_history(&session_id).await?;
    Ok(Json(SessionHistory {
        session_id,
        messages,
    }))
}

/// Drops the cached history of a session. Durable messages are kept.
#[utoipa::path(
    delete,
    path = "/api/sessions/{session_id}/history",
    params(("session_id" = String, Path, description = "Session identifier")),
    responses(
        (status = 204, description = "Cached history removed"),
        (status = 401, description = "Missing caller identity"),
        (status = 403, description = "Session belongs to another user"),
        (status = 404, description = "Unknown session")
    ),
    tag = "Sessions"
)]
pub async fn delete_history(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(session_id): Path<String>,
) -> AppResult<StatusCode> {
    owned_session(&state, &context, &session_id).await?;
    state.history.delete_history(&session_id).await?;
    info!(request_id = %context.request_id, %session_id, "cached history deleted");
    Ok(StatusCode::NO_CONTENT)
}
