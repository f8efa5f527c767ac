use axum::{http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;

use super::problem::ProblemDetails;
use crate::services::{ChatError, history_cache::HistoryError, repository::RepositoryError};
use shared::models::QuotaExceeded;

/// Result type returned by handlers.
pub type AppResult<T> = Result<T, ApiError>;

/// Error returned from a handler and rendered as problem details.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
    quota: Option<QuotaExceeded>,
}

impl ApiError {
    /// Error with an explicit status and machine-readable code.
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
            quota: None,
        }
    }

    /// 429 `daily_quota_exceeded` with usage details and `Retry-After`.
    pub fn quota_exceeded(exceeded: QuotaExceeded, message: impl Into<String>) -> Self {
        Self {
            quota: Some(exceeded),
            ..Self::new(StatusCode::TOO_MANY_REQUESTS, "daily_quota_exceeded", message)
        }
    }

    /// 400 `validation_failed`.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }

    /// 401 `unauthenticated`.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", message)
    }

    /// 403 `forbidden`.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    /// 500 `internal_error`.
    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    /// Attaches structured details to the body.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut problem = match &self.quota {
            Some(exceeded) => ProblemDetails::quota_exceeded(exceeded, self.message, Utc::now()),
            None => ProblemDetails::new(self.status, self.code, self.message),
        };
        if let Some(details) = self.details {
            problem = problem.with_details(details);
        }
        problem.into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal_server_error(value.to_string())
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::SessionOwnership { .. } => Self::forbidden(err.to_string()),
            RepositoryError::Database(sqlx::Error::Database(db_err)) => {
                let code = db_err
                    .code()
                    .map_or_else(|| "unknown".to_string(), |code| code.into_owned());
                Self::internal_server_error(format!("database error {code}"))
                    .with_details(json!({ "sqlstate": code, "message": db_err.message() }))
            }
            other => Self::internal_server_error(other.to_string()),
        }
    }
}

impl From<HistoryError> for ApiError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::Repository(inner) => Self::from(inner),
            other => Self::new(StatusCode::SERVICE_UNAVAILABLE, "cache_unavailable", other.to_string()),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Unauthenticated => Self::unauthorized(err.to_string()),
            ChatError::Validation(message) => Self::bad_request(message),
            ChatError::QuotaExceeded(ref exceeded) => {
                Self::quota_exceeded(exceeded.clone(), err.to_string())
            }
            ChatError::SessionForbidden(_) => Self::forbidden(err.to_string()),
            ChatError::BackendUnavailable(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "backend_unavailable", err.to_string())
            }
            ChatError::Repository(inner) => Self::from(inner),
            ChatError::TimedOut => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "pipeline_timeout", err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::BackendError;
    use chrono::{TimeZone, Utc};
    use http::header::CONTENT_TYPE;
    use serde_json::Value;

    async fn body_json(error: ApiError) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .expect("body to bytes");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[test]
    fn with_details_is_kept() {
        let error = ApiError::forbidden("nope").with_details(json!({ "reason": "policy" }));
        assert_eq!(error.status(), StatusCode::FORBIDDEN);
        assert_eq!(error.code(), "forbidden");
        assert!(
            error
                .details
                .as_ref()
                .is_some_and(|details| details["reason"] == Value::from("policy"))
        );
    }

    #[tokio::test]
    async fn into_response_serializes_problem_details() {
        let response = ApiError::bad_request("query must not be empty").into_response();
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let (status, json) = body_json(ApiError::bad_request("query must not be empty")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "validation_failed");
        assert_eq!(json["message"], "query must not be empty");
    }

    #[tokio::test]
    async fn quota_rejection_exposes_usage() {
        let reset_at = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let error = ApiError::from(ChatError::QuotaExceeded(QuotaExceeded {
            used: 2,
            limit: 2,
            reset_at,
        }));

        let (status, json) = body_json(error).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json["code"], "daily_quota_exceeded");
        assert_eq!(json["details"]["used"], 2);
        assert_eq!(json["details"]["limit"], 2);
        assert_eq!(json["details"]["reset_at"], "2024-05-02T00:00:00Z");
    }

    #[test]
    fn quota_rejection_sets_retry_after() {
        let error = ApiError::from(ChatError::QuotaExceeded(QuotaExceeded {
            used: 3,
            limit: 3,
            reset_at: Utc::now() + chrono::Duration::hours(2),
        }));
        assert_eq!(error.code(), "daily_quota_exceeded");

        let response = error.into_response();
        let seconds: u64 = response
            .headers()
            .get(http::header::RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(seconds > 7_000 && seconds <= 7_200);
    }

    #[test]
    fn chat_errors_map_to_matching_status_codes() {
        let cases = [
            (ChatError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (ChatError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (ChatError::SessionForbidden("s1".into()), StatusCode::FORBIDDEN),
            (
                ChatError::BackendUnavailable(BackendError::Status(503)),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ChatError::Repository(RepositoryError::Database(sqlx::Error::PoolTimedOut)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ChatError::TimedOut, StatusCode::GATEWAY_TIMEOUT),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).status(), expected);
        }
    }
}
