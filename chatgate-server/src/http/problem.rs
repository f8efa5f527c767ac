use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use http::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use serde::Serialize;
use serde_json::{Value, json};
use shared::models::QuotaExceeded;

/// RFC 7807 body for every gateway error. The `type` URL is derived from
/// `code`.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Seconds sent as `Retry-After`; header only.
    #[serde(skip)]
    pub retry_after: Option<u64>,
}

impl ProblemDetails {
    /// Problem with the status reason as title.
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            problem_type: format!("https://chatgate.dev/problems/{code}"),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            code: code.to_string(),
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    /// 429 for a spent daily quota. Details carry the usage, and
    /// `Retry-After` counts down to the reset.
    pub fn quota_exceeded(
        exceeded: &QuotaExceeded,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let seconds_left = (exceeded.reset_at - now).num_seconds().max(0);
        Self {
            retry_after: u64::try_from(seconds_left).ok(),
            ..Self::new(StatusCode::TOO_MANY_REQUESTS, "daily_quota_exceeded", message)
                .with_details(json!({
                    "used": exceeded.used,
                    "limit": exceeded.limit,
                    "reset_at": exceeded.reset_at,
                }))
        }
    }

    /// Attaches structured details to the body.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after;
        let mut response = axum::Json(self).into_response();
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if let Some(seconds) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}
