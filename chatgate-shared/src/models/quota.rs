use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Details attached to a 429 response when the daily quota is spent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct QuotaExceeded {
    pub used: i64,
    pub limit: i64,
    /// Next UTC midnight, when the counter resets.
    pub reset_at: DateTime<Utc>,
}

/// Response of `GET /api/chat/quota`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct QuotaStatus {
    pub used: i64,
    /// Daily limit for the caller's plan; `0` when unlimited.
    pub limit: i64,
    /// Messages left today; `-1` when unlimited.
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}
