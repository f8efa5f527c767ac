use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    app_state::AppState,
    handlers::{chat, sessions},
};

/// Routes mounted under `/api`.
pub fn create_router_chat() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat", post(chat::chat))
        .route("/chat/quota", get(chat::quota))
        .route(
            "/sessions/{session_id}/history",
            get(sessions::get_history).delete(sessions::delete_history),
        )
}
