use std::{convert::Infallible, sync::Arc};

use axum::{
    Extension, Json,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use shared::models::{ChatRequest, ChatStreamEvent, QuotaStatus};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::{
    app_state::AppState,
    http::error::AppResult,
    middleware::request_context::RequestContext,
};

/// Renders one pipeline event as an SSE frame. Chunk frames carry the bare
/// chunk payload.
fn to_sse_event(event: &ChatStreamEvent) -> Option<Event> {
    let builder = Event::default().event(event.event_name());
    let encoded = match event {
        ChatStreamEvent::Session(payload) => builder.json_data(payload),
        ChatStreamEvent::Chunk(payload) => builder.json_data(payload),
        ChatStreamEvent::Done(payload) => builder.json_data(payload),
    };
    encoded
        .inspect_err(|err| warn!(error = %err, "dropping unencodable stream event"))
        .ok()
}

/// Streams an answer to `query` as server-sent events.
#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Event stream: one `session`, then `chunk` events, then `done`", content_type = "text/event-stream", body = ChatStreamEvent),
        (status = 400, description = "Empty query or malformed session id"),
        (status = 401, description = "Missing caller identity"),
        (status = 403, description = "Session belongs to another user"),
        (status = 429, description = "Daily quota exhausted; details carry used, limit and reset_at"),
        (status = 502, description = "Generation backend unavailable"),
        (status = 504, description = "Request deadline exceeded before streaming")
    ),
    tag = "Chat"
)]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Json(request): Json<ChatRequest>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let started = state.bridge.start(context.caller.as_ref(), request).await?;
    info!(
        request_id = %context.request_id,
        session_id = %started.session_id,
        created = started.created,
        "chat stream started"
    );

    let stream = started
        .events
        .filter_map(|event| to_sse_event(&event))
        .map(Ok::<_, Infallible>);

    let keepalive = KeepAlive::new().interval(state.keep_alive).text("keep-alive");
    Ok(Sse::new(stream).keep_alive(keepalive))
}

/// Today's message usage for the caller.
#[utoipa::path(
    get,
    path = "/api/chat/quota",
    responses(
        (status = 200, description = "Quota usage; remaining is -1 when unlimited", body = QuotaStatus),
        (status = 401, description = "Missing caller identity")
    ),
    tag = "Chat"
)]
pub async fn quota(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<QuotaStatus>> {
    let caller = context.require_caller()?;
    let scope = state.bridge.resolve_scope(caller).await;
    let tenant_id = scope.tenant_id.as_deref();

    let decision = state
        .admission
        .check_daily_limit(&caller.user_id, tenant_id, scope.daily_limit)
        .await;
    let remaining = state
        .admission
        .remaining_messages(&caller.user_id, tenant_id, scope.daily_limit)
        .await;

    Ok(Json(QuotaStatus {
        used: decision.used,
        limit: scope.daily_limit,
        remaining,
        reset_at: state.admission.reset_at(),
    }))
}
