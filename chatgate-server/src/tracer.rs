use axum::{body::Body, http::Request};
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{
    DefaultOnBodyChunk, DefaultOnEos, DefaultOnResponse, MakeSpan, TraceLayer,
};
use tracing::{Level, Span, error, info};

use crate::middleware::request_context::RequestContext;

pub(crate) type TraceLayerType = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    HttpMakeSpan,
    fn(&Request<Body>, &Span),
    DefaultOnResponse,
    DefaultOnBodyChunk,
    DefaultOnEos,
    fn(ServerErrorsFailureClass, Duration, &Span),
>;

/// Opens one span per request carrying the correlation id and caller.
#[derive(Clone, Default)]
pub(crate) struct HttpMakeSpan;

impl<B> MakeSpan<B> for HttpMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let context = request.extensions().get::<RequestContext>();
        let request_id = context.map_or("n/a", |ctx| ctx.request_id.as_str());
        let user_id = context.and_then(RequestContext::user_id).unwrap_or("-");
        let tenant_id = context
            .and_then(|ctx| ctx.caller.as_ref())
            .and_then(|caller| caller.tenant_id.as_deref())
            .unwrap_or("-");

        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
            user_id = %user_id,
            tenant_id = %tenant_id,
            status_code = tracing::field::Empty
        )
    }
}

pub(crate) fn on_request_handler(req: &Request<Body>, span: &Span) {
    span.in_scope(|| {
        info!(
            method = %req.method(),
            uri = %req.uri(),
            version = ?req.version(),
            "started processing request"
        );
    });
}

pub(crate) fn on_failure_handler(error: ServerErrorsFailureClass, latency: Duration, span: &Span) {
    span.in_scope(|| {
        error!(
            error = %error,
            latency = ?latency,
            "error processing request"
        );
    });
}

/// Request/response logging for the whole router.
pub(crate) fn create_trace_layer() -> TraceLayerType {
    TraceLayer::new_for_http()
        .make_span_with(HttpMakeSpan)
        .on_request(on_request_handler as fn(&Request<Body>, &Span))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(on_failure_handler as fn(ServerErrorsFailureClass, Duration, &Span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::stream_bridge::Caller;
    use axum::http::{Method, StatusCode};
    use tracing_subscriber::util::SubscriberInitExt;

    fn request_with_context(context: Option<RequestContext>) -> Request<Body> {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/api/chat")
            .body(Body::empty())
            .unwrap();
        if let Some(context) = context {
            request.extensions_mut().insert(context);
        }
        request
    }

    #[test]
    fn span_is_created_with_and_without_context() {
        let _guard = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .set_default();
        let mut make_span = HttpMakeSpan;

        let anonymous = make_span.make_span(&request_with_context(None));
        assert_eq!(
            anonymous.metadata().map(tracing::Metadata::name),
            Some("http_request")
        );

        let scoped = make_span.make_span(&request_with_context(Some(RequestContext {
            request_id: "req-1".into(),
            caller: Some(Caller {
                user_id: "u1".into(),
                tenant_id: Some("t1".into()),
            }),
        })));
        assert!(!scoped.is_disabled());
    }

    #[test]
    fn handlers_log_without_panicking() {
        let _guard = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .set_default();
        let span = tracing::info_span!("test_span");

        on_request_handler(&request_with_context(None), &span);
        on_failure_handler(
            ServerErrorsFailureClass::StatusCode(StatusCode::BAD_GATEWAY),
            Duration::from_millis(12),
            &span,
        );
    }

    #[test]
    fn trace_layer_builds() {
        let layer = create_trace_layer();
        assert!(std::mem::size_of_val(&layer) > 0);
    }
}
