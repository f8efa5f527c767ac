use std::str::FromStr;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::{
    http::error::{ApiError, AppResult},
    services::stream_bridge::Caller,
};
use shared::config::server::Config;

/// Per-request identity and correlation data, set before any handler runs.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub caller: Option<Caller>,
}

impl RequestContext {
    /// Caller id when identity headers were present.
    pub fn user_id(&self) -> Option<&str> {
        self.caller.as_ref().map(|caller| caller.user_id.as_str())
    }

    /// The caller, or 401 for anonymous requests.
    pub fn require_caller(&self) -> AppResult<&Caller> {
        self.caller
            .as_ref()
            .ok_or_else(|| ApiError::unauthorized("caller identity is required"))
    }
}

/// Header names the context is read from.
#[derive(Clone, Debug)]
pub struct ContextHeaders {
    request_id: HeaderName,
    user_id: HeaderName,
    tenant_id: HeaderName,
}

fn header_or(name: &str, fallback: &'static str) -> HeaderName {
    HeaderName::from_str(name).unwrap_or_else(|_| HeaderName::from_static(fallback))
}

impl ContextHeaders {
    /// Header names from `server` config, falling back to the defaults when blank.
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_id: header_or(&config.server.request_id_header, "x-request-id"),
            user_id: header_or(&config.server.user_id_header, "x-user-id"),
            tenant_id: header_or(&config.server.tenant_id_header, "x-tenant-id"),
        }
    }
}

/// Assigns a request id and resolves the caller from identity headers.
pub async fn attach_request_context(
    State(headers): State<ContextHeaders>,
    mut request: Request<Body>,
    next: Next,
) -> AppResult<Response> {
    let request_id = header_text(request.headers(), &headers.request_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let caller = header_text(request.headers(), &headers.user_id).map(|user_id| Caller {
        user_id,
        tenant_id: header_text(request.headers(), &headers.tenant_id),
    });

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        caller,
    });

    let encoded = HeaderValue::from_str(&request_id)
        .map_err(|_| ApiError::internal_server_error("failed to encode request id"))?;
    request
        .headers_mut()
        .insert(headers.request_id.clone(), encoded.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(headers.request_id, encoded);

    Ok(response)
}

fn header_text(headers: &HeaderMap, header: &HeaderName) -> Option<String> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, middleware::from_fn_with_state, routing::get};
    use tower::ServiceExt;

    async fn echo(Extension(context): Extension<RequestContext>) -> String {
        match context.caller {
            Some(caller) => format!(
                "{}|{}|{}",
                context.request_id,
                caller.user_id,
                caller.tenant_id.unwrap_or_default()
            ),
            None => format!("{}|anonymous", context.request_id),
        }
    }

    fn app() -> Router {
        let headers = ContextHeaders::from_config(&Config::default());
        Router::new()
            .route("/", get(echo))
            .layer(from_fn_with_state(headers, attach_request_context))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn identity_headers_become_caller() {
        let request = Request::builder()
            .uri("/")
            .header("x-request-id", "req-1")
            .header("x-user-id", "u1")
            .header("x-tenant-id", "t1")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.headers().get("x-request-id").unwrap(), "req-1");
        assert_eq!(body_text(response).await, "req-1|u1|t1");
    }

    #[tokio::test]
    async fn blank_identity_is_anonymous_and_request_id_is_generated() {
        let request = Request::builder()
            .uri("/")
            .header("x-user-id", "   ")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        let generated = response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(Uuid::parse_str(&generated).is_ok());
        assert_eq!(body_text(response).await, format!("{generated}|anonymous"));
    }

    #[test]
    fn require_caller_rejects_anonymous() {
        let context = RequestContext::default();
        let err = context.require_caller().unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
