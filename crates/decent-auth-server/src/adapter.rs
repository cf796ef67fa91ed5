//! axum glue: every request under the listener is handed to the broker.

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::header::HOST;
use axum::Router;
use decent_auth::{AuthError, Broker, Request, Response};
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use url::Url;

/// Largest request body accepted.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Router that forwards everything to `broker`.
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(broker)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

async fn handle(
    State(broker): State<Arc<Broker>>,
    request: axum::extract::Request,
) -> axum::response::Response {
    let response = match into_broker_request(request).await {
        Ok(request) => broker.handle(&request).await,
        Err(e) => Response::from(&e),
    };
    from_broker_response(response)
}

/// Build an absolute-URL [`Request`] from the axum request and its `Host`.
pub async fn into_broker_request(request: axum::extract::Request) -> Result<Request, AuthError> {
    let (parts, body) = request.into_parts();

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .ok_or_else(|| AuthError::InvalidRequest("missing Host header".to_string()))?;
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let url = Url::parse(&format!("https://{}{}", host, path_and_query))
        .map_err(|e| AuthError::InvalidRequest(format!("bad request URL: {}", e)))?;

    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| AuthError::InvalidRequest(format!("unreadable body: {}", e)))?;

    let mut request = Request::new(parts.method, url);
    request.headers = parts.headers;
    Ok(request.with_body(body.to_vec()))
}

pub fn from_broker_response(response: Response) -> axum::response::Response {
    let mut out = axum::response::Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}
