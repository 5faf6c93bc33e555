//! Router layers applied by [`crate::Api::build`].
//!
//! Order, outermost first: set `x-request-id` when missing, propagate it to
//! the response, open the request span (parented on any W3C `traceparent`),
//! measure the request duration, then cap the body size.

use axum::body::Body;
use axum::Router;
use http::{HeaderName, HeaderValue, Request, Response};
use humus::server::{set_remote_parent, RequestMetricsLayer};
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::field::Empty;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone, Copy, Default)]
struct MakeUuid;

impl MakeRequestId for MakeUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

fn make_span(req: &Request<Body>) -> tracing::Span {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("n/a");

    let span = tracing::info_span!(
        "http_request",
        method = %req.method(),
        uri = %req.uri().path(),
        version = ?req.version(),
        request_id = %request_id,
        status = Empty,
        latency_ms = Empty,
        "http.method" = %req.method(),
        "http.target" = %req.uri().path(),
        "user_agent.original" = req.headers().get(http::header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("unknown"),
    );

    set_remote_parent(&span, req.headers());
    span
}

fn on_response(res: &Response<Body>, latency: Duration, span: &tracing::Span) {
    span.record("status", res.status().as_u16());
    span.record("latency_ms", latency.as_millis() as u64);
}

pub(crate) fn apply(router: Router, body_limit: usize) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    router
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(RequestMetricsLayer::http())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(make_span)
                .on_response(on_response),
        )
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(SetRequestIdLayer::new(request_id, MakeUuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tower::ServiceExt;

    fn router() -> Router {
        apply(Router::new().route("/", get(|| async { "ok" })), 16)
    }

    #[tokio::test]
    async fn request_id_is_generated() {
        let resp = router()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let id = resp.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn request_id_is_propagated() {
        let resp = router()
            .oneshot(
                Request::get("/")
                    .header(REQUEST_ID_HEADER, "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "abc-123");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let resp = router()
            .oneshot(
                Request::post("/")
                    .header(http::header::CONTENT_LENGTH, "64")
                    .body(Body::from(vec![b'x'; 64]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
    }
}
