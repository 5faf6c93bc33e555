//! Request spans and duration metrics shared by the HTTP and gRPC servers.

use axum::extract::MatchedPath;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, Request, Response};
use opentelemetry::metrics::{Histogram, Meter};
use opentelemetry::KeyValue;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};
use tower_http::trace::MakeSpan;
use tracing_opentelemetry::OpenTelemetrySpanExt;

const METER_NAME: &str = "humus";

struct HeaderExtractor<'a>(&'a HeaderMap);

impl opentelemetry::propagation::Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

/// Parents `span` on the W3C trace context carried in `headers`, if any.
pub fn set_remote_parent(span: &tracing::Span, headers: &HeaderMap) {
    let parent = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    });
    if let Err(e) = span.set_parent(parent) {
        tracing::debug!(error = %e, "request span not linked to remote trace");
    }
}

/// Span per gRPC call, named after the full method path.
#[derive(Clone, Copy, Debug, Default)]
pub struct GrpcSpan;

impl<B> MakeSpan<B> for GrpcSpan {
    fn make_span(&mut self, req: &Request<B>) -> tracing::Span {
        let span = tracing::info_span!(
            "grpc_request",
            "rpc.system" = "grpc",
            "rpc.method" = %req.uri().path(),
        );
        set_remote_parent(&span, req.headers());
        span
    }
}

/// Which status a duration sample is labelled with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StatusLabel {
    /// `http.response.status_code`
    Http,
    /// `rpc.grpc.status_code`, read from the `grpc-status` header.
    Grpc,
}

impl StatusLabel {
    fn key_value<B>(self, result: Result<&Response<B>, ()>) -> KeyValue {
        match self {
            StatusLabel::Http => {
                let code = result.map_or(0, |res| i64::from(res.status().as_u16()));
                KeyValue::new("http.response.status_code", code)
            }
            StatusLabel::Grpc => KeyValue::new("rpc.grpc.status_code", grpc_status_code(result)),
        }
    }
}

const GRPC_OK: i64 = 0;
const GRPC_UNKNOWN: i64 = 2;

/// Status carried in the response head. Trailers-only responses (every error
/// a service returns) put `grpc-status` there; streamed successes carry it in
/// the trailers and count as OK.
fn grpc_status_code<B>(result: Result<&Response<B>, ()>) -> i64 {
    let Ok(res) = result else {
        return GRPC_UNKNOWN;
    };
    match res.headers().get("grpc-status") {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(GRPC_UNKNOWN),
        None => GRPC_OK,
    }
}

/// Records how long each request took in a duration histogram (seconds).
#[derive(Clone)]
pub struct RequestMetricsLayer {
    duration: Histogram<f64>,
    route_key: &'static str,
    status: StatusLabel,
}

impl RequestMetricsLayer {
    /// `rpc.server.duration`, keyed by `rpc.method` and `rpc.grpc.status_code`.
    pub fn grpc() -> Self {
        Self::grpc_with_meter(&opentelemetry::global::meter(METER_NAME))
    }

    pub fn grpc_with_meter(meter: &Meter) -> Self {
        let duration = meter
            .f64_histogram("rpc.server.duration")
            .with_unit("s")
            .with_description("Duration of inbound gRPC calls")
            .build();
        Self {
            duration,
            route_key: "rpc.method",
            status: StatusLabel::Grpc,
        }
    }

    /// `http.server.request.duration`, keyed by `http.route` and
    /// `http.response.status_code`.
    pub fn http() -> Self {
        Self::http_with_meter(&opentelemetry::global::meter(METER_NAME))
    }

    pub fn http_with_meter(meter: &Meter) -> Self {
        let duration = meter
            .f64_histogram("http.server.request.duration")
            .with_unit("s")
            .with_description("Duration of inbound HTTP requests")
            .build();
        Self {
            duration,
            route_key: "http.route",
            status: StatusLabel::Http,
        }
    }
}

impl<S> Layer<S> for RequestMetricsLayer {
    type Service = RequestMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestMetrics {
            inner,
            duration: self.duration.clone(),
            route_key: self.route_key,
            status: self.status,
        }
    }
}

#[derive(Clone)]
pub struct RequestMetrics<S> {
    inner: S,
    duration: Histogram<f64>,
    route_key: &'static str,
    status: StatusLabel,
}

impl<S, B, ResB> Service<Request<B>> for RequestMetrics<S>
where
    S: Service<Request<B>, Response = Response<ResB>>,
    S::Future: Send + 'static,
    S::Error: 'static,
    ResB: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let route = match req.extensions().get::<MatchedPath>() {
            Some(matched) => matched.as_str().to_owned(),
            None => req.uri().path().to_owned(),
        };
        let route = KeyValue::new(self.route_key, route);
        let duration = self.duration.clone();
        let label = self.status;
        let started = Instant::now();
        let call = self.inner.call(req);
        Box::pin(async move {
            let result = call.await;
            let status = label.key_value(result.as_ref().map_err(|_| ()));
            duration.record(started.elapsed().as_secs_f64(), &[route, status]);
            result
        })
    }
}
