//! Route registration: turns [`Operation`]s into an axum router and the
//! matching OpenAPI document.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, Path};
use axum::routing::{MethodFilter, MethodRouter};
use axum::Router;
use bytes::Bytes;
use http::request::Parts;
use http::{header, HeaderValue, Method, StatusCode};
use humus::health::Monitor;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use utoipa::openapi::OpenApi;

use crate::codec::APPLICATION_JSON;
use crate::handler::{Handler, Request, Response};
use crate::middleware;
use crate::openapi;
use crate::operation::Operation;
use crate::param::{CompiledParam, ParamDeclaration, ParamLocation};
use crate::path::PathBuilder;
use crate::problem::{
    ErrorHandler, FrameworkError, ProblemDetail, ProblemDetailsErrorHandler, ProblemError,
};

pub const OPENAPI_PATH: &str = "/openapi.json";
pub const READINESS_PATH: &str = "/health/readiness";
pub const LIVENESS_PATH: &str = "/health/liveness";
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("duplicate route {method} {path}")]
    DuplicateRoute { method: Method, path: String },
    #[error("route {path} conflicts with {existing}")]
    ConflictingPath { path: String, existing: String },
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("invalid regex for parameter {param}")]
    InvalidRegex {
        param: String,
        #[source]
        source: regex::Error,
    },
    #[error("unsupported method {0}")]
    InvalidMethod(Method),
    #[error("security scheme on path parameter {0}")]
    SecurityOnPath(String),
    #[error("failed to encode OpenAPI document")]
    Document(#[from] serde_json::Error),
}

/// A REST API under construction.
pub struct Api {
    title: String,
    version: String,
    operations: Vec<Operation>,
    readiness: Option<Arc<dyn Monitor>>,
    liveness: Option<Arc<dyn Monitor>>,
    not_found: Arc<dyn Handler<Bytes, Bytes>>,
    method_not_allowed: Arc<dyn Handler<Bytes, Bytes>>,
    error_handler: Arc<dyn ErrorHandler>,
    body_limit: usize,
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("title", &self.title)
            .field("version", &self.version)
            .field("operations", &self.operations.len())
            .field("body_limit", &self.body_limit)
            .finish_non_exhaustive()
    }
}

/// Adjusts an [`Api`].
pub struct ApiOption(Box<dyn FnOnce(&mut Api) + Send>);

impl ApiOption {
    fn new(f: impl FnOnce(&mut Api) + Send + 'static) -> Self {
        Self(Box::new(f))
    }
}

pub fn operation(op: Operation) -> ApiOption {
    ApiOption::new(move |api| api.operations.push(op))
}

/// Mounts `GET /health/readiness`.
pub fn readiness(monitor: impl Monitor + 'static) -> ApiOption {
    let monitor: Arc<dyn Monitor> = Arc::new(monitor);
    ApiOption::new(move |api| api.readiness = Some(monitor))
}

/// Mounts `GET /health/liveness`.
pub fn liveness(monitor: impl Monitor + 'static) -> ApiOption {
    let monitor: Arc<dyn Monitor> = Arc::new(monitor);
    ApiOption::new(move |api| api.liveness = Some(monitor))
}

pub fn not_found(handler: impl Handler<Bytes, Bytes>) -> ApiOption {
    let handler: Arc<dyn Handler<Bytes, Bytes>> = Arc::new(handler);
    ApiOption::new(move |api| api.not_found = handler)
}

/// Answers a known path requested with an unregistered method. The `Allow`
/// header is added unless the handler sets one.
pub fn method_not_allowed(handler: impl Handler<Bytes, Bytes>) -> ApiOption {
    let handler: Arc<dyn Handler<Bytes, Bytes>> = Arc::new(handler);
    ApiOption::new(move |api| api.method_not_allowed = handler)
}

/// Default error handler for operations without [`crate::operation::on_error`].
pub fn error_handler(handler: impl ErrorHandler) -> ApiOption {
    let handler: Arc<dyn ErrorHandler> = Arc::new(handler);
    ApiOption::new(move |api| api.error_handler = handler)
}

pub fn body_limit(bytes: usize) -> ApiOption {
    ApiOption::new(move |api| api.body_limit = bytes)
}

/// Router and document produced by [`Api::build`].
#[derive(Debug)]
pub struct BuiltApi {
    pub router: Router,
    pub document: OpenApi,
}

impl Api {
    pub fn new(title: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            version: version.into(),
            operations: Vec::new(),
            readiness: None,
            liveness: None,
            not_found: Arc::new(DefaultNotFound),
            method_not_allowed: Arc::new(DefaultMethodNotAllowed),
            error_handler: ProblemDetailsErrorHandler::new().shared(),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    #[must_use]
    pub fn with(mut self, opt: ApiOption) -> Self {
        (opt.0)(&mut self);
        self
    }

    #[must_use]
    pub fn options(self, opts: impl IntoIterator<Item = ApiOption>) -> Self {
        opts.into_iter().fold(self, Api::with)
    }

    pub fn build(self) -> Result<BuiltApi, ApiError> {
        let fallbacks = Arc::new(Fallbacks {
            not_found: self.not_found.clone(),
            method_not_allowed: self.method_not_allowed.clone(),
            error_handler: self.error_handler.clone(),
        });

        let mut routes = Routes::default();
        for op in &self.operations {
            let route = Arc::new(CompiledRoute::compile(op, &self.error_handler, &fallbacks)?);
            routes.add(&op.method, &op.path, move |req: axum::extract::Request| {
                route.clone().dispatch(req)
            })?;
        }

        let document = openapi::document(&self.title, &self.version, &self.operations);
        let json = Bytes::from(serde_json::to_vec(&document)?);
        routes.add(&Method::GET, &PathBuilder::new(OPENAPI_PATH), move || {
            let json = json.clone();
            async move { ([(header::CONTENT_TYPE, APPLICATION_JSON)], json) }
        })?;

        for (path, monitor) in [(READINESS_PATH, &self.readiness), (LIVENESS_PATH, &self.liveness)] {
            if let Some(monitor) = monitor.clone() {
                routes.add(&Method::GET, &PathBuilder::new(path), move || {
                    probe(monitor.clone(), path)
                })?;
            }
        }

        let router = routes.into_router(&fallbacks);
        tracing::info!(
            title = %self.title,
            version = %self.version,
            operations = self.operations.len(),
            "REST API built"
        );
        Ok(BuiltApi {
            router: middleware::apply(router, self.body_limit),
            document,
        })
    }
}

/// Method routers grouped by path pattern.
#[derive(Default)]
struct Routes {
    groups: BTreeMap<String, (MethodRouter, Vec<Method>)>,
    shapes: HashMap<String, String>,
}

impl Routes {
    fn add<H, T>(&mut self, method: &Method, path: &PathBuilder, handler: H) -> Result<(), ApiError>
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        let pattern = path.pattern();
        path.validate().map_err(|reason| ApiError::InvalidPath {
            path: pattern.clone(),
            reason,
        })?;
        let filter = MethodFilter::try_from(method.clone())
            .ok()
            .filter(|_| openapi::http_method(method).is_some())
            .ok_or_else(|| ApiError::InvalidMethod(method.clone()))?;

        let existing = self
            .shapes
            .entry(path.shape())
            .or_insert_with(|| pattern.clone());
        if *existing != pattern {
            return Err(ApiError::ConflictingPath {
                path: pattern,
                existing: existing.clone(),
            });
        }

        let (router, methods) = self
            .groups
            .remove(&pattern)
            .unwrap_or_else(|| (MethodRouter::new(), Vec::new()));
        if methods.contains(method) {
            return Err(ApiError::DuplicateRoute {
                method: method.clone(),
                path: pattern,
            });
        }
        let mut methods = methods;
        methods.push(method.clone());
        self.groups.insert(pattern, (router.on(filter, handler), methods));
        Ok(())
    }

    fn into_router(self, fallbacks: &Arc<Fallbacks>) -> Router {
        let mut router = Router::new();
        for (pattern, (methods_router, methods)) in self.groups {
            let allow = methods.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
            let fb = fallbacks.clone();
            router = router.route(
                &pattern,
                methods_router.fallback(move |req: axum::extract::Request| {
                    fb.clone().method_not_allowed(allow.clone(), req)
                }),
            );
        }
        let fb = fallbacks.clone();
        router.fallback(move |req: axum::extract::Request| fb.clone().not_found(req))
    }
}

async fn probe(monitor: Arc<dyn Monitor>, path: &'static str) -> StatusCode {
    match monitor.healthy().await {
        Ok(true) => StatusCode::OK,
        Ok(false) => StatusCode::SERVICE_UNAVAILABLE,
        Err(e) => {
            tracing::warn!(probe = path, error = format!("{e:#}"), "health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

struct Fallbacks {
    not_found: Arc<dyn Handler<Bytes, Bytes>>,
    method_not_allowed: Arc<dyn Handler<Bytes, Bytes>>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl Fallbacks {
    async fn not_found(self: Arc<Self>, req: axum::extract::Request) -> axum::response::Response {
        let (parts, body) = req.into_parts();
        self.run(&self.not_found, parts, body).await
    }

    async fn method_not_allowed(
        self: Arc<Self>,
        allow: String,
        req: axum::extract::Request,
    ) -> axum::response::Response {
        let (parts, body) = req.into_parts();
        let mut resp = self.run(&self.method_not_allowed, parts, body).await;
        if let Ok(value) = HeaderValue::from_str(&allow) {
            resp.headers_mut().entry(header::ALLOW).or_insert(value);
        }
        resp
    }

    async fn run(
        &self,
        handler: &Arc<dyn Handler<Bytes, Bytes>>,
        parts: Parts,
        body: Body,
    ) -> axum::response::Response {
        let bytes = match read_body(body).await {
            Ok(bytes) => bytes,
            Err(e) => return self.error_handler.handle(e),
        };
        match handler.handle(Request::new(parts, bytes)).await {
            Ok(resp) => into_http(resp),
            Err(e) => self.error_handler.handle(e),
        }
    }
}

/// An operation with its parameters compiled, ready to serve requests.
struct CompiledRoute {
    handler: Arc<dyn Handler<Bytes, Bytes>>,
    path_params: Vec<CompiledParam>,
    params: Vec<CompiledParam>,
    error_handler: Arc<dyn ErrorHandler>,
    fallbacks: Arc<Fallbacks>,
}

impl CompiledRoute {
    fn compile(
        op: &Operation,
        default_handler: &Arc<dyn ErrorHandler>,
        fallbacks: &Arc<Fallbacks>,
    ) -> Result<Self, ApiError> {
        let compile = |decl: &ParamDeclaration| {
            if decl.location == ParamLocation::Path && decl.security.is_some() {
                return Err(ApiError::SecurityOnPath(decl.name.clone()));
            }
            CompiledParam::compile(decl.clone()).map_err(|source| ApiError::InvalidRegex {
                param: decl.name.clone(),
                source,
            })
        };
        Ok(Self {
            handler: op.handler.clone(),
            path_params: op.path.params().map(compile).collect::<Result<_, _>>()?,
            params: op.params.iter().map(compile).collect::<Result<_, _>>()?,
            error_handler: op.error_handler.clone().unwrap_or_else(|| default_handler.clone()),
            fallbacks: fallbacks.clone(),
        })
    }

    async fn dispatch(self: Arc<Self>, req: axum::extract::Request) -> axum::response::Response {
        let (mut parts, body) = req.into_parts();

        let path_values = if self.path_params.is_empty() {
            Vec::new()
        } else {
            match Path::<Vec<(String, String)>>::from_request_parts(&mut parts, &()).await {
                Ok(Path(values)) => values,
                Err(rejection) => {
                    tracing::debug!(error = %rejection, "undecodable path parameters");
                    return self.fallbacks.run(&self.fallbacks.not_found, parts, body).await;
                }
            }
        };
        let path_ok = self.path_params.iter().all(|p| {
            path_values
                .iter()
                .find(|(name, _)| *name == p.decl.name)
                .is_some_and(|(_, value)| p.matches(value))
        });
        if !path_ok {
            return self.fallbacks.run(&self.fallbacks.not_found, parts, body).await;
        }

        if let Err(e) = self.authenticate(&mut parts).await {
            return self.error_handler.handle(e);
        }
        if let Err(e) = self.validate(&parts) {
            return self.error_handler.handle(e);
        }

        let bytes = match read_body(body).await {
            Ok(bytes) => bytes,
            Err(e) => return self.error_handler.handle(e),
        };
        let req = Request::new(parts, bytes).with_path_params(path_values);
        match self.handler.handle(req).await {
            Ok(resp) => into_http(resp),
            Err(e) => self.error_handler.handle(e),
        }
    }

    async fn authenticate(&self, parts: &mut Parts) -> anyhow::Result<()> {
        for p in &self.params {
            if let Some(scheme) = &p.decl.security {
                let raw = p.decl.extract(&parts.uri, &parts.headers);
                scheme.authenticate(raw.as_deref(), &mut parts.extensions).await?;
            }
        }
        Ok(())
    }

    fn validate(&self, parts: &Parts) -> anyhow::Result<()> {
        for p in self.params.iter().filter(|p| p.decl.security.is_none()) {
            let location = p.decl.location.as_str();
            match p.decl.extract(&parts.uri, &parts.headers) {
                None if p.decl.required => {
                    return Err(FrameworkError::BadRequest(format!(
                        "missing required {location} parameter {:?}",
                        p.decl.name
                    ))
                    .into());
                }
                Some(value) if !p.matches(&value) => {
                    return Err(FrameworkError::BadRequest(format!(
                        "{location} parameter {:?} does not match its pattern",
                        p.decl.name
                    ))
                    .into());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

async fn read_body(body: Body) -> anyhow::Result<Bytes> {
    match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if exceeds_limit(&e) => Err(ProblemError::from(ProblemDetail::new(
            StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
            "Payload Too Large",
            "The request body exceeds the configured limit.",
        ))
        .into()),
        Err(e) => Err(FrameworkError::BadRequest(format!("failed to read request body: {e}")).into()),
    }
}

fn exceeds_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn into_http(resp: Response<Bytes>) -> axum::response::Response {
    let mut out = axum::response::Response::new(Body::from(resp.body));
    *out.status_mut() = resp.status;
    *out.headers_mut() = resp.headers;
    out
}

struct DefaultNotFound;

#[async_trait]
impl Handler<Bytes, Bytes> for DefaultNotFound {
    async fn handle(&self, req: Request<Bytes>) -> anyhow::Result<Response<Bytes>> {
        Err(FrameworkError::NotFound(req.uri().path().to_owned()).into())
    }
}

struct DefaultMethodNotAllowed;

#[async_trait]
impl Handler<Bytes, Bytes> for DefaultMethodNotAllowed {
    async fn handle(&self, req: Request<Bytes>) -> anyhow::Result<Response<Bytes>> {
        let detail = format!("{} is not supported for {}", req.method(), req.uri().path());
        Err(ProblemError::from(ProblemDetail::new(
            StatusCode::METHOD_NOT_ALLOWED.as_u16(),
            "Method Not Allowed",
            detail,
        ))
        .into())
    }
}
