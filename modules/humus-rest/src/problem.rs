//! RFC 7807 Problem Details and the error handler that produces them.
//!
//! Classification runs in three tiers:
//! 1. a [`ProblemError`] anywhere in the error chain is written verbatim,
//!    extension fields included;
//! 2. a [`FrameworkError`] maps to a fixed status, title and detail;
//! 3. anything else becomes a 500 with [`INTERNAL_DETAIL`].
//!
//! Only tier 1 puts caller-authored text on the wire. Tier 2 and tier 3
//! messages are logged and never serialized.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::{header, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use utoipa::ToSchema;

pub const APPLICATION_PROBLEM_JSON: &str = "application/problem+json";
pub const DEFAULT_TYPE: &str = "about:blank";
pub const INTERNAL_DETAIL: &str = "An internal server error occurred.";

/// The standard Problem Details members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetail {
    /// URI identifying the problem type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetail {
    pub fn new(status: u16, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            r#type: String::new(),
            title: title.into(),
            status,
            detail: detail.into(),
            instance: None,
        }
    }

    #[must_use]
    pub fn with_type(mut self, uri: impl Into<String>) -> Self {
        self.r#type = uri.into();
        self
    }

    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

/// A value that carries its own Problem Details wire form.
///
/// Implement it for error types that embed a [`ProblemDetail`] with
/// `#[serde(flatten)]` next to their extension fields:
///
/// ```
/// use humus_rest::problem::{ProblemCarrier, ProblemDetail};
/// use serde::Serialize;
///
/// #[derive(Debug, Serialize)]
/// struct ValidationFailed {
///     #[serde(flatten)]
///     problem: ProblemDetail,
///     fields: Vec<String>,
/// }
///
/// impl ProblemCarrier for ValidationFailed {
///     fn problem(&self) -> &ProblemDetail {
///         &self.problem
///     }
/// }
/// ```
pub trait ProblemCarrier: Serialize + fmt::Debug + Send + Sync + 'static {
    fn problem(&self) -> &ProblemDetail;
}

impl ProblemCarrier for ProblemDetail {
    fn problem(&self) -> &ProblemDetail {
        self
    }
}

trait ErasedCarrier: fmt::Debug + Send + Sync {
    fn problem(&self) -> &ProblemDetail;
    fn body(&self) -> serde_json::Result<serde_json::Value>;
}

impl<C: ProblemCarrier> ErasedCarrier for C {
    fn problem(&self) -> &ProblemDetail {
        ProblemCarrier::problem(self)
    }

    fn body(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Error wrapper for a [`ProblemCarrier`]; convert it into `anyhow::Error`
/// and return it from a handler.
#[derive(Debug)]
pub struct ProblemError {
    carrier: Box<dyn ErasedCarrier>,
}

impl ProblemError {
    pub fn new<C: ProblemCarrier>(carrier: C) -> Self {
        Self {
            carrier: Box::new(carrier),
        }
    }

    pub fn problem(&self) -> &ProblemDetail {
        self.carrier.problem()
    }

    /// The full JSON body, extension fields included.
    pub fn body(&self) -> serde_json::Result<serde_json::Value> {
        self.carrier.body()
    }
}

impl fmt::Display for ProblemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.problem();
        write!(f, "{} ({})", p.title, p.status)?;
        if !p.detail.is_empty() {
            write!(f, ": {}", p.detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProblemError {}

impl From<ProblemDetail> for ProblemError {
    fn from(problem: ProblemDetail) -> Self {
        Self::new(problem)
    }
}

/// Errors raised by the framework itself. Their messages are for logs only.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl FrameworkError {
    fn public(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            FrameworkError::BadRequest(_) => (
                StatusCode::BAD_REQUEST,
                "Bad Request",
                "The request could not be processed.",
            ),
            FrameworkError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
                "Valid credentials are required.",
            ),
            FrameworkError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                "Not Found",
                "The requested resource was not found.",
            ),
            FrameworkError::UnsupportedMediaType(_) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Unsupported Media Type",
                "The request body has an unsupported content type.",
            ),
            FrameworkError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                INTERNAL_DETAIL,
            ),
        }
    }
}

/// Turns a handler error into an HTTP response.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(&self, err: anyhow::Error) -> Response<Body>;
}

impl<F> ErrorHandler for F
where
    F: Fn(anyhow::Error) -> Response<Body> + Send + Sync + 'static,
{
    fn handle(&self, err: anyhow::Error) -> Response<Body> {
        self(err)
    }
}

/// The default [`ErrorHandler`].
#[derive(Debug, Clone)]
pub struct ProblemDetailsErrorHandler {
    default_type: String,
}

impl Default for ProblemDetailsErrorHandler {
    fn default() -> Self {
        Self {
            default_type: DEFAULT_TYPE.to_owned(),
        }
    }
}

impl ProblemDetailsErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `type` URI used when a problem does not name one.
    #[must_use]
    pub fn default_type(mut self, uri: impl Into<String>) -> Self {
        self.default_type = uri.into();
        self
    }

    pub fn shared(self) -> Arc<dyn ErrorHandler> {
        Arc::new(self)
    }

    fn typed(&self, err: &ProblemError) -> Option<Response<Body>> {
        let mut body = match err.body() {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => {
                tracing::error!("problem carrier did not serialize to a JSON object");
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, "problem carrier failed to serialize");
                return None;
            }
        };

        let missing_type = body
            .get("type")
            .and_then(|t| t.as_str())
            .map_or(true, str::is_empty);
        if missing_type {
            body.insert("type".into(), self.default_type.clone().into());
        }

        let status = match StatusCode::from_u16(err.problem().status) {
            Ok(s) if s.is_client_error() || s.is_server_error() => s,
            _ => {
                tracing::warn!(status = err.problem().status, "problem status is not an error status, sending 500");
                body.insert("status".into(), StatusCode::INTERNAL_SERVER_ERROR.as_u16().into());
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Some(problem_response(status, &serde_json::Value::Object(body)))
    }

    fn fixed(&self, status: StatusCode, title: &str, detail: &str) -> Response<Body> {
        let problem = ProblemDetail::new(status.as_u16(), title, detail).with_type(&self.default_type);
        problem_response(status, &problem)
    }
}

impl ErrorHandler for ProblemDetailsErrorHandler {
    fn handle(&self, err: anyhow::Error) -> Response<Body> {
        if let Some(problem) = err.chain().find_map(|e| e.downcast_ref::<ProblemError>()) {
            tracing::debug!(error = %problem, "handler returned problem details");
            if let Some(response) = self.typed(problem) {
                return response;
            }
        }

        if let Some(fw) = err.chain().find_map(|e| e.downcast_ref::<FrameworkError>()) {
            let (status, title, detail) = fw.public();
            if status.is_server_error() {
                tracing::error!(error = format!("{err:#}"), "request failed");
            } else {
                tracing::debug!(error = format!("{err:#}"), %status, "request rejected");
            }
            return self.fixed(status, title, detail);
        }

        tracing::error!(error = format!("{err:#}"), "unhandled handler error");
        self.fixed(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            INTERNAL_DETAIL,
        )
    }
}

pub(crate) fn problem_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => (
            status,
            [(header::CONTENT_TYPE, APPLICATION_PROBLEM_JSON)],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode problem details");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
