//! Typed REST handlers that serve requests and describe themselves.
//!
//! A handler is written against decoded types and wrapped in codecs until it
//! speaks bytes on both sides:
//!
//! ```no_run
//! use http::Method;
//! use humus_rest::{api, codec, handler_fn, operation, param, Api, Operation, PathBuilder, Request, Response};
//!
//! #[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema)]
//! struct User {
//!     id: String,
//! }
//!
//! let get_user = codec::produce_json(handler_fn(|req: Request<()>| async move {
//!     let id = req.path_param("id").unwrap_or_default().to_owned();
//!     Ok(Response::new(User { id }))
//! }));
//!
//! let built = Api::new("users", "1.0.0")
//!     .with(api::operation(
//!         Operation::new(
//!             Method::GET,
//!             PathBuilder::new("/users").param("id", [param::regex("^[0-9]+$")]),
//!             get_user,
//!         )
//!         .with(operation::summary("Get a user")),
//!     ))
//!     .build()
//!     .expect("valid API");
//! # let _ = built;
//! ```
//!
//! [`Api::build`] returns the axum router together with the OpenAPI
//! document, which is also served at `/openapi.json`.

pub mod api;
mod app;
pub mod codec;
mod handler;
mod middleware;
mod openapi;
pub mod operation;
pub mod param;
mod path;
pub mod problem;
pub mod security;

pub use api::{Api, ApiError, ApiOption, BuiltApi};
pub use app::{configured, App, RestConfig};
pub use codec::{ConsumeForm, ConsumeJson, HtmlTemplate, NoBody, NoContent, ReturnHtml, ReturnJson};
pub use handler::{handler_fn, BodyDoc, Handler, HandlerFn, OperationDoc, Request, Response, ResponseDoc};
pub use middleware::REQUEST_ID_HEADER;
pub use operation::{Operation, OperationOption};
pub use param::{ParamDeclaration, ParamLocation, ParamOption};
pub use path::PathBuilder;
pub use problem::{ErrorHandler, FrameworkError, ProblemCarrier, ProblemDetail, ProblemDetailsErrorHandler, ProblemError};
pub use security::{Credential, SecurityScheme, Verifier};
