use bytes::Bytes;
use http::Method;
use std::fmt;
use std::sync::Arc;

use crate::handler::Handler;
use crate::param::{ParamDeclaration, ParamLocation, ParamOption};
use crate::path::PathBuilder;
use crate::problem::ErrorHandler;

/// One method on one path, bound to a handler.
pub struct Operation {
    pub(crate) method: Method,
    pub(crate) path: PathBuilder,
    pub(crate) handler: Arc<dyn Handler<Bytes, Bytes>>,
    pub(crate) params: Vec<ParamDeclaration>,
    pub(crate) error_handler: Option<Arc<dyn ErrorHandler>>,
    pub(crate) summary: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) tags: Vec<String>,
    pub(crate) operation_id: Option<String>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("method", &self.method)
            .field("path", &self.path.pattern())
            .field("params", &self.params)
            .field("operation_id", &self.operation_id)
            .finish_non_exhaustive()
    }
}

impl Operation {
    pub fn new(method: Method, path: PathBuilder, handler: impl Handler<Bytes, Bytes>) -> Self {
        Self {
            method,
            path,
            handler: Arc::new(handler),
            params: Vec::new(),
            error_handler: None,
            summary: None,
            description: None,
            tags: Vec::new(),
            operation_id: None,
        }
    }

    #[must_use]
    pub fn with(mut self, opt: OperationOption) -> Self {
        (opt.0)(&mut self);
        self
    }

    #[must_use]
    pub fn options(self, opts: impl IntoIterator<Item = OperationOption>) -> Self {
        opts.into_iter().fold(self, Operation::with)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &PathBuilder {
        &self.path
    }

    /// Query, header and cookie parameters. Path parameters live on
    /// [`Operation::path`].
    pub fn params(&self) -> &[ParamDeclaration] {
        &self.params
    }

    pub(crate) fn all_params(&self) -> impl Iterator<Item = &ParamDeclaration> {
        self.path.params().chain(self.params.iter())
    }
}

/// Adjusts an [`Operation`].
pub struct OperationOption(Box<dyn FnOnce(&mut Operation) + Send>);

impl OperationOption {
    fn new(f: impl FnOnce(&mut Operation) + Send + 'static) -> Self {
        Self(Box::new(f))
    }
}

fn declare(
    name: impl Into<String>,
    location: ParamLocation,
    opts: impl IntoIterator<Item = ParamOption>,
) -> OperationOption {
    let decl = ParamDeclaration::new(name, location).with_options(opts);
    OperationOption::new(move |op| op.params.push(decl))
}

pub fn query_param(name: impl Into<String>, opts: impl IntoIterator<Item = ParamOption>) -> OperationOption {
    declare(name, ParamLocation::Query, opts)
}

pub fn header_param(name: impl Into<String>, opts: impl IntoIterator<Item = ParamOption>) -> OperationOption {
    declare(name, ParamLocation::Header, opts)
}

pub fn cookie_param(name: impl Into<String>, opts: impl IntoIterator<Item = ParamOption>) -> OperationOption {
    declare(name, ParamLocation::Cookie, opts)
}

/// Replaces the API-wide error handler for this operation.
pub fn on_error(handler: impl ErrorHandler) -> OperationOption {
    let handler: Arc<dyn ErrorHandler> = Arc::new(handler);
    OperationOption::new(move |op| op.error_handler = Some(handler))
}

pub fn summary(text: impl Into<String>) -> OperationOption {
    let text = text.into();
    OperationOption::new(move |op| op.summary = Some(text))
}

pub fn description(text: impl Into<String>) -> OperationOption {
    let text = text.into();
    OperationOption::new(move |op| op.description = Some(text))
}

pub fn tag(name: impl Into<String>) -> OperationOption {
    let name = name.into();
    OperationOption::new(move |op| op.tags.push(name))
}

pub fn operation_id(id: impl Into<String>) -> OperationOption {
    let id = id.into();
    OperationOption::new(move |op| op.operation_id = Some(id))
}
