//! Codec wrappers that adapt one side of a [`Handler`] at a time.
//!
//! An operation needs a `Handler<Bytes, Bytes>`. Typed handlers get there by
//! stacking a request codec over a response codec, e.g.
//! `ConsumeJson<ReturnJson<H>>`. Each layer contributes its half of the
//! OpenAPI operation through [`Handler::describe`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, StatusCode};
use minijinja::{AutoEscape, Environment};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use utoipa::{PartialSchema, ToSchema};

use crate::handler::{BodyDoc, Handler, OperationDoc, Request, Response};
use crate::problem::FrameworkError;

pub const APPLICATION_JSON: &str = "application/json";
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const TEXT_HTML: &str = "text/html; charset=utf-8";

/// Decodes a JSON request body into `Req`.
pub struct ConsumeJson<H, Req> {
    inner: H,
    _req: PhantomData<fn() -> Req>,
}

impl<H, Req> ConsumeJson<H, Req> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _req: PhantomData,
        }
    }
}

#[async_trait]
impl<H, Req, Resp> Handler<Bytes, Resp> for ConsumeJson<H, Req>
where
    H: Handler<Req, Resp>,
    Req: DeserializeOwned + ToSchema + Send + 'static,
    Resp: Send + 'static,
{
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Resp>> {
        check_content_type(&req, is_json)?;
        let body = serde_json::from_slice::<Req>(req.body())
            .map_err(|e| FrameworkError::BadRequest(format!("invalid JSON body: {e}")))?;
        self.inner.handle(req.map_body(|_| body)).await
    }

    fn describe(&self, doc: &mut OperationDoc) {
        self.inner.describe(doc);
        let schema = doc.schema_ref::<Req>();
        doc.set_request_body(APPLICATION_JSON, schema);
    }
}

/// Encodes the `Resp` produced by the inner handler as JSON.
pub struct ReturnJson<H, Resp> {
    inner: H,
    _resp: PhantomData<fn() -> Resp>,
}

impl<H, Resp> ReturnJson<H, Resp> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _resp: PhantomData,
        }
    }
}

#[async_trait]
impl<H, Req, Resp> Handler<Req, Bytes> for ReturnJson<H, Resp>
where
    H: Handler<Req, Resp>,
    Req: Send + 'static,
    Resp: Serialize + ToSchema + Send + 'static,
{
    async fn handle(&self, req: Request<Req>) -> Result<Response<Bytes>> {
        let resp = self.inner.handle(req).await?;
        let encoded = serde_json::to_vec(&resp.body).context("failed to encode JSON response")?;
        Ok(with_content_type(resp.map_body(|_| Bytes::from(encoded)), APPLICATION_JSON))
    }

    fn describe(&self, doc: &mut OperationDoc) {
        self.inner.describe(doc);
        let schema = doc.schema_ref::<Resp>();
        doc.set_response(
            StatusCode::OK,
            "OK",
            Some(BodyDoc {
                content_type: APPLICATION_JSON.to_owned(),
                schema,
            }),
        );
    }
}

/// Decodes an `application/x-www-form-urlencoded` body into `Req`.
///
/// Field names follow serde, so `#[serde(rename = "...")]` picks the form key.
pub struct ConsumeForm<H, Req> {
    inner: H,
    _req: PhantomData<fn() -> Req>,
}

impl<H, Req> ConsumeForm<H, Req> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _req: PhantomData,
        }
    }
}

#[async_trait]
impl<H, Req, Resp> Handler<Bytes, Resp> for ConsumeForm<H, Req>
where
    H: Handler<Req, Resp>,
    Req: DeserializeOwned + ToSchema + Send + 'static,
    Resp: Send + 'static,
{
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Resp>> {
        check_content_type(&req, |essence| essence == FORM_URLENCODED)?;
        let body = serde_urlencoded::from_bytes::<Req>(req.body())
            .map_err(|e| FrameworkError::BadRequest(format!("invalid form body: {e}")))?;
        self.inner.handle(req.map_body(|_| body)).await
    }

    fn describe(&self, doc: &mut OperationDoc) {
        self.inner.describe(doc);
        let schema = doc.schema_ref::<Req>();
        doc.set_request_body(FORM_URLENCODED, schema);
    }
}

/// A template parsed once at startup and rendered per request.
///
/// Output is always HTML-escaped regardless of the template name.
#[derive(Clone)]
pub struct HtmlTemplate {
    env: Arc<Environment<'static>>,
    name: String,
}

impl HtmlTemplate {
    pub fn parse(name: impl Into<String>, source: impl Into<String>) -> Result<Self, minijinja::Error> {
        let name = name.into();
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.add_template_owned(name.clone(), source.into())?;
        Ok(Self {
            env: Arc::new(env),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render<T: Serialize>(&self, value: &T) -> Result<String, minijinja::Error> {
        self.env.get_template(&self.name)?.render(value)
    }
}

impl fmt::Debug for HtmlTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtmlTemplate").field("name", &self.name).finish()
    }
}

/// Renders the inner handler's value through an [`HtmlTemplate`].
pub struct ReturnHtml<H, Resp> {
    template: HtmlTemplate,
    inner: H,
    _resp: PhantomData<fn() -> Resp>,
}

impl<H, Resp> ReturnHtml<H, Resp> {
    pub fn new(template: HtmlTemplate, inner: H) -> Self {
        Self {
            template,
            inner,
            _resp: PhantomData,
        }
    }
}

#[async_trait]
impl<H, Req, Resp> Handler<Req, Bytes> for ReturnHtml<H, Resp>
where
    H: Handler<Req, Resp>,
    Req: Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn handle(&self, req: Request<Req>) -> Result<Response<Bytes>> {
        let resp = self.inner.handle(req).await?;
        let html = self
            .template
            .render(&resp.body)
            .with_context(|| format!("failed to render template {}", self.template.name))?;
        Ok(with_content_type(resp.map_body(|_| Bytes::from(html)), TEXT_HTML))
    }

    fn describe(&self, doc: &mut OperationDoc) {
        self.inner.describe(doc);
        doc.set_response(
            StatusCode::OK,
            "OK",
            Some(BodyDoc {
                content_type: TEXT_HTML.to_owned(),
                schema: String::schema(),
            }),
        );
    }
}

/// Ignores the request body and hands `()` to the inner handler.
pub struct NoBody<H> {
    inner: H,
}

impl<H> NoBody<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H, Resp> Handler<Bytes, Resp> for NoBody<H>
where
    H: Handler<(), Resp>,
    Resp: Send + 'static,
{
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Resp>> {
        self.inner.handle(req.map_body(|_| ())).await
    }

    fn describe(&self, doc: &mut OperationDoc) {
        self.inner.describe(doc);
    }
}

/// Sends an empty body. A plain `200` from the inner handler becomes `204`.
pub struct NoContent<H> {
    inner: H,
}

impl<H> NoContent<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H, Req> Handler<Req, Bytes> for NoContent<H>
where
    H: Handler<Req, ()>,
    Req: Send + 'static,
{
    async fn handle(&self, req: Request<Req>) -> Result<Response<Bytes>> {
        let mut resp = self.inner.handle(req).await?.map_body(|()| Bytes::new());
        if resp.status == StatusCode::OK {
            resp.status = StatusCode::NO_CONTENT;
        }
        Ok(resp)
    }

    fn describe(&self, doc: &mut OperationDoc) {
        self.inner.describe(doc);
        doc.remove_response(StatusCode::OK);
        doc.set_response(StatusCode::NO_CONTENT, "No Content", None);
    }
}

/// Rejects a body whose declared media type `accepts` refuses. A body
/// without a Content-Type is decoded as-is.
fn check_content_type(req: &Request<Bytes>, accepts: impl Fn(&str) -> bool) -> Result<(), FrameworkError> {
    let Some(value) = req.headers().get(header::CONTENT_TYPE) else {
        return Ok(());
    };
    let declared = value.to_str().unwrap_or_default();
    let essence = declared.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    if accepts(&essence) {
        Ok(())
    } else {
        Err(FrameworkError::UnsupportedMediaType(declared.to_owned()))
    }
}

/// `application/json` and structured `application/*+json` types.
fn is_json(essence: &str) -> bool {
    essence == APPLICATION_JSON || (essence.starts_with("application/") && essence.ends_with("+json"))
}

fn with_content_type(mut resp: Response<Bytes>, content_type: &'static str) -> Response<Bytes> {
    resp.headers
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static(content_type));
    resp
}

/// JSON in, JSON out.
pub fn handle_json<Req, Resp, H>(handler: H) -> ConsumeJson<ReturnJson<H, Resp>, Req>
where
    H: Handler<Req, Resp>,
    Req: DeserializeOwned + ToSchema + Send + 'static,
    Resp: Serialize + ToSchema + Send + 'static,
{
    ConsumeJson::new(ReturnJson::new(handler))
}

/// No request body, JSON out.
pub fn produce_json<Resp, H>(handler: H) -> NoBody<ReturnJson<H, Resp>>
where
    H: Handler<(), Resp>,
    Resp: Serialize + ToSchema + Send + 'static,
{
    NoBody::new(ReturnJson::new(handler))
}

/// JSON in, `204 No Content` out.
pub fn consume_only_json<Req, H>(handler: H) -> ConsumeJson<NoContent<H>, Req>
where
    H: Handler<Req, ()>,
    Req: DeserializeOwned + ToSchema + Send + 'static,
{
    ConsumeJson::new(NoContent::new(handler))
}

/// Form in, rendered HTML out.
pub fn handle_form<Req, Resp, H>(
    template: HtmlTemplate,
    handler: H,
) -> ConsumeForm<ReturnHtml<H, Resp>, Req>
where
    H: Handler<Req, Resp>,
    Req: DeserializeOwned + ToSchema + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    ConsumeForm::new(ReturnHtml::new(template, handler))
}

/// No request body, rendered HTML out.
pub fn produce_html<Resp, H>(template: HtmlTemplate, handler: H) -> NoBody<ReturnHtml<H, Resp>>
where
    H: Handler<(), Resp>,
    Resp: Serialize + Send + 'static,
{
    NoBody::new(ReturnHtml::new(template, handler))
}

pub fn return_html<Req, Resp, H>(template: HtmlTemplate, handler: H) -> ReturnHtml<H, Resp>
where
    H: Handler<Req, Resp>,
    Req: Send + 'static,
    Resp: Serialize + Send + 'static,
{
    ReturnHtml::new(template, handler)
}
