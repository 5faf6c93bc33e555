use anyhow::Result;
use async_trait::async_trait;
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use std::collections::BTreeMap;
use std::future::Future;
use utoipa::openapi::{Ref, RefOr, Schema};

/// A request whose body has been decoded into `T`.
#[derive(Debug)]
pub struct Request<T> {
    parts: Parts,
    path_params: Vec<(String, String)>,
    body: T,
}

impl<T> Request<T> {
    pub fn new(parts: Parts, body: T) -> Self {
        Self {
            parts,
            path_params: Vec::new(),
            body,
        }
    }

    #[must_use]
    pub fn with_path_params(mut self, params: Vec<(String, String)>) -> Self {
        self.path_params = params;
        self
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Values inserted by security verifiers and middleware.
    pub fn extensions(&self) -> &http::Extensions {
        &self.parts.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.parts.extensions
    }

    /// Decoded value of a `{name}` path segment.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First value of a query parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        query_value(&self.parts.uri, name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        cookie_value(&self.parts.headers, name)
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }

    /// Replaces the body, keeping the head and path parameters.
    pub fn map_body<U>(self, f: impl FnOnce(T) -> U) -> Request<U> {
        Request {
            parts: self.parts,
            path_params: self.path_params,
            body: f(self.body),
        }
    }

    pub fn into_parts(self) -> (Parts, T) {
        (self.parts, self.body)
    }
}

/// A response whose body has not been encoded yet.
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: T,
}

impl<T> Response<T> {
    /// `200 OK` with `body`.
    pub fn new(body: T) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn map_body<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        Response {
            status: self.status,
            headers: self.headers,
            body: f(self.body),
        }
    }
}

impl Response<()> {
    pub fn empty() -> Self {
        Self::new(())
    }
}

/// Typed request handler.
///
/// Codec wrappers such as [`crate::ConsumeJson`] adapt one side of the type
/// at a time; once both sides are `Bytes` the handler can back an
/// [`crate::Operation`]. `describe` lets every layer contribute to the
/// OpenAPI operation it serves.
#[async_trait]
pub trait Handler<Req, Resp>: Send + Sync + 'static {
    async fn handle(&self, req: Request<Req>) -> Result<Response<Resp>>;

    fn describe(&self, _doc: &mut OperationDoc) {}
}

/// Handler backed by an async function.
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<Req, Resp, F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Resp>>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<Req, Resp, F, Fut> Handler<Req, Resp> for HandlerFn<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Request<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Resp>>> + Send + 'static,
{
    async fn handle(&self, req: Request<Req>) -> Result<Response<Resp>> {
        (self.f)(req).await
    }
}

#[async_trait]
impl<Req, Resp> Handler<Req, Resp> for std::sync::Arc<dyn Handler<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn handle(&self, req: Request<Req>) -> Result<Response<Resp>> {
        self.as_ref().handle(req).await
    }

    fn describe(&self, doc: &mut OperationDoc) {
        self.as_ref().describe(doc)
    }
}

/// Media type and schema of a request or response body.
#[derive(Debug, Clone)]
pub struct BodyDoc {
    pub content_type: String,
    pub schema: RefOr<Schema>,
}

#[derive(Debug, Clone)]
pub struct ResponseDoc {
    pub description: String,
    pub content: Option<BodyDoc>,
}

/// What a handler stack tells the OpenAPI document about one operation.
#[derive(Debug, Clone, Default)]
pub struct OperationDoc {
    request_body: Option<BodyDoc>,
    responses: BTreeMap<u16, ResponseDoc>,
    schemas: Vec<(String, RefOr<Schema>)>,
}

impl OperationDoc {
    /// Registers `T` (and every schema it references) as a component and
    /// returns a `$ref` to it.
    pub fn schema_ref<T>(&mut self) -> RefOr<Schema>
    where
        T: utoipa::ToSchema + utoipa::PartialSchema + 'static,
    {
        let name = T::name().to_string();
        self.schemas.push((name.clone(), <T as utoipa::PartialSchema>::schema()));
        T::schemas(&mut self.schemas);
        RefOr::Ref(Ref::from_schema_name(name))
    }

    pub fn set_request_body(&mut self, content_type: impl Into<String>, schema: RefOr<Schema>) {
        self.request_body = Some(BodyDoc {
            content_type: content_type.into(),
            schema,
        });
    }

    pub fn set_response(
        &mut self,
        status: StatusCode,
        description: impl Into<String>,
        content: Option<BodyDoc>,
    ) {
        self.responses.insert(
            status.as_u16(),
            ResponseDoc {
                description: description.into(),
                content,
            },
        );
    }

    /// Drops the documented response for `status`, if any.
    pub fn remove_response(&mut self, status: StatusCode) -> Option<ResponseDoc> {
        self.responses.remove(&status.as_u16())
    }

    pub fn request_body(&self) -> Option<&BodyDoc> {
        self.request_body.as_ref()
    }

    pub fn responses(&self) -> impl Iterator<Item = (u16, &ResponseDoc)> {
        self.responses.iter().map(|(k, v)| (*k, v))
    }

    pub fn schemas(&self) -> &[(String, RefOr<Schema>)] {
        &self.schemas
    }
}

pub(crate) fn query_value(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .ok()?
        .into_iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
}

pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"').to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = http::Request::builder().uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn reads_query_header_and_cookie_values() {
        let req = Request::new(
            parts(
                "/users?format=json&name=J%C3%BCrgen&name=other",
                &[("x-tenant", "acme"), ("cookie", "a=1; session=\"abc\"; b=2")],
            ),
            (),
        );
        assert_eq!(req.query_param("format").as_deref(), Some("json"));
        assert_eq!(req.query_param("name").as_deref(), Some("Jürgen"));
        assert_eq!(req.query_param("missing"), None);
        assert_eq!(req.header("x-tenant"), Some("acme"));
        assert_eq!(req.cookie("session").as_deref(), Some("abc"));
        assert_eq!(req.cookie("b").as_deref(), Some("2"));
        assert_eq!(req.cookie("nope"), None);
    }

    #[test]
    fn map_body_keeps_path_params() {
        let req = Request::new(parts("/users/7", &[]), "7")
            .with_path_params(vec![("id".into(), "7".into())]);
        let req = req.map_body(|b| b.parse::<u32>().unwrap());
        assert_eq!(req.path_param("id"), Some("7"));
        assert_eq!(*req.body(), 7);
    }

    #[tokio::test]
    async fn handler_fn_runs_closure() {
        let h = handler_fn(|req: Request<u32>| async move { Ok(Response::new(req.into_body() * 2)) });
        let resp = h.handle(Request::new(parts("/", &[]), 21)).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, 42);
    }

    #[derive(serde::Serialize, utoipa::ToSchema)]
    struct Inner {
        n: u32,
    }

    #[derive(serde::Serialize, utoipa::ToSchema)]
    struct Outer {
        inner: Inner,
    }

    #[test]
    fn schema_ref_collects_nested_components() {
        let mut doc = OperationDoc::default();
        let r = doc.schema_ref::<Outer>();
        assert!(matches!(r, RefOr::Ref(ref r) if r.ref_location == "#/components/schemas/Outer"));
        let names: Vec<_> = doc.schemas().iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"Outer"));
        assert!(names.contains(&"Inner"));
    }
}
