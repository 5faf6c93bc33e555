use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use http::{header, Method, StatusCode};
use http_body_util::BodyExt;
use humus::health::{monitor_fn, Binary};
use humus_rest::codec::{consume_only_json, handle_json, produce_json};
use humus_rest::problem::{ProblemCarrier, APPLICATION_PROBLEM_JSON, INTERNAL_DETAIL};
use humus_rest::security::verifier_fn;
use humus_rest::{
    api, handler_fn, operation, param, Api, ApiError, Credential, Operation, PathBuilder,
    ProblemDetail, ProblemError, Request, Response, SecurityScheme, REQUEST_ID_HEADER,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, Serialize, ToSchema)]
struct CreateUserRequest {
    name: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct User {
    id: u64,
    name: String,
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ValidationError {
    #[serde(flatten)]
    problem: ProblemDetail,
    validation_errors: Vec<FieldError>,
}

impl ProblemCarrier for ValidationError {
    fn problem(&self) -> &ProblemDetail {
        &self.problem
    }
}

async fn create_user(req: Request<CreateUserRequest>) -> anyhow::Result<Response<User>> {
    let body = req.into_body();
    if body.email.is_none() {
        return Err(ProblemError::new(ValidationError {
            problem: ProblemDetail::new(400, "Validation Failed", "Request validation failed")
                .with_type("https://example.com/errors/validation"),
            validation_errors: vec![FieldError {
                field: "email".into(),
                message: "Email is required".into(),
            }],
        })
        .into());
    }
    Ok(Response::new(User {
        id: 1,
        name: body.name,
    })
    .with_status(StatusCode::CREATED))
}

async fn show_user(req: Request<()>) -> anyhow::Result<Response<User>> {
    let id: u64 = req.path_param("id").unwrap_or_default().parse()?;
    Ok(Response::new(User {
        id,
        name: "ada".into(),
    }))
}

async fn leaky(_req: Request<CreateUserRequest>) -> anyhow::Result<Response<User>> {
    anyhow::bail!("database failed: password=secret123")
}

struct Reply {
    status: StatusCode,
    headers: http::HeaderMap,
    body: Bytes,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn content_type(&self) -> &str {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }
}

async fn send(router: &Router, req: http::Request<Body>) -> Reply {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    Reply {
        status,
        headers,
        body,
    }
}

fn post_json(uri: &str, body: Value) -> http::Request<Body> {
    http::Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> http::Request<Body> {
    http::Request::get(uri).body(Body::empty()).unwrap()
}

fn users_api(calls: Arc<AtomicUsize>) -> Api {
    let handler = handle_json(handler_fn(move |req: Request<CreateUserRequest>| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            create_user(req).await
        }
    }));
    Api::new("users", "1.0.0").with(api::operation(
        Operation::new(Method::POST, PathBuilder::new("/users"), handler).options([
            operation::query_param(
                "format",
                [param::required(), param::regex("^(json|yaml)$")],
            ),
            operation::summary("Create a user"),
            operation::tag("users"),
        ]),
    ))
}

#[tokio::test]
async fn typed_problem_passes_through_verbatim() {
    let router = users_api(Arc::new(AtomicUsize::new(0))).build().unwrap().router;

    let reply = send(&router, post_json("/users?format=json", json!({ "name": "x" }))).await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.content_type(), APPLICATION_PROBLEM_JSON);
    assert_eq!(
        reply.json(),
        json!({
            "type": "https://example.com/errors/validation",
            "title": "Validation Failed",
            "status": 400,
            "detail": "Request validation failed",
            "validation_errors": [{ "field": "email", "message": "Email is required" }]
        })
    );
}

#[tokio::test]
async fn untyped_errors_are_redacted() {
    let router = Api::new("users", "1.0.0")
        .with(api::operation(Operation::new(
            Method::POST,
            PathBuilder::new("/users"),
            handle_json(handler_fn(leaky)),
        )))
        .build()
        .unwrap()
        .router;

    let reply = send(&router, post_json("/users", json!({ "name": "x" }))).await;

    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply.json()["detail"], INTERNAL_DETAIL);
    assert!(!String::from_utf8_lossy(&reply.body).contains("password"));
}

#[tokio::test]
async fn json_round_trip_through_handler() {
    let router = users_api(Arc::new(AtomicUsize::new(0))).build().unwrap().router;

    let reply = send(
        &router,
        post_json("/users?format=yaml", json!({ "name": "ada", "email": "ada@example.com" })),
    )
    .await;

    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.content_type(), "application/json");
    assert_eq!(reply.json(), json!({ "id": 1, "name": "ada" }));
    assert!(reply.headers.contains_key(REQUEST_ID_HEADER));
}

#[tokio::test]
async fn invalid_or_missing_query_param_is_rejected_before_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let router = users_api(calls.clone()).build().unwrap().router;
    let body = json!({ "name": "ada", "email": "a@b.c" });

    let reply = send(&router, post_json("/users?format=xml", body.clone())).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.content_type(), APPLICATION_PROBLEM_JSON);

    let reply = send(&router, post_json("/users", body)).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let router = users_api(Arc::new(AtomicUsize::new(0))).build().unwrap().router;
    let req = http::Request::post("/users?format=json")
        .body(Body::from("{oops"))
        .unwrap();

    let reply = send(&router, req).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["title"], "Bad Request");
}

#[tokio::test]
async fn non_json_content_type_is_unsupported() {
    let calls = Arc::new(AtomicUsize::new(0));
    let router = users_api(calls.clone()).build().unwrap().router;
    let req = http::Request::post("/users?format=json")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(r#"{"name":"ada"}"#))
        .unwrap();

    let reply = send(&router, req).await;
    assert_eq!(reply.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(reply.json()["title"], "Unsupported Media Type");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn openapi_document_describes_the_operation() {
    let router = users_api(Arc::new(AtomicUsize::new(0))).build().unwrap().router;

    let reply = send(&router, get("/openapi.json")).await;
    assert_eq!(reply.status, StatusCode::OK);
    let doc = reply.json();

    assert_eq!(doc["info"]["title"], "users");
    assert_eq!(doc["info"]["version"], "1.0.0");
    assert_eq!(doc["paths"].as_object().unwrap().len(), 1);
    assert_eq!(doc["paths"]["/users"].as_object().unwrap().len(), 1);

    let post = &doc["paths"]["/users"]["post"];
    assert_eq!(post["summary"], "Create a user");
    assert_eq!(
        post["requestBody"]["content"]["application/json"]["schema"]["$ref"],
        "#/components/schemas/CreateUserRequest"
    );
    assert_eq!(
        post["responses"]["200"]["content"]["application/json"]["schema"]["$ref"],
        "#/components/schemas/User"
    );

    let params = post["parameters"].as_array().unwrap();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0]["name"], "format");
    assert_eq!(params[0]["in"], "query");
    assert_eq!(params[0]["required"], true);
    assert_eq!(params[0]["schema"]["pattern"], "^(json|yaml)$");

    let schemas = &doc["components"]["schemas"];
    assert!(schemas["CreateUserRequest"]["properties"]["name"].is_object());
    assert!(schemas["User"]["properties"]["id"].is_object());
    assert!(schemas["ProblemDetail"].is_object());
}

#[tokio::test]
async fn path_params_are_routed_and_validated() {
    let show = produce_json(handler_fn(show_user));
    let built = Api::new("users", "1.0.0")
        .with(api::operation(Operation::new(
            Method::GET,
            PathBuilder::new("/users").param("id", [param::regex("^[0-9]+$")]),
            show,
        )))
        .build()
        .unwrap();

    let reply = send(&built.router, get("/users/42")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["id"], 42);

    let reply = send(&built.router, get("/users/abc")).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.content_type(), APPLICATION_PROBLEM_JSON);

    let doc = serde_json::to_value(&built.document).unwrap();
    let params = &doc["paths"]["/users/{id}"]["get"]["parameters"];
    assert_eq!(params[0]["name"], "id");
    assert_eq!(params[0]["in"], "path");
    assert_eq!(params[0]["required"], true);
}

#[tokio::test]
async fn unknown_path_and_method_use_fallbacks() {
    let router = users_api(Arc::new(AtomicUsize::new(0))).build().unwrap().router;

    let reply = send(&router, get("/nope")).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.json()["title"], "Not Found");

    let reply = send(&router, get("/users")).await;
    assert_eq!(reply.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(reply.headers[header::ALLOW], "POST");
    assert_eq!(reply.json()["status"], 405);
}

#[tokio::test]
async fn custom_not_found_handler() {
    let router = Api::new("t", "1")
        .with(api::not_found(handler_fn(|_: Request<Bytes>| async move {
            Ok(Response::new(Bytes::from_static(b"gone fishing")).with_status(StatusCode::NOT_FOUND))
        })))
        .build()
        .unwrap()
        .router;

    let reply = send(&router, get("/missing")).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(&reply.body[..], b"gone fishing");
}

#[tokio::test]
async fn health_probes_follow_monitors() {
    let ready = Arc::new(Binary::new());
    let router = Api::new("t", "1")
        .options([
            api::readiness(ready.clone()),
            api::liveness(monitor_fn(|| async { Err::<bool, _>(anyhow::anyhow!("disk on fire")) })),
        ])
        .build()
        .unwrap()
        .router;

    assert_eq!(send(&router, get("/health/readiness")).await.status, StatusCode::SERVICE_UNAVAILABLE);
    ready.mark_healthy();
    assert_eq!(send(&router, get("/health/readiness")).await.status, StatusCode::OK);
    assert_eq!(send(&router, get("/health/liveness")).await.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[derive(Debug, Clone)]
struct Subject(String);

#[derive(Debug, Serialize, ToSchema)]
struct Whoami {
    subject: String,
}

async fn whoami(req: Request<()>) -> anyhow::Result<Response<Whoami>> {
    let subject = req
        .extensions()
        .get::<Subject>()
        .map(|s| s.0.clone())
        .unwrap_or_default();
    Ok(Response::new(Whoami { subject }))
}

fn secured_api() -> Api {
    let scheme = SecurityScheme::jwt(
        "bearerAuth",
        verifier_fn(|cred, ext| match cred {
            Credential::Bearer(token) if token == "good" => {
                ext.insert(Subject("user-1".into()));
                Ok(())
            }
            _ => anyhow::bail!("token rejected"),
        }),
    );
    Api::new("secure", "1").with(api::operation(
        Operation::new(Method::GET, PathBuilder::new("/me"), produce_json(handler_fn(whoami)))
            .with(operation::header_param("Authorization", [param::security(scheme)])),
    ))
}

#[tokio::test]
async fn security_scheme_guards_the_operation() {
    let router = secured_api().build().unwrap().router;

    let reply = send(&router, get("/me")).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert!(!String::from_utf8_lossy(&reply.body).contains("token rejected"));

    let req = http::Request::get("/me")
        .header(header::AUTHORIZATION, "Bearer bad")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&router, req).await.status, StatusCode::UNAUTHORIZED);

    let req = http::Request::get("/me")
        .header(header::AUTHORIZATION, "Bearer good")
        .body(Body::empty())
        .unwrap();
    let reply = send(&router, req).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["subject"], "user-1");
}

#[tokio::test]
async fn security_is_documented() {
    let doc = serde_json::to_value(secured_api().build().unwrap().document).unwrap();

    let scheme = &doc["components"]["securitySchemes"]["bearerAuth"];
    assert_eq!(scheme["type"], "http");
    assert_eq!(scheme["scheme"], "bearer");
    assert_eq!(scheme["bearerFormat"], "JWT");

    let op = &doc["paths"]["/me"]["get"];
    assert_eq!(op["security"], json!([{ "bearerAuth": [] }]));
    assert!(op.get("parameters").map_or(true, |p| p.as_array().map_or(true, Vec::is_empty)));
}

#[tokio::test]
async fn operation_error_handler_overrides_default() {
    let router = Api::new("t", "1")
        .with(api::operation(
            Operation::new(Method::POST, PathBuilder::new("/users"), handle_json(handler_fn(leaky))).with(
                operation::on_error(|_err: anyhow::Error| {
                    axum::response::IntoResponse::into_response(StatusCode::SERVICE_UNAVAILABLE)
                }),
            ),
        ))
        .build()
        .unwrap()
        .router;

    let reply = send(&router, post_json("/users", json!({ "name": "x" }))).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn consume_only_json_returns_no_content() {
    let router = Api::new("t", "1")
        .with(api::operation(Operation::new(
            Method::PUT,
            PathBuilder::new("/users"),
            consume_only_json(handler_fn(|_: Request<CreateUserRequest>| async move {
                Ok(Response::empty())
            })),
        )))
        .build()
        .unwrap()
        .router;

    let req = http::Request::put("/users")
        .body(Body::from(r#"{"name":"x"}"#))
        .unwrap();
    let reply = send(&router, req).await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);
    assert!(reply.body.is_empty());
}

#[tokio::test]
async fn body_limit_is_enforced() {
    let router = users_api(Arc::new(AtomicUsize::new(0)))
        .with(api::body_limit(8))
        .build()
        .unwrap()
        .router;

    let reply = send(
        &router,
        post_json("/users?format=json", json!({ "name": "a rather long name" })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
}

fn noop() -> impl humus_rest::Handler<Bytes, Bytes> {
    handler_fn(|_: Request<Bytes>| async move { Ok(Response::new(Bytes::new())) })
}

#[test]
fn duplicate_routes_fail_the_build() {
    let err = Api::new("t", "1")
        .options([
            api::operation(Operation::new(Method::GET, PathBuilder::new("/a"), noop())),
            api::operation(Operation::new(Method::GET, PathBuilder::new("/a"), noop())),
        ])
        .build()
        .unwrap_err();
    assert!(matches!(err, ApiError::DuplicateRoute { ref path, .. } if path == "/a"));

    let err = Api::new("t", "1")
        .with(api::operation(Operation::new(
            Method::GET,
            PathBuilder::new("/openapi.json"),
            noop(),
        )))
        .build()
        .unwrap_err();
    assert!(matches!(err, ApiError::DuplicateRoute { .. }));
}

#[test]
fn same_path_different_methods_is_fine() {
    Api::new("t", "1")
        .options([
            api::operation(Operation::new(Method::GET, PathBuilder::new("/a"), noop())),
            api::operation(Operation::new(Method::DELETE, PathBuilder::new("/a"), noop())),
        ])
        .build()
        .unwrap();
}

#[test]
fn bad_declarations_fail_the_build() {
    let err = Api::new("t", "1")
        .with(api::operation(
            Operation::new(Method::GET, PathBuilder::new("/a"), noop())
                .with(operation::query_param("q", [param::regex("([")])),
        ))
        .build()
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidRegex { ref param, .. } if param == "q"));

    let err = Api::new("t", "1")
        .options([
            api::operation(Operation::new(
                Method::GET,
                PathBuilder::new("/u").param("id", []),
                noop(),
            )),
            api::operation(Operation::new(
                Method::POST,
                PathBuilder::new("/u").param("name", []),
                noop(),
            )),
        ])
        .build()
        .unwrap_err();
    assert!(matches!(err, ApiError::ConflictingPath { .. }));

    let err = Api::new("t", "1")
        .with(api::operation(Operation::new(
            Method::from_bytes(b"PURGE").unwrap(),
            PathBuilder::new("/a"),
            noop(),
        )))
        .build()
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidMethod(_)));
}
