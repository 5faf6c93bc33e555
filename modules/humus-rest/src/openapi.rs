//! OpenAPI document assembly from registered operations.

use http::Method;
use std::collections::BTreeMap;
use utoipa::openapi::content::{Content, ContentBuilder};
use utoipa::openapi::info::InfoBuilder;
use utoipa::openapi::path::{
    HttpMethod, OperationBuilder as OpBuilder, Parameter, ParameterBuilder, ParameterIn,
    PathItemBuilder, PathsBuilder,
};
use utoipa::openapi::request_body::RequestBodyBuilder;
use utoipa::openapi::response::{ResponseBuilder, ResponsesBuilder};
use utoipa::openapi::schema::{ComponentsBuilder, ObjectBuilder, Schema, SchemaType, Type};
use utoipa::openapi::security::{SecurityRequirement, SecurityScheme};
use utoipa::openapi::{OpenApi, OpenApiBuilder, RefOr, Required};

use crate::handler::OperationDoc;
use crate::operation::Operation;
use crate::param::{ParamDeclaration, ParamLocation};
use crate::problem::{ProblemDetail, APPLICATION_PROBLEM_JSON};

pub(crate) fn http_method(method: &Method) -> Option<HttpMethod> {
    Some(match *method {
        Method::GET => HttpMethod::Get,
        Method::POST => HttpMethod::Post,
        Method::PUT => HttpMethod::Put,
        Method::DELETE => HttpMethod::Delete,
        Method::PATCH => HttpMethod::Patch,
        Method::HEAD => HttpMethod::Head,
        Method::OPTIONS => HttpMethod::Options,
        Method::TRACE => HttpMethod::Trace,
        _ => return None,
    })
}

fn content(schema: &RefOr<Schema>) -> Content {
    ContentBuilder::new().schema(Some(schema.clone())).build()
}

fn parameter(param: &ParamDeclaration) -> Parameter {
    let location = match param.location {
        ParamLocation::Path => ParameterIn::Path,
        ParamLocation::Query => ParameterIn::Query,
        ParamLocation::Header => ParameterIn::Header,
        ParamLocation::Cookie => ParameterIn::Cookie,
    };
    let schema = ObjectBuilder::new()
        .schema_type(SchemaType::Type(Type::String))
        .pattern(param.pattern.clone())
        .build();
    ParameterBuilder::new()
        .name(&param.name)
        .parameter_in(location)
        .required(if param.required {
            Required::True
        } else {
            Required::False
        })
        .description(param.description.clone())
        .schema(Some(Schema::Object(schema)))
        .build()
}

/// Builds the document for `operations`. Operations with a method OpenAPI
/// cannot express are skipped; `Api::build` rejects them earlier.
pub(crate) fn document(title: &str, version: &str, operations: &[Operation]) -> OpenApi {
    let mut items: BTreeMap<String, PathItemBuilder> = BTreeMap::new();
    let mut schemas: BTreeMap<String, RefOr<Schema>> = BTreeMap::new();
    let mut schemes: BTreeMap<String, SecurityScheme> = BTreeMap::new();

    let mut problem_doc = OperationDoc::default();
    let problem = problem_doc.schema_ref::<ProblemDetail>();
    let default_response = ResponseBuilder::new()
        .description("Problem details")
        .content(APPLICATION_PROBLEM_JSON, content(&problem))
        .build();

    for op in operations {
        let Some(method) = http_method(&op.method) else {
            continue;
        };

        let mut doc = OperationDoc::default();
        op.handler.describe(&mut doc);
        for (name, schema) in doc.schemas() {
            schemas.entry(name.clone()).or_insert_with(|| schema.clone());
        }

        let mut builder = OpBuilder::new()
            .operation_id(op.operation_id.clone())
            .summary(op.summary.clone())
            .description(op.description.clone());
        for tag in &op.tags {
            builder = builder.tag(tag.clone());
        }

        // Credentials are documented as security requirements, not parameters.
        let mut requirement: Option<SecurityRequirement> = None;
        for param in op.all_params() {
            match &param.security {
                Some(scheme) => {
                    schemes
                        .entry(scheme.name().to_owned())
                        .or_insert_with(|| scheme.to_openapi(&param.name, param.location));
                    requirement = Some(match requirement {
                        None => SecurityRequirement::new(scheme.name(), Vec::<String>::new()),
                        Some(req) => req.add(scheme.name(), Vec::<String>::new()),
                    });
                }
                None => builder = builder.parameter(parameter(param)),
            }
        }
        if let Some(requirement) = requirement {
            builder = builder.security(requirement);
        }

        if let Some(body) = doc.request_body() {
            builder = builder.request_body(Some(
                RequestBodyBuilder::new()
                    .content(body.content_type.clone(), content(&body.schema))
                    .required(Some(Required::True))
                    .build(),
            ));
        }

        let mut responses = ResponsesBuilder::new();
        for (status, response) in doc.responses() {
            let mut r = ResponseBuilder::new().description(response.description.clone());
            if let Some(body) = &response.content {
                r = r.content(body.content_type.clone(), content(&body.schema));
            }
            responses = responses.response(status.to_string(), r.build());
        }
        responses = responses.response("default", default_response.clone());
        builder = builder.responses(responses.build());

        let pattern = op.path.pattern();
        let item = items
            .remove(&pattern)
            .unwrap_or_else(PathItemBuilder::new)
            .operation(method, builder.build());
        items.insert(pattern, item);
    }

    for (name, schema) in problem_doc.schemas() {
        schemas.entry(name.clone()).or_insert_with(|| schema.clone());
    }

    let paths = items
        .into_iter()
        .fold(PathsBuilder::new(), |paths, (path, item)| paths.path(path, item.build()));
    let components = schemas
        .into_iter()
        .fold(ComponentsBuilder::new(), |c, (name, schema)| c.schema(name, schema));
    let components = schemes
        .into_iter()
        .fold(components, |c, (name, scheme)| c.security_scheme(name, scheme));

    OpenApiBuilder::new()
        .info(InfoBuilder::new().title(title).version(version).build())
        .paths(paths.build())
        .components(Some(components.build()))
        .build()
}
