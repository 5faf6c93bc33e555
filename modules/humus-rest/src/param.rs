//! Parameter declarations and the options that shape them.

use http::HeaderMap;
use http::Uri;
use regex::Regex;

use crate::handler::{cookie_value, query_value};
use crate::security::SecurityScheme;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
}

impl ParamLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamLocation::Path => "path",
            ParamLocation::Query => "query",
            ParamLocation::Header => "header",
            ParamLocation::Cookie => "cookie",
        }
    }
}

/// A declared parameter. Path parameters are always required.
#[derive(Debug, Clone)]
pub struct ParamDeclaration {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub pattern: Option<String>,
    pub security: Option<SecurityScheme>,
    pub description: Option<String>,
}

impl ParamDeclaration {
    pub fn new(name: impl Into<String>, location: ParamLocation) -> Self {
        Self {
            name: name.into(),
            location,
            required: location == ParamLocation::Path,
            pattern: None,
            security: None,
            description: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, opts: impl IntoIterator<Item = ParamOption>) -> Self {
        for opt in opts {
            opt.apply(&mut self);
        }
        if self.location == ParamLocation::Path {
            self.required = true;
        }
        self
    }

    /// Reads this parameter's raw value from a request head. Path values come
    /// from the router and are not handled here.
    pub(crate) fn extract(&self, uri: &Uri, headers: &HeaderMap) -> Option<String> {
        match self.location {
            ParamLocation::Query => query_value(uri, &self.name),
            ParamLocation::Header => headers
                .get(self.name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
            ParamLocation::Cookie => cookie_value(headers, &self.name),
            ParamLocation::Path => None,
        }
    }
}

/// Adjusts a [`ParamDeclaration`].
pub struct ParamOption(Box<dyn FnOnce(&mut ParamDeclaration) + Send>);

impl ParamOption {
    fn new(f: impl FnOnce(&mut ParamDeclaration) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn apply(self, decl: &mut ParamDeclaration) {
        (self.0)(decl)
    }
}

pub fn required() -> ParamOption {
    ParamOption::new(|d| d.required = true)
}

/// Values must match `pattern` (unanchored, as in OpenAPI `pattern`).
/// The pattern is compiled when the API is built.
pub fn regex(pattern: impl Into<String>) -> ParamOption {
    let pattern = pattern.into();
    ParamOption::new(move |d| d.pattern = Some(pattern))
}

/// The value of this parameter is a credential checked by `scheme`.
pub fn security(scheme: SecurityScheme) -> ParamOption {
    ParamOption::new(move |d| d.security = Some(scheme))
}

pub fn description(text: impl Into<String>) -> ParamOption {
    let text = text.into();
    ParamOption::new(move |d| d.description = Some(text))
}

/// A declaration with its pattern compiled.
#[derive(Debug, Clone)]
pub(crate) struct CompiledParam {
    pub decl: ParamDeclaration,
    pub regex: Option<Regex>,
}

impl CompiledParam {
    pub fn compile(decl: ParamDeclaration) -> Result<Self, regex::Error> {
        let regex = decl.pattern.as_deref().map(Regex::new).transpose()?;
        Ok(Self { decl, regex })
    }

    pub fn matches(&self, value: &str) -> bool {
        self.regex.as_ref().map_or(true, |re| re.is_match(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_params_are_always_required() {
        let decl = ParamDeclaration::new("id", ParamLocation::Path).with_options([]);
        assert!(decl.required);
        let decl = ParamDeclaration::new("q", ParamLocation::Query).with_options([]);
        assert!(!decl.required);
    }

    #[test]
    fn options_are_applied_in_order() {
        let decl = ParamDeclaration::new("format", ParamLocation::Query)
            .with_options([required(), regex("^(json|xml)$"), description("wire format")]);
        assert!(decl.required);
        assert_eq!(decl.pattern.as_deref(), Some("^(json|xml)$"));
        assert_eq!(decl.description.as_deref(), Some("wire format"));
    }

    #[test]
    fn compiled_pattern_matches_values() {
        let p = CompiledParam::compile(
            ParamDeclaration::new("id", ParamLocation::Path).with_options([regex("^[0-9]+$")]),
        )
        .unwrap();
        assert!(p.matches("42"));
        assert!(!p.matches("abc"));

        let open = CompiledParam::compile(ParamDeclaration::new("q", ParamLocation::Query)).unwrap();
        assert!(open.matches("anything"));
    }

    #[test]
    fn invalid_pattern_fails_to_compile() {
        let decl = ParamDeclaration::new("id", ParamLocation::Path).with_options([regex("([")]);
        assert!(CompiledParam::compile(decl).is_err());
    }

    #[test]
    fn extracts_by_location() {
        let req = http::Request::builder()
            .uri("/x?page=2")
            .header("x-tenant", "acme")
            .header("cookie", "sid=abc")
            .body(())
            .unwrap();
        let (uri, headers) = (req.uri(), req.headers());
        let get = |name: &str, loc| ParamDeclaration::new(name, loc).extract(uri, headers);
        assert_eq!(get("page", ParamLocation::Query).as_deref(), Some("2"));
        assert_eq!(get("x-tenant", ParamLocation::Header).as_deref(), Some("acme"));
        assert_eq!(get("sid", ParamLocation::Cookie).as_deref(), Some("abc"));
        assert_eq!(get("page", ParamLocation::Path), None);
    }
}
